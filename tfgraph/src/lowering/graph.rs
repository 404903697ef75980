//! The serializable dataflow graph produced by lowering.

use crate::ir::DataType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A set of graph functions keyed by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    functions: BTreeMap<String, FunctionDef>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `def`, returning the function it replaces if the name was taken.
    pub fn insert(&mut self, def: FunctionDef) -> Option<FunctionDef> {
        self.functions.insert(def.name.clone(), def)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.functions.values()
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Copies in every function of `other` not already present.
    pub fn merge_from(&mut self, other: &Graph) {
        for (name, def) in &other.functions {
            self.functions
                .entry(name.clone())
                .or_insert_with(|| def.clone());
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub inputs: Vec<ArgDef>,
    pub outputs: Vec<ArgDef>,
    pub nodes: Vec<NodeDef>,
    /// Output name to the tensor returned under it.
    pub ret: BTreeMap<String, String>,
}

impl FunctionDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn nodes_of<'a>(&'a self, op: &'a str) -> impl Iterator<Item = &'a NodeDef> + 'a {
        self.nodes.iter().filter(move |n| n.op == op)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDef {
    pub name: String,
    pub dtype: DataType,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    /// Names of the node or argument tensors feeding this node.
    pub inputs: Vec<String>,
    pub device: String,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl NodeDef {
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TensorValues {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl TensorValues {
    pub fn len(&self) -> usize {
        match self {
            TensorValues::Int(v) => v.len(),
            TensorValues::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Type(DataType),
    Shape(Vec<i64>),
    List(Vec<AttrValue>),
    ShapeList(Vec<Vec<i64>>),
    Tensor {
        dtype: DataType,
        shape: Vec<i64>,
        values: TensorValues,
    },
    /// Name of a graph function.
    Func(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}
