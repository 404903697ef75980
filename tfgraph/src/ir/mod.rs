//! The single-block SSA representation handed over by the host compiler.
//!
//! Instructions live in an arena owned by their [`Function`] and are addressed
//! by [`InstId`]. Every instruction defines at most one value, so an `InstId`
//! doubles as the id of the value it defines. Program order is tracked
//! separately from the arena, which lets passes insert and erase instructions
//! without invalidating ids.

use anyhow::{Result, bail, ensure};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

mod builder;
mod constant;
mod types;

pub use builder::FunctionBuilder;
pub use constant::{ArrayElements, ConstantValue};
pub use types::{DataType, Location, ValueType};

/// Name prefix marking a builtin as a tensor operation.
pub const TFOP_PREFIX: &str = "__tfop_";

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[display("%{_0}")]
pub struct InstId(pub usize);

/// Values are identified by the instruction defining them.
pub type ValueId = InstId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InstKind {
    Param {
        index: usize,
        ty: ValueType,
    },
    IntLiteral {
        value: i64,
        dtype: DataType,
    },
    FloatLiteral {
        value: f64,
        dtype: DataType,
    },
    StringLiteral(String),
    Metatype(ValueType),
    /// Reference to another function of the program, by host name.
    FunctionRef(String),
    /// Allocates an array of `len` uninitialized slots.
    ArrayAlloc {
        len: usize,
        element: ValueType,
    },
    /// Functional update: a copy of `array` with slot `index` set to `element`.
    ArrayInsert {
        array: ValueId,
        index: usize,
        element: ValueId,
    },
    Builtin {
        name: String,
        operands: Vec<ValueId>,
        result: ValueType,
    },
    /// Releases a value that is no longer used.
    Destroy {
        value: ValueId,
    },
    Return {
        values: Vec<ValueId>,
    },
}

impl InstKind {
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            InstKind::ArrayInsert { array, element, .. } => vec![*array, *element],
            InstKind::Builtin { operands, .. } => operands.clone(),
            InstKind::Destroy { value } => vec![*value],
            InstKind::Return { values } => values.clone(),
            _ => vec![],
        }
    }

    /// Returns a copy of this instruction with every operand passed through `f`.
    pub fn map_operands(&self, mut f: impl FnMut(ValueId) -> ValueId) -> InstKind {
        match self {
            InstKind::ArrayInsert {
                array,
                index,
                element,
            } => InstKind::ArrayInsert {
                array: f(*array),
                index: *index,
                element: f(*element),
            },
            InstKind::Builtin {
                name,
                operands,
                result,
            } => InstKind::Builtin {
                name: name.clone(),
                operands: operands.iter().map(|v| f(*v)).collect(),
                result: result.clone(),
            },
            InstKind::Destroy { value } => InstKind::Destroy { value: f(*value) },
            InstKind::Return { values } => InstKind::Return {
                values: values.iter().map(|v| f(*v)).collect(),
            },
            other => other.clone(),
        }
    }

    /// Returns the op mnemonic if this is a tensor operation, i.e. the builtin
    /// name with the tensor-op prefix stripped.
    pub fn tensor_op_mnemonic(&self) -> Option<&str> {
        match self {
            InstKind::Builtin { name, .. } => name.strip_prefix(TFOP_PREFIX),
            _ => None,
        }
    }

    /// The op name of a tensor operation, without its operand tokens.
    pub fn tensor_op_name(&self) -> Option<&str> {
        self.tensor_op_mnemonic()
            .and_then(|mnemonic| mnemonic.split(',').next())
    }

    /// Literals and other values that can be recreated anywhere they are needed.
    pub fn is_rematerializable(&self) -> bool {
        match self {
            InstKind::IntLiteral { .. }
            | InstKind::FloatLiteral { .. }
            | InstKind::StringLiteral(_)
            | InstKind::Metatype(_)
            | InstKind::FunctionRef(_)
            | InstKind::ArrayAlloc { .. }
            | InstKind::ArrayInsert { .. } => true,
            InstKind::Builtin { .. } => self.tensor_op_mnemonic().is_none(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inst {
    pub kind: InstKind,
    #[serde(default)]
    pub loc: Location,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    insts: Vec<Inst>,
    order: Vec<InstId>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0]
    }

    pub fn kind(&self, id: InstId) -> &InstKind {
        &self.insts[id.0].kind
    }

    pub fn loc(&self, id: InstId) -> &Location {
        &self.insts[id.0].loc
    }

    /// Live instructions in program order.
    pub fn iter(&self) -> impl Iterator<Item = InstId> + '_ {
        self.order.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_live(&self, id: InstId) -> bool {
        self.order.contains(&id)
    }

    pub fn append(&mut self, kind: InstKind, loc: Location) -> InstId {
        let id = self.alloc(kind, loc);
        self.order.push(id);
        id
    }

    /// Inserts a new instruction right before `anchor` in program order.
    pub fn insert_before(&mut self, anchor: InstId, kind: InstKind, loc: Location) -> InstId {
        let id = self.alloc(kind, loc);
        let pos = self
            .position(anchor)
            .unwrap_or_else(|| panic!("anchor {anchor} is not a live instruction"));
        self.order.insert(pos, id);
        id
    }

    /// Replaces an instruction in place, keeping its id, position and location.
    pub fn replace(&mut self, id: InstId, kind: InstKind) {
        self.insts[id.0].kind = kind;
    }

    /// Removes an instruction from program order. Its arena slot is kept so
    /// that ids stay stable.
    pub fn erase(&mut self, id: InstId) {
        self.order.retain(|i| *i != id);
    }

    pub fn operands(&self, id: InstId) -> Vec<ValueId> {
        self.kind(id).operands()
    }

    /// Live instructions using `value`, in program order.
    pub fn users(&self, value: ValueId) -> Vec<InstId> {
        self.iter()
            .filter(|id| self.kind(*id).operands().contains(&value))
            .collect()
    }

    pub fn result_type(&self, value: ValueId) -> ValueType {
        match self.kind(value) {
            InstKind::Param { ty, .. } => ty.clone(),
            InstKind::IntLiteral { dtype, .. } | InstKind::FloatLiteral { dtype, .. } => {
                ValueType::Scalar(*dtype)
            }
            InstKind::StringLiteral(_) => ValueType::Str,
            InstKind::Metatype(_) => ValueType::Metatype,
            InstKind::FunctionRef(_) => ValueType::Function,
            InstKind::ArrayAlloc { element, .. } => ValueType::Array(Box::new(element.clone())),
            InstKind::ArrayInsert { array, .. } => self.result_type(*array),
            InstKind::Builtin { result, .. } => result.clone(),
            InstKind::Destroy { .. } | InstKind::Return { .. } => ValueType::Unit,
        }
    }

    pub fn params(&self) -> Vec<InstId> {
        self.iter()
            .filter(|id| matches!(self.kind(*id), InstKind::Param { .. }))
            .sorted_by_key(|id| match self.kind(*id) {
                InstKind::Param { index, .. } => *index,
                _ => unreachable!(),
            })
            .collect()
    }

    pub fn return_inst(&self) -> Option<InstId> {
        self.order
            .last()
            .copied()
            .filter(|id| matches!(self.kind(*id), InstKind::Return { .. }))
    }

    /// Checks that every operand refers to a live instruction defined earlier
    /// in program order, that parameters are numbered densely and that the
    /// function ends with its only `Return`.
    pub fn verify(&self) -> Result<()> {
        let mut defined = HashSet::new();
        for (pos, id) in self.iter().enumerate() {
            ensure!(id.0 < self.insts.len(), "{id} is not allocated in {}", self.name);
            for operand in self.operands(id) {
                ensure!(
                    defined.contains(&operand),
                    "{id} in {} uses {operand} before its definition",
                    self.name
                );
                ensure!(
                    self.result_type(operand) != ValueType::Unit,
                    "{id} in {} uses {operand}, which has no result",
                    self.name
                );
            }
            if matches!(self.kind(id), InstKind::Return { .. }) && pos + 1 != self.len() {
                bail!("{} has a return before its last instruction", self.name);
            }
            defined.insert(id);
        }
        ensure!(
            self.return_inst().is_some(),
            "{} does not end with a return",
            self.name
        );
        for (expected, param) in self.params().into_iter().enumerate() {
            if let InstKind::Param { index, .. } = self.kind(param) {
                ensure!(
                    *index == expected,
                    "{} is missing parameter #{expected}",
                    self.name
                );
            }
        }
        Ok(())
    }

    fn alloc(&mut self, kind: InstKind, loc: Location) -> InstId {
        let id = InstId(self.insts.len());
        self.insts.push(Inst { kind, loc });
        id
    }

    fn position(&self, id: InstId) -> Option<usize> {
        self.order.iter().position(|i| *i == id)
    }
}

/// A set of functions that can reference each other by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new(functions: Vec<Function>) -> Self {
        Self { functions }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn verify(&self) -> Result<()> {
        if let Some(dup) = self.functions.iter().map(|f| &f.name).duplicates().next() {
            bail!("function {dup} is defined more than once");
        }
        self.functions.iter().try_for_each(Function::verify)
    }
}
