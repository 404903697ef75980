//! Resolution of SSA values to compile-time constants.

use super::{DataType, Function, InstId, InstKind, ValueId, ValueType};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConstantValue {
    Int { value: i64, dtype: DataType },
    Float { value: f64, dtype: DataType },
    Str(String),
    Type(ValueType),
    Function(String),
    Array {
        element: ValueType,
        elements: Vec<ConstantValue>,
    },
}

impl ConstantValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConstantValue::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConstantValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ConstantValue::Int { .. } | ConstantValue::Float { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ConstantValue::Array { .. })
    }
}

/// The elements of an array literal, recovered from its build chain.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayElements {
    pub element: ValueType,
    /// Element values, indexed by slot.
    pub values: Vec<ValueId>,
    /// The instructions building the array, from the final insertion back to
    /// the allocation.
    pub chain: Vec<InstId>,
}

impl Function {
    /// Folds `value` into a constant, looking through array construction.
    /// Returns `None` as soon as any part of the value is not a literal.
    pub fn constant_value(&self, value: ValueId) -> Option<ConstantValue> {
        match self.kind(value) {
            InstKind::IntLiteral { value, dtype } => Some(ConstantValue::Int {
                value: *value,
                dtype: *dtype,
            }),
            InstKind::FloatLiteral { value, dtype } => Some(ConstantValue::Float {
                value: *value,
                dtype: *dtype,
            }),
            InstKind::StringLiteral(s) => Some(ConstantValue::Str(s.clone())),
            InstKind::Metatype(ty) => Some(ConstantValue::Type(ty.clone())),
            InstKind::FunctionRef(name) => Some(ConstantValue::Function(name.clone())),
            InstKind::ArrayAlloc { .. } | InstKind::ArrayInsert { .. } => {
                let array = self.array_elements(value)?;
                let elements = array
                    .values
                    .iter()
                    .map(|v| self.constant_value(*v))
                    .collect::<Option<Vec<_>>>()?;
                Some(ConstantValue::Array {
                    element: array.element,
                    elements,
                })
            }
            _ => None,
        }
    }

    /// Walks the insertions producing `value` back to their allocation. Every
    /// slot must be written exactly once; anything else (an unknown producer,
    /// a missing or doubly written slot, an out of range index) is `None`.
    pub fn array_elements(&self, value: ValueId) -> Option<ArrayElements> {
        let mut slots: Vec<(usize, ValueId)> = Vec::new();
        let mut chain = Vec::new();
        let mut current = value;
        loop {
            chain.push(current);
            match self.kind(current) {
                InstKind::ArrayInsert {
                    array,
                    index,
                    element,
                } => {
                    if slots.iter().any(|(i, _)| i == index) {
                        return None;
                    }
                    slots.push((*index, *element));
                    current = *array;
                }
                InstKind::ArrayAlloc { len, element } => {
                    if slots.len() != *len || slots.iter().any(|(i, _)| i >= len) {
                        return None;
                    }
                    slots.sort_by_key(|(i, _)| *i);
                    return Some(ArrayElements {
                        element: element.clone(),
                        values: slots.into_iter().map(|(_, v)| v).collect(),
                        chain,
                    });
                }
                _ => return None,
            }
        }
    }
}
