//! Value types and source locations of the input IR.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Element type of a tensor or scalar. The discriminants are the integer codes
/// the graph backend uses for its data types, which is also how a `$dtype`
/// attribute encodes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Float = 1,
    Double = 2,
    Int32 = 3,
    UInt8 = 4,
    Int16 = 5,
    Int8 = 6,
    String = 7,
    Int64 = 9,
    Bool = 10,
    UInt16 = 17,
    Half = 19,
    UInt32 = 22,
    UInt64 = 23,
}

impl DataType {
    const ALL: [DataType; 13] = [
        DataType::Float,
        DataType::Double,
        DataType::Int32,
        DataType::UInt8,
        DataType::Int16,
        DataType::Int8,
        DataType::String,
        DataType::Int64,
        DataType::Bool,
        DataType::UInt16,
        DataType::Half,
        DataType::UInt32,
        DataType::UInt64,
    ];

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|dt| dt.code() == code)
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, DataType::Float | DataType::Double | DataType::Half)
    }
}

/// Type of an SSA value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(DataType),
    Scalar(DataType),
    Str,
    /// The value of a `Metatype` instruction, used as a type attribute or as
    /// the marker heading an unfolded array.
    Metatype,
    Function,
    Array(Box<ValueType>),
    /// Instructions without a result.
    Unit,
}

impl ValueType {
    /// The element data type carried by tensors and scalars.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            ValueType::Tensor(dt) | ValueType::Scalar(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, ValueType::Tensor(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, ValueType::Scalar(_))
    }
}

/// Source location of an instruction. An empty file means the location is
/// unknown.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.file.is_empty()
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if self.is_unknown() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        }
    }
}
