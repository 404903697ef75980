use crate::ir::{Location, ValueId};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LoweringError {
    #[error("{loc}: op '{op}' has no device")]
    MissingDevice { op: String, loc: Location },
    #[error("{loc}: op '{op}' is still placed on all devices")]
    AllDevicesInGraph { op: String, loc: Location },
    #[error("{loc}: attribute '{name}' of op '{op}' holds invalid data type code {code}")]
    InvalidDType {
        op: String,
        name: String,
        code: i64,
        loc: Location,
    },
    #[error("{loc}: attribute '{name}' of op '{op}' {reason}")]
    InvalidAttribute {
        op: String,
        name: String,
        reason: String,
        loc: Location,
    },
    #[error("{loc}: op '{op}' is missing attribute '{name}'")]
    MissingAttribute {
        op: String,
        name: String,
        loc: Location,
    },
    #[error("{loc}: scalar promoted by '{op}' is not a constant")]
    NonConstantScalar { op: String, loc: Location },
    #[error("{loc}: input {value} of op '{op}' is not a tensor of the graph")]
    UnloweredInput {
        op: String,
        value: ValueId,
        loc: Location,
    },
    #[error("{loc}: op '{op}' must be canonicalized first")]
    NotCanonical { op: String, loc: Location },
    #[error("{loc}: cannot lower {what}")]
    UnsupportedInstruction { what: String, loc: Location },
    #[error("graph function for '{name}' was already lowered")]
    AlreadyLowered { name: String },
    #[error("graph function name '{name}' of '{host}' is already taken by '{owner}'")]
    NameCollision {
        name: String,
        host: String,
        owner: String,
    },
}

impl LoweringError {
    pub fn location(&self) -> Option<&Location> {
        match self {
            LoweringError::MissingDevice { loc, .. }
            | LoweringError::AllDevicesInGraph { loc, .. }
            | LoweringError::InvalidDType { loc, .. }
            | LoweringError::InvalidAttribute { loc, .. }
            | LoweringError::MissingAttribute { loc, .. }
            | LoweringError::NonConstantScalar { loc, .. }
            | LoweringError::UnloweredInput { loc, .. }
            | LoweringError::NotCanonical { loc, .. }
            | LoweringError::UnsupportedInstruction { loc, .. } => Some(loc),
            LoweringError::AlreadyLowered { .. } | LoweringError::NameCollision { .. } => None,
        }
    }
}
