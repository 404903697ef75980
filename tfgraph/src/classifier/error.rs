//! Errors raised while decoding the operands of a tensor op.

use crate::ir::Location;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("{loc}: empty op name in '{mnemonic}'")]
    EmptyOpName { mnemonic: String, loc: Location },
    #[error("{loc}: unknown operand role suffix '${suffix}' in '{token}'")]
    UnknownRoleSuffix {
        token: String,
        suffix: String,
        loc: Location,
    },
    #[error("{loc}: op '{op}' names {expected} operands but has {actual}")]
    OperandCountMismatch {
        op: String,
        expected: usize,
        actual: usize,
        loc: Location,
    },
    #[error("{loc}: input operand #{position} of op '{op}' follows an attribute")]
    InputAfterAttribute {
        op: String,
        position: usize,
        loc: Location,
    },
    #[error("{loc}: attribute '{name}' of op '{op}' must be {expected}")]
    NonConstantAttribute {
        op: String,
        name: String,
        expected: &'static str,
        loc: Location,
    },
    #[error("{loc}: operand '{name}' of op '{op}' must be {expected}")]
    RoleMismatch {
        op: String,
        name: String,
        expected: &'static str,
        loc: Location,
    },
    #[error("{loc}: array operand '{name}' of op '{op}' cannot be traced back to its elements")]
    UntraceableArray {
        op: String,
        name: String,
        loc: Location,
    },
    #[error("{loc}: element operand #{position} of op '{op}' has no preceding marker")]
    ElementWithoutMarker {
        op: String,
        position: usize,
        loc: Location,
    },
    #[error("{loc}: shape array '{name}' of op '{op}' declares {expected} shapes but has {actual}")]
    MissingElements {
        op: String,
        name: String,
        expected: usize,
        actual: usize,
        loc: Location,
    },
    #[error("{loc}: unknown device '{device}' on op '{op}'")]
    UnknownDevice {
        op: String,
        device: String,
        loc: Location,
    },
}

impl DecodeError {
    pub fn location(&self) -> &Location {
        match self {
            DecodeError::EmptyOpName { loc, .. }
            | DecodeError::UnknownRoleSuffix { loc, .. }
            | DecodeError::OperandCountMismatch { loc, .. }
            | DecodeError::InputAfterAttribute { loc, .. }
            | DecodeError::NonConstantAttribute { loc, .. }
            | DecodeError::RoleMismatch { loc, .. }
            | DecodeError::UntraceableArray { loc, .. }
            | DecodeError::ElementWithoutMarker { loc, .. }
            | DecodeError::MissingElements { loc, .. }
            | DecodeError::UnknownDevice { loc, .. } => loc,
        }
    }
}
