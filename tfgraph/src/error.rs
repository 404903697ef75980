//! Error type of the whole lowering, and its rendering as a diagnostic.

use crate::{
    assembly::{AssemblyError, CodecError},
    classifier::DecodeError,
    config::{ConfigError, PlacementError},
    ir::Location,
    lowering::LoweringError,
};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Lowering(#[from] LoweringError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl GraphError {
    /// Source location the error points at, if any.
    pub fn location(&self) -> Option<&Location> {
        match self {
            GraphError::Decode(e) => Some(e.location()),
            GraphError::Placement(e) => Some(e.location()),
            GraphError::Config(e) => e.location(),
            GraphError::Lowering(e) => e.location(),
            GraphError::Assembly(e) => e.location(),
            GraphError::Codec(_) => None,
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        Diagnostic {
            location: self.location().cloned().unwrap_or_default(),
            message: self.to_string(),
        }
    }
}

/// A user facing error report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[display("error: {message}")]
pub struct Diagnostic {
    pub location: Location,
    pub message: String,
}
