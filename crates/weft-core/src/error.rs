use thiserror::Error;

use crate::schema::Side;

/// Why a parameter schema cannot be executed in its current shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{side} slot {index}: variable name must not be empty")]
    EmptyName { side: Side, index: usize },

    #[error("{side} slot {index}: `{name}` is not a valid variable name")]
    IllegalName {
        side: Side,
        index: usize,
        name: String,
    },

    #[error("{side} slot {index}: `{name}` is a reserved word")]
    ReservedName {
        side: Side,
        index: usize,
        name: String,
    },

    #[error("{side} slot {index}: `{name}` is already used by slot {first}")]
    DuplicateName {
        side: Side,
        index: usize,
        first: usize,
        name: String,
    },

    #[error("{side} slot index {index} is out of range")]
    NoSuchSlot { side: Side, index: usize },

    #[error("the output channel slot can only be removed by disabling the channel")]
    ReservedSlot,
}

impl SchemaError {
    /// The offending slot, when the error is attributable to one.
    pub fn slot(&self) -> Option<(Side, usize)> {
        match self {
            SchemaError::EmptyName { side, index }
            | SchemaError::IllegalName { side, index, .. }
            | SchemaError::ReservedName { side, index, .. }
            | SchemaError::DuplicateName { side, index, .. }
            | SchemaError::NoSuchSlot { side, index } => Some((*side, *index)),
            SchemaError::ReservedSlot => None,
        }
    }
}

/// A value could not cross the host/runtime boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("unsupported host value: {0}")]
    UnsupportedType(String),

    #[error("runtime value of type `{0}` cannot be converted")]
    Unclassified(String),

    #[error("value nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("foreign handle {0} is not known to this execution")]
    UnknownHandle(u64),

    #[error("malformed tree value: {0}")]
    MalformedTree(String),
}

/// A persisted component record could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("persisted state is missing `{0}`")]
    MissingField(&'static str),

    #[error("persisted field `{0}` has the wrong type")]
    WrongType(&'static str),
}
