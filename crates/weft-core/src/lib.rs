//! Core types shared by every weft crate.
//!
//! - [`value`]: host values, data trees, foreign objects and runtime values
//! - [`marshal`]: conversion between host and runtime values
//! - [`schema`]: the ordered input/output slots of a script component
//! - [`codegen`]: type declarations generated from a schema
//! - [`diagnostic`]: leveled build and console messages
//! - [`state`]: what a component persists across save/load

pub mod codegen;
pub mod diagnostic;
pub mod error;
pub mod marshal;
pub mod schema;
pub mod state;
pub mod value;

pub use diagnostic::{BuildDiagnostic, BuildResult, ConsoleMessage, Level, NodeMessage};
pub use error::{MarshalError, SchemaError, StateError};
pub use marshal::{ForeignBridge, HandleTable, from_runtime_value, to_runtime_value};
pub use schema::{Access, ParameterSchema, ParameterSlot, SchemaChange, Side, TypeHint};
pub use state::PersistedState;
pub use value::{DataTree, ForeignObject, HostValue, RuntimeValue, TreePath};
