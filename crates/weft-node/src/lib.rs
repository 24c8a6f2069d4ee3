//! The script component node.
//!
//! A [`ScriptComponent`] ties a parameter schema, an on-disk working state,
//! a build watcher and the shared [`RuntimeEnvironment`](weft_runtime::RuntimeEnvironment)
//! together. The host owns components, drives them from one thread with
//! [`ScriptComponent::pump`] and [`ScriptComponent::solve`], and hands each
//! solve a [`DataAccess`] for its slot data.

pub mod component;
pub mod error;
pub mod io;

pub use component::{ComponentDocument, HostContext, ScriptComponent, SolveReport, Status};
pub use error::ComponentError;
pub use io::{DataAccess, SlotData, SolveData};
