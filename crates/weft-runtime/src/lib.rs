//! Embedded script runtime shared by every weft component.
//!
//! Provides [`RuntimeEnvironment`], the single entry point into the QuickJS
//! engine. One environment is created per process and handed to each
//! component; all script work runs on a dedicated runtime thread.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use weft_runtime::{EntryCall, RuntimeEnvironment, RuntimeOptions};
//! use weft_core::RuntimeValue;
//!
//! # fn run() -> Result<(), weft_runtime::RuntimeError> {
//! let env = RuntimeEnvironment::new(RuntimeOptions::default());
//!
//! let call = EntryCall::new("/path/to/bin/index.js", "runScript")
//!     .with_inputs(RuntimeValue::from_pairs([("a", RuntimeValue::Number(2.0))]));
//! let outcome = env.execute_entry(call).wait()?;
//! for message in &outcome.console {
//!     println!("{}: {}", message.level, message.text);
//! }
//! let value = outcome.value?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

mod bridge;
mod console;
pub mod environment;
pub mod error;
pub mod handle;
pub mod inspector;
mod worker;

pub use environment::{EntryCall, ExecutionOutcome, RuntimeEnvironment, RuntimeOptions};
pub use error::RuntimeError;
pub use handle::{ExecutionHandle, ExecutionState};
pub use inspector::InspectorEvent;
pub use worker::ScriptScope;

/// Re-exported so bodies passed to [`RuntimeEnvironment::run`] can name engine types.
pub use rquickjs;
