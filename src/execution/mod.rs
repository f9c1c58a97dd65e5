//! Execution Module
//!
//! Everything that happens after a pipeline is loaded and validated:
//!
//! # Structure
//!
//! - [`adapter`]: the boundary to external tools, plus the local shell
//!   implementation
//! - [`scatter`]: fan-out of scattered steps and order-preserving gather
//! - [`scheduler`]: the engine dispatching steps as dependencies complete

pub mod adapter;
pub mod scatter;
pub mod scheduler;

pub use adapter::{Adapter, AdapterFailure, ShellAdapter};
pub use scatter::ScatterError;
pub use scheduler::{CancelHandle, Engine, EngineError, RunReport, StepError, StepStatus};
