//! dagrun - Workflow DAG Execution Engine
//!
//! A small engine for running pipelines of external tools. A pipeline is
//! a library of task descriptors plus a workflow wiring them together;
//! the engine derives the dependency graph from input bindings, schedules
//! steps as their dependencies complete, fans scattered steps out over
//! array inputs, and carries companion files (indexes, dictionaries)
//! alongside the primary files they belong to.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`value`]: Runtime values, including files with their secondary
//!   companions
//! - [`task`]: Task descriptors, input resolution, and secondary-file
//!   patterns
//! - [`workflow`]: Workflow data model, YAML loading, and graph
//!   construction
//! - [`execution`]: Adapters, scatter/gather, and the scheduling engine
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use dagrun::execution::ShellAdapter;
//! use dagrun::{load_pipeline, Engine, Value};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a pipeline from YAML
//!     let pipeline = load_pipeline("pipeline.yaml")?;
//!
//!     // Create the engine over a local shell adapter
//!     let adapter = Arc::new(ShellAdapter::new().with_working_dir("/data/analysis"));
//!     let mut engine = Engine::new(pipeline, adapter);
//!     engine.set_max_parallel(4);
//!
//!     // Execute the workflow
//!     let mut inputs = HashMap::new();
//!     inputs.insert("reads".to_string(), Value::string("sample.fastq"));
//!     let report = engine.run(inputs)?;
//!     assert!(report.success());
//!     Ok(())
//! }
//! ```

pub mod execution;
pub mod task;
pub mod value;
pub mod workflow;

// Re-export commonly used types
pub use execution::{Engine, RunReport, StepStatus};
pub use task::TaskDescriptor;
pub use value::{FileValue, Value, ValueType};
pub use workflow::{load_pipeline, ExecutionGraph, Pipeline, Workflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "dagrun";
