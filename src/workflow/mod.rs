//! Workflow Definition Module
//!
//! Data structures and utilities for defining, loading, and wiring
//! workflows into executable dependency graphs.
//!
//! # Structure
//!
//! - [`model`]: core data structures (Pipeline, Workflow, WorkflowStep, SourceRef)
//! - [`graph`]: dependency-graph construction and cycle detection
//! - [`parser`]: YAML pipeline loading

pub mod graph;
pub mod model;
pub mod parser;

pub use graph::{ExecutionGraph, GraphError};
pub use model::{Pipeline, SourceRef, Workflow, WorkflowInput, WorkflowOutput, WorkflowStep};
pub use parser::{load_pipeline, parse_pipeline, ParseError};
