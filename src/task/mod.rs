//! Task Definition Module
//!
//! Static descriptions of external-tool adapters and the pure logic that
//! prepares their inputs.
//!
//! # Structure
//!
//! - [`descriptor`]: task, input, and output declarations
//! - [`resolve`]: default application and type checking
//! - [`secondary`]: companion-file path derivation

pub mod descriptor;
pub mod resolve;
pub mod secondary;

pub use descriptor::{
    AdapterRef, Derivation, DerivationError, InputSpec, OutputSpec, TaskDescriptor,
};
pub use resolve::{resolve, resolve_scattered, ResolveError};
pub use secondary::{attach, InvalidPattern, SecondaryPattern};
