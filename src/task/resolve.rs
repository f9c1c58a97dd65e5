//! Value Resolution
//!
//! Computes the effective input set for one task invocation: applies
//! defaults for unset optional inputs, validates that required inputs are
//! present, and checks provided values against declared types.
//!
//! Resolution is pure. It never touches the external adapter.

use std::collections::HashMap;

use log::warn;
use thiserror::Error;

use crate::task::descriptor::{InputSpec, TaskDescriptor};
use crate::task::secondary::attach;
use crate::value::{FileValue, Value, ValueKind};

/// Error raised while resolving a task's inputs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    /// A required input has neither a provided value nor a default.
    #[error("task '{task}': required input '{input}' has no value and no default")]
    MissingRequiredInput { task: String, input: String },

    /// A provided value's kind disagrees with the declared type.
    #[error("task '{task}': input '{input}' expects {expected} but was given {actual}")]
    TypeMismatch {
        task: String,
        input: String,
        expected: ValueKind,
        actual: String,
    },
}

/// Resolves provided values against a task's declared inputs.
///
/// Every declared input appears in the result: provided values are
/// type-checked, absent optional inputs take their default or
/// [`Value::Unset`], and absent required inputs fail with
/// [`ResolveError::MissingRequiredInput`]. Provided values for undeclared
/// inputs are dropped with a warning.
///
/// File-typed inputs given a bare string path are promoted to
/// [`FileValue`]s with the input's own secondary-file patterns attached.
/// A file value arriving from an upstream step passes through untouched,
/// keeping the secondary files of its producing output.
pub fn resolve(
    task: &TaskDescriptor,
    provided: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>, ResolveError> {
    resolve_scattered(task, provided, &[])
}

/// Resolves inputs for a scattered invocation.
///
/// Inputs named in `scatter` carry an array of values, one per
/// sub-invocation, so they are coerced element-wise against the declared
/// type instead of as a whole. A scattered value that is not an array
/// passes through unchanged; scatter expansion rejects it with a clearer
/// error than a type check here could.
pub fn resolve_scattered(
    task: &TaskDescriptor,
    provided: &HashMap<String, Value>,
    scatter: &[String],
) -> Result<HashMap<String, Value>, ResolveError> {
    for name in provided.keys() {
        if task.input(name).is_none() {
            warn!(
                "task '{}': ignoring value for undeclared input '{}'",
                task.name, name
            );
        }
    }

    let mut resolved = HashMap::with_capacity(task.inputs.len());

    for spec in &task.inputs {
        let scattered = scatter.iter().any(|name| *name == spec.name);
        let value = match provided.get(&spec.name) {
            Some(value) if !value.is_unset() => coerce_binding(task, spec, value.clone(), scattered)?,
            _ => match &spec.default {
                Some(default) => coerce_binding(task, spec, default.clone(), scattered)?,
                None if spec.ty.is_optional() => Value::Unset,
                None => {
                    return Err(ResolveError::MissingRequiredInput {
                        task: task.name.clone(),
                        input: spec.name.clone(),
                    })
                }
            },
        };
        resolved.insert(spec.name.clone(), value);
    }

    Ok(resolved)
}

/// Coerces one bound value, element-wise when the input is scattered.
fn coerce_binding(
    task: &TaskDescriptor,
    spec: &InputSpec,
    value: Value,
    scattered: bool,
) -> Result<Value, ResolveError> {
    if scattered {
        return match value {
            Value::Array(items) => {
                let coerced = items
                    .into_iter()
                    .map(|item| coerce(task, spec, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(coerced))
            }
            other => Ok(other),
        };
    }
    coerce(task, spec, value)
}

/// Checks a value against the declared type, promoting bare string paths
/// to file values where the declaration asks for a file.
fn coerce(task: &TaskDescriptor, spec: &InputSpec, value: Value) -> Result<Value, ResolveError> {
    let expected = spec.ty.kind();

    match (expected, value) {
        (ValueKind::File, Value::File(f)) => Ok(Value::File(f)),
        (ValueKind::File, Value::Scalar(s)) => match s.as_str() {
            Some(path) => Ok(Value::File(
                FileValue::new(path).with_secondary(attach(path, &spec.secondary)),
            )),
            None => Err(mismatch(task, spec, expected, &Value::Scalar(s))),
        },
        (ValueKind::Array, Value::Array(items)) => Ok(Value::Array(items)),
        (ValueKind::Scalar, Value::Scalar(s)) => Ok(Value::Scalar(s)),
        (_, other) => Err(mismatch(task, spec, expected, &other)),
    }
}

fn mismatch(
    task: &TaskDescriptor,
    spec: &InputSpec,
    expected: ValueKind,
    actual: &Value,
) -> ResolveError {
    ResolveError::TypeMismatch {
        task: task.name.clone(),
        input: spec.name.clone(),
        expected,
        actual: match actual.kind() {
            Some(kind) => kind.to_string(),
            None => "unset".to_string(),
        },
    }
}
