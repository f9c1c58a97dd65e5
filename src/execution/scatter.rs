//! Scatter Expansion and Gather
//!
//! A scattered step fans one invocation out into N sub-invocations, one
//! per element of the scattered array inputs:
//!
//! - Scattering over several inputs zips them element-wise, so all
//!   scattered arrays must have equal length.
//! - Non-scattered inputs are passed to every sub-invocation unchanged.
//! - Gathering collects each declared output across sub-invocations into
//!   an array preserving element order, so downstream consumers can index
//!   results positionally.

use std::collections::HashMap;

use thiserror::Error;

use crate::task::TaskDescriptor;
use crate::value::Value;

/// Scatter expansion failure for one step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScatterError {
    /// A scattered input did not resolve to an array
    #[error("step '{step}' scatters over input '{input}' which is not an array")]
    NotAnArray { step: String, input: String },
    /// Scattered arrays have differing lengths
    #[error(
        "step '{step}' scatter length mismatch: input '{input}' has {actual} element(s), expected {expected}"
    )]
    LengthMismatch {
        step: String,
        input: String,
        expected: usize,
        actual: usize,
    },
}

/// Expands one resolved input set into per-element sub-invocation sets.
///
/// With an empty scatter list the step runs exactly once with its inputs
/// unchanged. Scattering over an empty array yields zero sub-invocations,
/// which gather turns into empty output arrays.
pub fn expand(
    step_id: &str,
    scatter: &[String],
    resolved: &HashMap<String, Value>,
) -> Result<Vec<HashMap<String, Value>>, ScatterError> {
    if scatter.is_empty() {
        return Ok(vec![resolved.clone()]);
    }

    let mut width: Option<usize> = None;
    for name in scatter {
        let elements = match resolved.get(name) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ScatterError::NotAnArray {
                    step: step_id.to_string(),
                    input: name.clone(),
                })
            }
        };
        match width {
            None => width = Some(elements.len()),
            Some(expected) if expected != elements.len() => {
                return Err(ScatterError::LengthMismatch {
                    step: step_id.to_string(),
                    input: name.clone(),
                    expected,
                    actual: elements.len(),
                });
            }
            Some(_) => {}
        }
    }

    let width = width.unwrap_or(0);
    let mut shards = Vec::with_capacity(width);
    for index in 0..width {
        let mut shard = HashMap::with_capacity(resolved.len());
        for (name, value) in resolved {
            if scatter.contains(name) {
                if let Value::Array(items) = value {
                    shard.insert(name.clone(), items[index].clone());
                }
            } else {
                shard.insert(name.clone(), value.clone());
            }
        }
        shards.push(shard);
    }
    Ok(shards)
}

/// Collects per-shard outputs into one array-valued output set.
///
/// Shard outputs must arrive in scatter order; the resulting arrays
/// preserve it.
pub fn gather(
    task: &TaskDescriptor,
    shard_outputs: Vec<HashMap<String, Value>>,
) -> HashMap<String, Value> {
    let mut gathered = HashMap::with_capacity(task.outputs.len());
    for spec in &task.outputs {
        let elements: Vec<Value> = shard_outputs
            .iter()
            .filter_map(|outputs| outputs.get(&spec.name).cloned())
            .collect();
        gathered.insert(spec.name.clone(), Value::Array(elements));
    }
    gathered
}
