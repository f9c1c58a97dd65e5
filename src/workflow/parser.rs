//! Pipeline Document Parser
//!
//! Loads pipeline definitions from YAML: a library of task descriptors
//! plus one workflow wiring them together.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: wgs_somatic
//! tasks:
//!   - name: bwa_align
//!     version: "0.7.17"
//!     image: biocontainers/bwa:0.7.17
//!     command: "bwa mem -t {threads} {reference} {reads} > {out_bam}"
//!     inputs:
//!       - { name: reference, type: file, secondary: [".fai", "^.dict"] }
//!       - { name: reads, type: file }
//!       - { name: threads, type: scalar, optional: true, default: 4 }
//!     outputs:
//!       - { name: out_bam, path: aligned.bam, secondary: [".bai"] }
//!
//! workflow:
//!   inputs:
//!     - { name: reference, type: file }
//!     - { name: reads, type: file }
//!   steps:
//!     - id: align
//!       task: bwa_align
//!       in:
//!         reference: reference    # a workflow input
//!         reads: reads
//!   outputs:
//!     bam: align/out_bam          # step/output
//! ```
//!
//! Binding syntax: `step/output` references a step output, a bare name
//! references a workflow input, and any other YAML value (or an explicit
//! `literal:` mapping) is a literal.

use std::collections::HashMap;
use std::fs;

use log::{debug, info};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use thiserror::Error;

use crate::task::{Derivation, InputSpec, OutputSpec, SecondaryPattern, TaskDescriptor};
use crate::value::{Value, ValueType};
use crate::workflow::model::{Pipeline, SourceRef, Workflow, WorkflowInput, WorkflowStep};

/// Error raised while loading or converting a pipeline document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read pipeline file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("duplicate task name '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}', output '{output}': {reason}")]
    InvalidDerivation {
        task: String,
        output: String,
        reason: String,
    },

    #[error("unsupported literal value bound to '{0}': expected a scalar or a sequence")]
    UnsupportedLiteral(String),
}

/// Loads and converts a pipeline from a YAML file.
pub fn load_pipeline(path: &str) -> Result<Pipeline, ParseError> {
    info!("Loading pipeline from: {}", path);

    let content = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_string(),
        source,
    })?;

    debug!("pipeline document loaded ({} bytes)", content.len());
    parse_pipeline(&content)
}

/// Parses a pipeline from YAML text.
pub fn parse_pipeline(content: &str) -> Result<Pipeline, ParseError> {
    let doc: PipelineDoc = serde_yaml::from_str(content)?;

    let name = doc.name.unwrap_or_else(|| "pipeline".to_string());
    let mut workflow = Workflow::new(name);

    for input in doc.workflow.inputs {
        let ty = value_type(input.ty, input.optional);
        let mut decl = WorkflowInput::new(input.name.clone(), ty);
        if let Some(default) = &input.default {
            decl = decl.with_default(literal_value(default, &input.name)?);
        }
        workflow = workflow.with_input(decl);
    }

    for step in doc.workflow.steps {
        let mut decl = WorkflowStep::new(step.id.clone(), step.task);
        for (input, source) in step.inputs {
            let context = format!("{}.{}", step.id, input);
            decl = decl.bind(input, source.into_source_ref(&context)?);
        }
        for scattered in step.scatter {
            decl = decl.scatter_over(scattered);
        }
        workflow = workflow.with_step(decl);
    }

    for (name, source) in doc.workflow.outputs {
        let context = format!("output '{}'", name);
        let source = source.into_source_ref(&context)?;
        workflow = workflow.with_output(name, source);
    }

    let mut pipeline = Pipeline::new(workflow);
    for task in doc.tasks {
        if pipeline.tasks.contains_key(&task.name) {
            return Err(ParseError::DuplicateTask(task.name));
        }
        let descriptor = task.into_descriptor()?;
        pipeline.tasks.insert(descriptor.name.clone(), descriptor);
    }

    info!(
        "Parsed pipeline: {} tasks, {} steps",
        pipeline.tasks.len(),
        pipeline.workflow.len()
    );

    Ok(pipeline)
}

/// Top-level document layout.
#[derive(Deserialize)]
struct PipelineDoc {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tasks: Vec<TaskDoc>,
    workflow: WorkflowDoc,
}

#[derive(Deserialize)]
struct TaskDoc {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    command: String,
    #[serde(default)]
    inputs: Vec<InputDoc>,
    #[serde(default)]
    outputs: Vec<OutputDoc>,
}

#[derive(Deserialize)]
struct InputDoc {
    name: String,
    #[serde(rename = "type")]
    ty: TypeName,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    default: Option<serde_yaml::Value>,
    #[serde(default)]
    secondary: Vec<SecondaryPattern>,
}

#[derive(Deserialize)]
struct OutputDoc {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    from_input: Option<String>,
    #[serde(default)]
    replace_ext: Option<String>,
    #[serde(default)]
    secondary: Vec<SecondaryPattern>,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum TypeName {
    File,
    Array,
    Scalar,
}

#[derive(Deserialize)]
struct WorkflowDoc {
    #[serde(default)]
    inputs: Vec<WorkflowInputDoc>,
    #[serde(default)]
    steps: Vec<StepDoc>,
    #[serde(default, deserialize_with = "ordered_entries")]
    outputs: Vec<(String, SourceDoc)>,
}

/// Deserializes a YAML mapping into a vector of entries, preserving the
/// order in which they were written.
fn ordered_entries<'de, D>(deserializer: D) -> Result<Vec<(String, SourceDoc)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct EntriesVisitor;

    impl<'de> de::Visitor<'de> for EntriesVisitor {
        type Value = Vec<(String, SourceDoc)>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a mapping of output names to sources")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: de::MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some(entry) = access.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(EntriesVisitor)
}

#[derive(Deserialize)]
struct WorkflowInputDoc {
    name: String,
    #[serde(rename = "type")]
    ty: TypeName,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    default: Option<serde_yaml::Value>,
}

#[derive(Deserialize)]
struct StepDoc {
    id: String,
    task: String,
    #[serde(rename = "in", default)]
    inputs: HashMap<String, SourceDoc>,
    #[serde(deserialize_with = "single_or_vec", default)]
    scatter: Vec<String>,
}

/// A binding's right-hand side before interpretation.
#[derive(Deserialize)]
#[serde(untagged)]
enum SourceDoc {
    Text(String),
    Other(serde_yaml::Value),
}

impl SourceDoc {
    fn into_source_ref(self, context: &str) -> Result<SourceRef, ParseError> {
        match self {
            Self::Text(text) => match text.split_once('/') {
                Some((step, output)) => Ok(SourceRef::StepOutput {
                    step: step.to_string(),
                    output: output.to_string(),
                }),
                None => Ok(SourceRef::WorkflowInput(text)),
            },
            Self::Other(value) => {
                // An explicit `literal:` wrapper lets strings (which would
                // otherwise read as references) stay literal.
                if let serde_yaml::Value::Mapping(map) = &value {
                    if map.len() == 1 {
                        let key = serde_yaml::Value::String("literal".to_string());
                        if let Some(inner) = map.get(&key) {
                            return Ok(SourceRef::Literal(literal_value(inner, context)?));
                        }
                    }
                }
                Ok(SourceRef::Literal(literal_value(&value, context)?))
            }
        }
    }
}

impl TaskDoc {
    fn into_descriptor(self) -> Result<TaskDescriptor, ParseError> {
        let mut descriptor =
            TaskDescriptor::new(self.name.clone(), self.version).with_command(self.command);
        if let Some(image) = self.image {
            descriptor = descriptor.with_image(image);
        }

        for input in self.inputs {
            let ty = value_type(input.ty, input.optional);
            let mut spec = InputSpec::new(input.name.clone(), ty).with_secondary(input.secondary);
            if let Some(default) = &input.default {
                spec = spec.with_default(literal_value(default, &input.name)?);
            }
            descriptor = descriptor.with_input(spec);
        }

        for output in self.outputs {
            let derivation = match (output.path, output.from_input, output.replace_ext) {
                (Some(path), None, None) => Derivation::Literal(path),
                (None, Some(input), None) => Derivation::FromInput(input),
                (None, Some(input), Some(ext)) => Derivation::ReplaceExtension { input, ext },
                _ => {
                    return Err(ParseError::InvalidDerivation {
                        task: self.name,
                        output: output.name,
                        reason: "expected either 'path' or 'from_input' (with optional \
                                 'replace_ext')"
                            .to_string(),
                    })
                }
            };

            descriptor = descriptor
                .with_output(OutputSpec::new(output.name, derivation).with_secondary(output.secondary));
        }

        Ok(descriptor)
    }
}

fn value_type(name: TypeName, optional: bool) -> ValueType {
    match (name, optional) {
        (TypeName::File, false) => ValueType::File,
        (TypeName::File, true) => ValueType::OptionalFile,
        (TypeName::Array, false) => ValueType::Array,
        (TypeName::Array, true) => ValueType::OptionalArray,
        (TypeName::Scalar, false) => ValueType::Scalar,
        (TypeName::Scalar, true) => ValueType::OptionalScalar,
    }
}

/// Converts a YAML literal into a runtime [`Value`].
fn literal_value(value: &serde_yaml::Value, context: &str) -> Result<Value, ParseError> {
    match value {
        serde_yaml::Value::Null => Ok(Value::Unset),
        serde_yaml::Value::Bool(_)
        | serde_yaml::Value::Number(_)
        | serde_yaml::Value::String(_) => {
            let scalar: serde_json::Value = serde_yaml::from_value(value.clone())?;
            Ok(Value::Scalar(scalar))
        }
        serde_yaml::Value::Sequence(items) => {
            let items = items
                .iter()
                .map(|item| literal_value(item, context))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(items))
        }
        _ => Err(ParseError::UnsupportedLiteral(context.to_string())),
    }
}

/// Deserializes either a single string or an array of strings.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::Null => Ok(Vec::new()),
        serde_yaml::Value::String(s) if s.is_empty() => Ok(Vec::new()),
        serde_yaml::Value::String(s) => Ok(vec![s]),
        serde_yaml::Value::Sequence(items) => items
            .into_iter()
            .map(|item| match item {
                serde_yaml::Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("expected string or array of strings")),
    }
}
