//! Task Descriptors
//!
//! Static definitions of external-tool adapters: declared inputs with
//! defaults and secondary-file rules, declared outputs with derivation
//! rules, and an opaque adapter reference (container image plus command
//! template) the engine never interprets.
//!
//! Descriptors are created once at pipeline-load time and never mutated.

use thiserror::Error;

use crate::task::secondary::SecondaryPattern;
use crate::value::{Value, ValueType};

/// Opaque handle to the external invocation behind a task.
///
/// The engine treats this as a black box; only adapter implementations
/// read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterRef {
    /// Container image the tool ships in, if any
    pub image: Option<String>,

    /// Command template with `{input_name}` / `{output_name}` placeholders
    pub command: String,
}

/// A declared task input.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    /// Name, unique within the task
    pub name: String,

    /// Declared type, including optionality
    pub ty: ValueType,

    /// Default applied when an optional input is not provided
    pub default: Option<Value>,

    /// Companion-file rules for file values bound to this input
    pub secondary: Vec<SecondaryPattern>,
}

impl InputSpec {
    /// Creates an input with no default and no secondary files.
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            secondary: Vec::new(),
        }
    }

    /// Sets the default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Sets the secondary-file patterns.
    pub fn with_secondary(mut self, secondary: Vec<SecondaryPattern>) -> Self {
        self.secondary = secondary;
        self
    }
}

/// Rule deriving an output's primary path from the task's inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivation {
    /// A fixed filename, e.g. `aligned.bam`
    Literal(String),

    /// The named input's filename with its last extension replaced
    ReplaceExtension { input: String, ext: String },

    /// The named input's filename, unchanged
    FromInput(String),
}

/// Error raised when an output derivation cannot be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationError {
    #[error("output derivation references input '{0}', which has no usable value")]
    MissingInput(String),
}

impl Derivation {
    /// Evaluates this rule against resolved inputs, yielding the output's
    /// primary path.
    ///
    /// Input-based rules use the file name of the referenced input's
    /// value, since outputs land in the step's own working directory.
    pub fn derive(
        &self,
        inputs: &std::collections::HashMap<String, Value>,
    ) -> Result<String, DerivationError> {
        match self {
            Self::Literal(path) => Ok(path.clone()),
            Self::FromInput(input) => input_file_name(inputs, input),
            Self::ReplaceExtension { input, ext } => {
                let mut name = input_file_name(inputs, input)?;
                if let Some(idx) = name.rfind('.') {
                    name.truncate(idx);
                }
                name.push_str(ext);
                Ok(name)
            }
        }
    }
}

/// Extracts the file name of an input's value, for derivation rules.
fn input_file_name(
    inputs: &std::collections::HashMap<String, Value>,
    input: &str,
) -> Result<String, DerivationError> {
    let path = match inputs.get(input) {
        Some(Value::File(f)) => f.primary.as_str(),
        Some(Value::Scalar(v)) => v
            .as_str()
            .ok_or_else(|| DerivationError::MissingInput(input.to_string()))?,
        _ => return Err(DerivationError::MissingInput(input.to_string())),
    };

    let name = match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    };
    Ok(name.to_string())
}

/// A declared task output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    /// Name, unique within the task
    pub name: String,

    /// Rule deriving the primary path from the task's inputs
    pub derivation: Derivation,

    /// Companion-file rules applied when this output is produced
    pub secondary: Vec<SecondaryPattern>,
}

impl OutputSpec {
    /// Creates an output with no secondary files.
    pub fn new(name: impl Into<String>, derivation: Derivation) -> Self {
        Self {
            name: name.into(),
            derivation,
            secondary: Vec::new(),
        }
    }

    /// Sets the secondary-file patterns.
    pub fn with_secondary(mut self, secondary: Vec<SecondaryPattern>) -> Self {
        self.secondary = secondary;
        self
    }
}

/// Static definition of one external-tool adapter.
///
/// # Example
///
/// ```
/// use dagrun::task::{Derivation, InputSpec, OutputSpec, TaskDescriptor};
/// use dagrun::value::ValueType;
///
/// let task = TaskDescriptor::new("samtools_index", "1.9")
///     .with_command("samtools index {bam}")
///     .with_input(InputSpec::new("bam", ValueType::File))
///     .with_output(OutputSpec::new(
///         "indexed",
///         Derivation::FromInput("bam".to_string()),
///     ));
///
/// assert_eq!(task.name, "samtools_index");
/// assert!(task.input("bam").is_some());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    /// Tool name, unique within a pipeline
    pub name: String,

    /// Tool version string
    pub version: String,

    /// Declared inputs, in declaration order
    pub inputs: Vec<InputSpec>,

    /// Declared outputs, in declaration order
    pub outputs: Vec<OutputSpec>,

    /// Opaque external-invocation handle
    pub adapter: AdapterRef,
}

impl TaskDescriptor {
    /// Creates a descriptor with no inputs, outputs, or command.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            version: version.into().trim().to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            adapter: AdapterRef {
                image: None,
                command: String::new(),
            },
        }
    }

    /// Sets the command template.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.adapter.command = command.into();
        self
    }

    /// Sets the container image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.adapter.image = Some(image.into());
        self
    }

    /// Appends a declared input.
    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    /// Appends a declared output.
    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    /// Looks up a declared input by name.
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Looks up a declared output by name.
    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }
}
