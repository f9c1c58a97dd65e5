//! Workflow Data Model
//!
//! Core data structures wiring task invocations into a pipeline: steps,
//! their input bindings, scatter annotations, and the workflow's own
//! inputs and outputs.
//!
//! All of these are static. They are built once, at pipeline-load time,
//! and immutable for the duration of a run.

use std::collections::HashMap;

use crate::task::TaskDescriptor;
use crate::value::{Value, ValueType};

/// Where a step input gets its value from: an edge in the DAG.
///
/// Only [`SourceRef::StepOutput`] creates a dependency between steps;
/// workflow inputs and literals never do.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRef {
    /// A value the caller provides when the run starts
    WorkflowInput(String),
    /// Another step's declared output
    StepOutput { step: String, output: String },
    /// A constant embedded in the workflow definition
    Literal(Value),
}

/// One invocation of a task within a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    /// Unique identifier within the workflow
    pub id: String,

    /// Name of the task this step invokes
    pub task: String,

    /// Mapping from task input name to the value's source
    pub bindings: HashMap<String, SourceRef>,

    /// Input names to fan out over; empty for ordinary steps
    pub scatter: Vec<String>,
}

impl WorkflowStep {
    /// Creates a step with no bindings and no scatter.
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            task: task.into().trim().to_string(),
            bindings: HashMap::new(),
            scatter: Vec::new(),
        }
    }

    /// Binds a task input to a source.
    pub fn bind(mut self, input: impl Into<String>, source: SourceRef) -> Self {
        self.bindings.insert(input.into(), source);
        self
    }

    /// Binds a task input to a workflow input of the same name.
    pub fn bind_input(self, input: impl Into<String>) -> Self {
        let input = input.into();
        let source = SourceRef::WorkflowInput(input.clone());
        self.bind(input, source)
    }

    /// Binds a task input to another step's output.
    pub fn bind_step(
        self,
        input: impl Into<String>,
        step: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        self.bind(
            input,
            SourceRef::StepOutput {
                step: step.into(),
                output: output.into(),
            },
        )
    }

    /// Marks an input to scatter over.
    pub fn scatter_over(mut self, input: impl Into<String>) -> Self {
        self.scatter.push(input.into());
        self
    }

    /// Returns true if this step fans out into sub-invocations.
    pub fn is_scattered(&self) -> bool {
        !self.scatter.is_empty()
    }
}

/// A declared workflow input.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInput {
    /// Name, unique within the workflow
    pub name: String,

    /// Declared type, including optionality
    pub ty: ValueType,

    /// Default applied when the caller provides no value
    pub default: Option<Value>,
}

impl WorkflowInput {
    /// Creates a required input with no default.
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    /// Sets the default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// A declared workflow output, exposing a source as a run result.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOutput {
    /// Name of the published result
    pub name: String,

    /// Where the result comes from
    pub source: SourceRef,
}

/// A complete workflow definition: inputs, steps, and published outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    /// Workflow name, for logs and reports
    pub name: String,

    /// Declared inputs, in declaration order
    pub inputs: Vec<WorkflowInput>,

    /// Step invocations, in declaration order
    pub steps: Vec<WorkflowStep>,

    /// Published outputs, in declaration order
    pub outputs: Vec<WorkflowOutput>,
}

impl Workflow {
    /// Creates an empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            steps: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Appends a declared input.
    pub fn with_input(mut self, input: WorkflowInput) -> Self {
        self.inputs.push(input);
        self
    }

    /// Appends a step.
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a published output.
    pub fn with_output(mut self, name: impl Into<String>, source: SourceRef) -> Self {
        self.outputs.push(WorkflowOutput {
            name: name.into(),
            source,
        });
        self
    }

    /// Looks up a step by id.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Looks up a declared input by name.
    pub fn input(&self, name: &str) -> Option<&WorkflowInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A loaded pipeline: the task library plus the workflow wiring it.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    /// Task descriptors, keyed by task name
    pub tasks: HashMap<String, TaskDescriptor>,

    /// The workflow to execute
    pub workflow: Workflow,
}

impl Pipeline {
    /// Creates a pipeline around a workflow with an empty task library.
    pub fn new(workflow: Workflow) -> Self {
        Self {
            tasks: HashMap::new(),
            workflow,
        }
    }

    /// Registers a task descriptor, keyed by its name.
    pub fn with_task(mut self, task: TaskDescriptor) -> Self {
        self.tasks.insert(task.name.clone(), task);
        self
    }

    /// Looks up a task descriptor by name.
    pub fn task(&self, name: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builder() {
        let step = WorkflowStep::new("align", "bwa_align")
            .bind_input("reference")
            .bind_step("reads", "trim", "trimmed")
            .bind("threads", SourceRef::Literal(Value::string("8")))
            .scatter_over("reads");

        assert_eq!(step.id, "align");
        assert_eq!(step.task, "bwa_align");
        assert_eq!(step.bindings.len(), 3);
        assert!(step.is_scattered());
        assert_eq!(
            step.bindings.get("reference"),
            Some(&SourceRef::WorkflowInput("reference".to_string()))
        );
        assert_eq!(
            step.bindings.get("reads"),
            Some(&SourceRef::StepOutput {
                step: "trim".to_string(),
                output: "trimmed".to_string(),
            })
        );
    }

    #[test]
    fn test_step_not_scattered_by_default() {
        let step = WorkflowStep::new("mark", "mark_duplicates");
        assert!(!step.is_scattered());
    }

    #[test]
    fn test_workflow_builder_and_lookup() {
        let workflow = Workflow::new("wgs")
            .with_input(WorkflowInput::new("reads", ValueType::File))
            .with_step(WorkflowStep::new("align", "bwa_align"))
            .with_output(
                "bam",
                SourceRef::StepOutput {
                    step: "align".to_string(),
                    output: "out_bam".to_string(),
                },
            );

        assert_eq!(workflow.len(), 1);
        assert!(!workflow.is_empty());
        assert!(workflow.step("align").is_some());
        assert!(workflow.step("missing").is_none());
        assert!(workflow.input("reads").is_some());
        assert_eq!(workflow.outputs.len(), 1);
    }

    #[test]
    fn test_pipeline_task_lookup() {
        let pipeline = Pipeline::new(Workflow::new("wgs"))
            .with_task(TaskDescriptor::new("bwa_align", "0.7.17"));

        assert!(pipeline.task("bwa_align").is_some());
        assert!(pipeline.task("gatk").is_none());
    }

    #[test]
    fn test_workflow_input_default() {
        let input = WorkflowInput::new("intervals", ValueType::OptionalArray)
            .with_default(Value::Array(Vec::new()));
        assert!(input.default.is_some());
    }
}
