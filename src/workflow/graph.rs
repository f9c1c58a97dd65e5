//! Execution Graph
//!
//! Builds the directed dependency graph between workflow steps from their
//! input bindings. Only step-output bindings create edges; workflow inputs
//! and literals never do.
//!
//! All structural errors here are build-time errors: they abort a run
//! before any step executes.

use std::collections::{HashMap, HashSet};

use log::debug;
use thiserror::Error;

use crate::workflow::model::{Pipeline, SourceRef};

/// Structural error detected while building the graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two steps share an id.
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// A binding or workflow output references a step that does not exist.
    #[error("'{context}' references unknown step '{reference}'")]
    UnknownStepReference { context: String, reference: String },

    /// A binding references an output the producing task never declares.
    #[error("step '{step}' references output '{output}' of step '{reference}', which does not declare it")]
    UnknownStepOutput {
        step: String,
        reference: String,
        output: String,
    },

    /// A step invokes a task missing from the pipeline's task library.
    #[error("step '{step}' invokes unknown task '{task}'")]
    UnknownTaskReference { step: String, task: String },

    /// A binding references a workflow input that is not declared.
    #[error("step '{step}' references undeclared workflow input '{input}'")]
    UnknownWorkflowInput { step: String, input: String },

    /// The dependency edges close a loop.
    #[error("cyclic dependency involving step '{0}'")]
    CyclicDependency(String),
}

/// One node of the execution graph.
#[derive(Debug, Clone, Default)]
pub struct GraphNode {
    /// Steps this step consumes outputs from
    pub deps: HashSet<String>,
    /// Steps that consume this step's outputs
    pub dependents: HashSet<String>,
}

/// The derived dependency graph over a workflow's steps.
///
/// Built once per run, never hand-assembled. Guaranteed acyclic; every
/// step-output reference has been checked against the task library.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: HashMap<String, GraphNode>,
    order: Vec<String>,
}

impl ExecutionGraph {
    /// Builds the graph for a pipeline's workflow.
    ///
    /// Validates step ids, task references, binding targets, and
    /// acyclicity. Returns the first error found; nothing executes on
    /// failure.
    pub fn build(pipeline: &Pipeline) -> Result<Self, GraphError> {
        let workflow = &pipeline.workflow;

        let mut nodes: HashMap<String, GraphNode> = HashMap::new();
        for step in &workflow.steps {
            if nodes.insert(step.id.clone(), GraphNode::default()).is_some() {
                return Err(GraphError::DuplicateStepId(step.id.clone()));
            }
        }

        let declared_inputs: HashSet<&str> =
            workflow.inputs.iter().map(|i| i.name.as_str()).collect();

        for step in &workflow.steps {
            if pipeline.task(&step.task).is_none() {
                return Err(GraphError::UnknownTaskReference {
                    step: step.id.clone(),
                    task: step.task.clone(),
                });
            }

            for source in step.bindings.values() {
                match source {
                    SourceRef::StepOutput { step: from, output } => {
                        if !nodes.contains_key(from) {
                            return Err(GraphError::UnknownStepReference {
                                context: step.id.clone(),
                                reference: from.clone(),
                            });
                        }

                        let producer = workflow.step(from).and_then(|s| pipeline.task(&s.task));
                        if let Some(producer) = producer {
                            if producer.output(output).is_none() {
                                return Err(GraphError::UnknownStepOutput {
                                    step: step.id.clone(),
                                    reference: from.clone(),
                                    output: output.clone(),
                                });
                            }
                        }

                        // Self-loops are cycles of length one.
                        if from == &step.id {
                            return Err(GraphError::CyclicDependency(step.id.clone()));
                        }

                        if let Some(node) = nodes.get_mut(&step.id) {
                            node.deps.insert(from.clone());
                        }
                        if let Some(node) = nodes.get_mut(from) {
                            node.dependents.insert(step.id.clone());
                        }
                    }
                    SourceRef::WorkflowInput(name) => {
                        if !declared_inputs.contains(name.as_str()) {
                            return Err(GraphError::UnknownWorkflowInput {
                                step: step.id.clone(),
                                input: name.clone(),
                            });
                        }
                    }
                    SourceRef::Literal(_) => {}
                }
            }
        }

        for output in &workflow.outputs {
            if let SourceRef::StepOutput { step, .. } = &output.source {
                if !nodes.contains_key(step) {
                    return Err(GraphError::UnknownStepReference {
                        context: format!("workflow output '{}'", output.name),
                        reference: step.clone(),
                    });
                }
            }
        }

        let order = topological_order(workflow.steps.iter().map(|s| s.id.as_str()), &nodes)?;

        debug!("execution order: {:?}", order);

        Ok(Self { nodes, order })
    }

    /// Returns the steps the given step depends on.
    pub fn deps(&self, id: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|n| n.deps.iter().map(String::as_str))
    }

    /// Returns the steps that depend on the given step.
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|n| n.dependents.iter().map(String::as_str))
    }

    /// Returns step ids in a valid execution order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Returns steps with no dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(id.as_str())
                    .map(|n| n.deps.is_empty())
                    .unwrap_or(false)
            })
            .map(String::as_str)
            .collect()
    }

    /// Returns every step reachable downstream of the given step.
    ///
    /// Used to cascade `Skipped` from a failed step.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = self.dependents(id).map(str::to_string).collect();

        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(&next).map(str::to_string));
            }
        }

        seen
    }

    /// Returns the number of steps in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// DFS traversal color marking.
#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Orders steps by depth-first traversal, detecting cycles via
/// white/grey/black coloring. Visiting a grey node means the current path
/// loops back on itself.
fn topological_order<'a>(
    ids: impl Iterator<Item = &'a str>,
    nodes: &HashMap<String, GraphNode>,
) -> Result<Vec<String>, GraphError> {
    let mut colors: HashMap<&str, Color> = nodes.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut order: Vec<String> = Vec::with_capacity(nodes.len());

    for id in ids {
        visit(id, nodes, &mut colors, &mut order)?;
    }

    Ok(order)
}

fn visit(
    id: &str,
    nodes: &HashMap<String, GraphNode>,
    colors: &mut HashMap<&str, Color>,
    order: &mut Vec<String>,
) -> Result<(), GraphError> {
    match colors.get(id) {
        Some(Color::Black) => return Ok(()),
        Some(Color::Grey) => return Err(GraphError::CyclicDependency(id.to_string())),
        _ => {}
    }

    if let Some(slot) = colors.get_mut(id) {
        *slot = Color::Grey;
    }

    if let Some(node) = nodes.get(id) {
        let mut deps: Vec<&String> = node.deps.iter().collect();
        deps.sort();
        for dep in deps {
            visit(dep, nodes, colors, order)?;
        }
    }

    if let Some(slot) = colors.get_mut(id) {
        *slot = Color::Black;
    }
    order.push(id.to_string());
    Ok(())
}
