//! Execution Scheduler
//!
//! Drives a pipeline from workflow inputs to workflow outputs:
//!
//! - Builds the execution graph up front; any structural error aborts the
//!   run before a single adapter is invoked.
//! - Dispatches every step whose dependencies have completed, each on
//!   its own worker thread; a shared invocation budget caps concurrent
//!   adapter calls across all steps and their scatter shards.
//! - On step failure, marks all transitive dependents as skipped while
//!   independent branches keep running.
//! - Honors cooperative cancellation: no new step is dispatched after a
//!   cancel, already running steps are allowed to finish.
//!
//! Workers report back over an mpsc channel; all bookkeeping stays on the
//! scheduler thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::execution::adapter::{Adapter, AdapterFailure};
use crate::execution::scatter::{self, ScatterError};
use crate::task::{attach, resolve_scattered, ResolveError, TaskDescriptor};
use crate::value::{FileValue, Value};
use crate::workflow::{ExecutionGraph, GraphError, Pipeline, SourceRef, WorkflowStep};

/// Lifecycle of one step during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Waiting on dependencies
    Pending,
    /// Dependencies satisfied, about to be dispatched
    Ready,
    /// Adapter invocation in flight
    Running,
    /// All sub-invocations succeeded
    Completed,
    /// A sub-invocation or resolution failed
    Failed(String),
    /// A transitive dependency failed
    Skipped,
    /// The run was cancelled before this step started
    Cancelled,
}

impl StepStatus {
    /// Whether the step will make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed
                | StepStatus::Failed(_)
                | StepStatus::Skipped
                | StepStatus::Cancelled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Ready => write!(f, "ready"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed(reason) => write!(f, "failed ({})", reason),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure of a single step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Scatter(#[from] ScatterError),
    #[error(transparent)]
    Adapter(#[from] AdapterFailure),
    /// Adapter returned without producing a declared output
    #[error("task '{task}' did not report declared output '{output}'")]
    MissingOutput { task: String, output: String },
}

/// Failure of the run as a whole, detected before or outside step
/// execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("required workflow input '{0}' was not provided")]
    MissingWorkflowInput(String),
    #[error("worker channel closed unexpectedly")]
    ChannelClosed,
}

/// Cooperative cancellation flag shared with a running engine.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Requests cancellation. Running steps finish; nothing new starts.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caps concurrent adapter invocations across every running step.
///
/// Step workers and their scatter shards all draw permits from the same
/// budget, so the configured limit bounds the total number of adapter
/// calls in flight at once.
struct InvocationBudget {
    permits: Mutex<usize>,
    returned: Condvar,
}

impl InvocationBudget {
    fn new(limit: usize) -> Self {
        Self {
            permits: Mutex::new(limit.max(1)),
            returned: Condvar::new(),
        }
    }

    /// Blocks until a permit is free; the permit is returned on drop.
    fn acquire(&self) -> BudgetPermit<'_> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *permits == 0 {
            permits = self
                .returned
                .wait(permits)
                .unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
        BudgetPermit { budget: self }
    }
}

struct BudgetPermit<'a> {
    budget: &'a InvocationBudget,
}

impl Drop for BudgetPermit<'_> {
    fn drop(&mut self) {
        let mut permits = self
            .budget
            .permits
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.budget.returned.notify_one();
    }
}

/// Outcome of one pipeline run.
#[derive(Debug)]
pub struct RunReport {
    /// Terminal status of every step
    pub statuses: HashMap<String, StepStatus>,
    /// Resolved workflow outputs; entries sourced from non-completed
    /// steps are omitted
    pub outputs: HashMap<String, Value>,
    /// Wall-clock time per finished step
    pub durations: HashMap<String, Duration>,
}

impl RunReport {
    /// True when every step completed.
    pub fn success(&self) -> bool {
        self.statuses
            .values()
            .all(|s| matches!(s, StepStatus::Completed))
    }

    /// Steps that failed, with their reasons.
    pub fn failed_steps(&self) -> Vec<(&str, &str)> {
        self.statuses
            .iter()
            .filter_map(|(id, status)| match status {
                StepStatus::Failed(reason) => Some((id.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Status of one step, if it exists.
    pub fn status(&self, step_id: &str) -> Option<&StepStatus> {
        self.statuses.get(step_id)
    }
}

/// Message sent by a worker thread when its step finishes.
struct StepResult {
    step_id: String,
    outcome: Result<HashMap<String, Value>, StepError>,
    duration: Duration,
}

/// Orchestrates one pipeline over an [`Adapter`].
pub struct Engine {
    pipeline: Pipeline,
    adapter: Arc<dyn Adapter>,
    max_parallel: usize,
    dry_run: bool,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    /// Creates an engine with the default parallelism limit.
    pub fn new(pipeline: Pipeline, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            pipeline,
            adapter,
            max_parallel: 4,
            dry_run: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Caps concurrent adapter invocations across all steps and their
    /// scatter shards; zero is treated as one.
    pub fn set_max_parallel(&mut self, max_parallel: usize) {
        self.max_parallel = max_parallel.max(1);
    }

    /// In dry-run mode steps are scheduled and logged but no adapter is
    /// invoked.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Handle for cancelling this engine's run from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Runs the pipeline to completion.
    ///
    /// Returns an error only for problems that prevent execution from
    /// starting or for scheduler faults; per-step failures are recorded
    /// in the report.
    pub fn run(&self, provided: HashMap<String, Value>) -> Result<RunReport, EngineError> {
        let workflow_values = self.resolve_workflow_inputs(&provided)?;
        let graph = ExecutionGraph::build(&self.pipeline)?;

        let workflow = &self.pipeline.workflow;
        info!(
            "starting workflow '{}' ({} step(s), parallelism {})",
            workflow.name,
            graph.len(),
            self.max_parallel
        );

        let mut statuses: HashMap<String, StepStatus> = graph
            .topological_order()
            .iter()
            .map(|id| (id.clone(), StepStatus::Pending))
            .collect();
        let mut durations: HashMap<String, Duration> = HashMap::new();
        let mut step_outputs = OutputStore::new(&self.pipeline, &graph);
        let budget = Arc::new(InvocationBudget::new(self.max_parallel));

        let (tx, rx) = mpsc::channel::<StepResult>();
        let mut handles: Vec<thread::JoinHandle<()>> = Vec::new();
        let mut running = 0usize;
        let mut cancel_noted = false;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                if !cancel_noted {
                    warn!("cancellation requested, no further steps will start");
                    cancel_noted = true;
                }
                for status in statuses.values_mut() {
                    if matches!(status, StepStatus::Pending | StepStatus::Ready) {
                        *status = StepStatus::Cancelled;
                    }
                }
            } else {
                let mut dry_completed = false;
                let order: Vec<String> = graph.topological_order().to_vec();
                for step_id in order {
                    if running >= self.max_parallel {
                        break;
                    }
                    if statuses.get(&step_id) != Some(&StepStatus::Pending) {
                        continue;
                    }
                    let deps_done = graph
                        .deps(&step_id)
                        .all(|dep| statuses.get(dep) == Some(&StepStatus::Completed));
                    if !deps_done {
                        continue;
                    }

                    statuses.insert(step_id.clone(), StepStatus::Ready);
                    // Unknown step/task references were rejected at graph
                    // build time.
                    let step = match workflow.step(&step_id) {
                        Some(step) => step,
                        None => continue,
                    };

                    if self.dry_run {
                        info!(
                            "dry-run: would execute step '{}' (task '{}')",
                            step_id, step.task
                        );
                        statuses.insert(step_id.clone(), StepStatus::Completed);
                        durations.insert(step_id.clone(), Duration::ZERO);
                        step_outputs.release(graph.deps(&step_id));
                        dry_completed = true;
                        continue;
                    }

                    let task = match self.pipeline.task(&step.task) {
                        Some(task) => task.clone(),
                        None => continue,
                    };
                    let bound = collect_bindings(step, &workflow_values, &step_outputs);
                    step_outputs.release(graph.deps(&step_id));
                    let scatter = step.scatter.clone();
                    let id = step_id.clone();
                    let adapter = Arc::clone(&self.adapter);
                    let budget = Arc::clone(&budget);
                    let tx = tx.clone();

                    info!("dispatching step '{}' (task '{}')", step_id, task.name);
                    statuses.insert(step_id.clone(), StepStatus::Running);
                    running += 1;

                    handles.push(thread::spawn(move || {
                        let start = Instant::now();
                        let outcome =
                            execute_step(&id, &task, &scatter, &bound, adapter.as_ref(), &budget);
                        let _ = tx.send(StepResult {
                            step_id: id,
                            outcome,
                            duration: start.elapsed(),
                        });
                    }));
                }
                if dry_completed {
                    continue;
                }
            }

            if running == 0 {
                break;
            }

            let result = rx.recv().map_err(|_| EngineError::ChannelClosed)?;
            running -= 1;
            durations.insert(result.step_id.clone(), result.duration);

            match result.outcome {
                Ok(outputs) => {
                    info!(
                        "step '{}' completed in {:.2}s",
                        result.step_id,
                        result.duration.as_secs_f64()
                    );
                    statuses.insert(result.step_id.clone(), StepStatus::Completed);
                    step_outputs.insert(result.step_id, outputs);
                }
                Err(err) => {
                    error!("step '{}' failed: {}", result.step_id, err);
                    statuses.insert(result.step_id.clone(), StepStatus::Failed(err.to_string()));
                    for dependent in graph.transitive_dependents(&result.step_id) {
                        if statuses.get(&dependent) == Some(&StepStatus::Pending) {
                            warn!(
                                "skipping step '{}': upstream step '{}' failed",
                                dependent, result.step_id
                            );
                            // A skipped step will never read its inputs.
                            step_outputs.release(graph.deps(&dependent));
                            statuses.insert(dependent, StepStatus::Skipped);
                        }
                    }
                }
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        let outputs = self.resolve_workflow_outputs(&workflow_values, &statuses, &step_outputs);
        let completed = statuses
            .values()
            .filter(|s| matches!(s, StepStatus::Completed))
            .count();
        info!(
            "workflow '{}' finished: {}/{} step(s) completed",
            workflow.name,
            completed,
            statuses.len()
        );

        Ok(RunReport {
            statuses,
            outputs,
            durations,
        })
    }

    /// Applies workflow-level defaults and checks required inputs.
    fn resolve_workflow_inputs(
        &self,
        provided: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, EngineError> {
        let workflow = &self.pipeline.workflow;
        for name in provided.keys() {
            if workflow.input(name).is_none() {
                warn!("ignoring undeclared workflow input '{}'", name);
            }
        }

        let mut values = HashMap::with_capacity(workflow.inputs.len());
        for input in &workflow.inputs {
            let given = provided.get(&input.name).filter(|v| !v.is_unset());
            let value = match (given, &input.default) {
                (Some(v), _) => v.clone(),
                (None, Some(default)) => {
                    debug!("workflow input '{}' using default", input.name);
                    default.clone()
                }
                (None, None) if input.ty.is_optional() => Value::Unset,
                (None, None) => {
                    return Err(EngineError::MissingWorkflowInput(input.name.clone()));
                }
            };
            values.insert(input.name.clone(), value);
        }
        Ok(values)
    }

    /// Resolves declared workflow outputs from completed steps.
    fn resolve_workflow_outputs(
        &self,
        workflow_values: &HashMap<String, Value>,
        statuses: &HashMap<String, StepStatus>,
        step_outputs: &OutputStore,
    ) -> HashMap<String, Value> {
        let mut outputs = HashMap::new();
        for declared in &self.pipeline.workflow.outputs {
            let value = match &declared.source {
                SourceRef::WorkflowInput(name) => workflow_values.get(name).cloned(),
                SourceRef::StepOutput { step, output } => {
                    if statuses.get(step) == Some(&StepStatus::Completed) {
                        step_outputs.get(step).and_then(|o| o.get(output)).cloned()
                    } else {
                        warn!(
                            "workflow output '{}' omitted: step '{}' did not complete",
                            declared.name, step
                        );
                        None
                    }
                }
                SourceRef::Literal(v) => Some(v.clone()),
            };
            if let Some(value) = value {
                outputs.insert(declared.name.clone(), value);
            }
        }
        outputs
    }
}

/// Completed step outputs, reference-counted by remaining consumer
/// edges.
///
/// Construction counts one edge per dependent step plus one per
/// workflow output drawing on the step. Edges are released as their
/// consumers dispatch (or are skipped); at zero the producer's file
/// values are dropped.
struct OutputStore {
    outputs: HashMap<String, HashMap<String, Value>>,
    consumers: HashMap<String, usize>,
}

impl OutputStore {
    fn new(pipeline: &Pipeline, graph: &ExecutionGraph) -> Self {
        let mut consumers: HashMap<String, usize> = HashMap::new();
        for step_id in graph.topological_order() {
            for dep in graph.deps(step_id) {
                *consumers.entry(dep.to_string()).or_insert(0) += 1;
            }
        }
        for output in &pipeline.workflow.outputs {
            if let SourceRef::StepOutput { step, .. } = &output.source {
                *consumers.entry(step.clone()).or_insert(0) += 1;
            }
        }
        Self {
            outputs: HashMap::new(),
            consumers,
        }
    }

    fn insert(&mut self, step_id: String, outputs: HashMap<String, Value>) {
        if self.consumers.get(&step_id).copied().unwrap_or(0) == 0 {
            debug!("discarding outputs of step '{}': nothing consumes them", step_id);
            return;
        }
        self.outputs.insert(step_id, outputs);
    }

    fn get(&self, step_id: &str) -> Option<&HashMap<String, Value>> {
        self.outputs.get(step_id)
    }

    /// Releases one consumer edge per dependency of a consuming step.
    fn release<'a>(&mut self, deps: impl Iterator<Item = &'a str>) {
        for dep in deps {
            if let Some(count) = self.consumers.get_mut(dep) {
                *count = count.saturating_sub(1);
                if *count == 0 && self.outputs.remove(dep).is_some() {
                    debug!("discarding outputs of step '{}': last consumer dispatched", dep);
                }
            }
        }
    }
}

/// Gathers the values a step's bindings point at.
///
/// Dependencies are known to have completed; anything still missing
/// resolves to [`Value::Unset`] and is caught by input resolution.
fn collect_bindings(
    step: &WorkflowStep,
    workflow_values: &HashMap<String, Value>,
    step_outputs: &OutputStore,
) -> HashMap<String, Value> {
    step.bindings
        .iter()
        .map(|(input, source)| {
            let value = match source {
                SourceRef::WorkflowInput(name) => {
                    workflow_values.get(name).cloned().unwrap_or(Value::Unset)
                }
                SourceRef::StepOutput { step, output } => step_outputs
                    .get(step)
                    .and_then(|outputs| outputs.get(output))
                    .cloned()
                    .unwrap_or(Value::Unset),
                SourceRef::Literal(value) => value.clone(),
            };
            (input.clone(), value)
        })
        .collect()
}

/// Runs one step: resolve, expand, invoke per shard, gather.
///
/// A failing shard fails the whole step and discards results from the
/// other shards.
fn execute_step(
    step_id: &str,
    task: &TaskDescriptor,
    scatter: &[String],
    bound: &HashMap<String, Value>,
    adapter: &dyn Adapter,
    budget: &InvocationBudget,
) -> Result<HashMap<String, Value>, StepError> {
    let resolved = resolve_scattered(task, bound, scatter)?;
    let shards = scatter::expand(step_id, scatter, &resolved)?;

    if scatter.is_empty() {
        let permit = budget.acquire();
        let raw = adapter.invoke(task, &shards[0]);
        drop(permit);
        return shape_outputs(task, raw?);
    }

    debug!(
        "step '{}' scattered into {} sub-invocation(s)",
        step_id,
        shards.len()
    );

    let results: Vec<Result<HashMap<String, String>, AdapterFailure>> = thread::scope(|scope| {
        let workers: Vec<_> = shards
            .iter()
            .map(|shard| {
                scope.spawn(move || {
                    let _permit = budget.acquire();
                    adapter.invoke(task, shard)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker.join().unwrap_or_else(|_| {
                    Err(AdapterFailure::new(&task.name, "invocation thread panicked"))
                })
            })
            .collect()
    });

    let mut shard_outputs = Vec::with_capacity(shards.len());
    for raw in results {
        shard_outputs.push(shape_outputs(task, raw?)?);
    }

    Ok(scatter::gather(task, shard_outputs))
}

/// Turns an adapter's primary paths into file values with attached
/// secondary files, checking that every declared output was reported.
fn shape_outputs(
    task: &TaskDescriptor,
    raw: HashMap<String, String>,
) -> Result<HashMap<String, Value>, StepError> {
    let mut outputs = HashMap::with_capacity(task.outputs.len());
    for spec in &task.outputs {
        let primary = raw.get(&spec.name).ok_or_else(|| StepError::MissingOutput {
            task: task.name.clone(),
            output: spec.name.clone(),
        })?;
        let secondary = attach(primary, &spec.secondary);
        outputs.insert(
            spec.name.clone(),
            Value::File(FileValue::new(primary.clone()).with_secondary(secondary)),
        );
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Derivation, InputSpec, OutputSpec, SecondaryPattern};
    use crate::value::ValueType;
    use crate::workflow::{Workflow, WorkflowInput};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Adapter that derives output paths without running anything, and
    /// records every invocation it receives.
    struct RecordingAdapter {
        invocations: Mutex<Vec<(String, HashMap<String, Value>)>>,
        fail_tasks: Vec<String>,
        fail_on_input: Option<(String, String)>,
        cancel_on_invoke: Option<CancelHandle>,
    }

    impl RecordingAdapter {
        fn new() -> Self {
            Self {
                invocations: Mutex::new(Vec::new()),
                fail_tasks: Vec::new(),
                fail_on_input: None,
                cancel_on_invoke: None,
            }
        }

        fn failing(task: &str) -> Self {
            let mut adapter = Self::new();
            adapter.fail_tasks.push(task.to_string());
            adapter
        }

        fn invocation_count(&self, task: &str) -> usize {
            self.invocations
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == task)
                .count()
        }
    }

    impl Adapter for RecordingAdapter {
        fn invoke(
            &self,
            task: &TaskDescriptor,
            inputs: &HashMap<String, Value>,
        ) -> Result<HashMap<String, String>, AdapterFailure> {
            self.invocations
                .lock()
                .unwrap()
                .push((task.name.clone(), inputs.clone()));
            if let Some(handle) = &self.cancel_on_invoke {
                handle.cancel();
            }
            if self.fail_tasks.contains(&task.name) {
                return Err(AdapterFailure::new(&task.name, "simulated failure"));
            }
            if let Some((input, needle)) = &self.fail_on_input {
                let matches = inputs
                    .get(input)
                    .map(|value| value.to_command_string() == *needle)
                    .unwrap_or(false);
                if matches {
                    return Err(AdapterFailure::new(&task.name, "simulated failure"));
                }
            }
            let mut outputs = HashMap::new();
            for spec in &task.outputs {
                let path = spec
                    .derivation
                    .derive(inputs)
                    .map_err(|e| AdapterFailure::new(&task.name, e.to_string()))?;
                outputs.insert(spec.name.clone(), path);
            }
            Ok(outputs)
        }
    }

    fn align_task() -> TaskDescriptor {
        TaskDescriptor::new("bwa_align", "1.0")
            .with_command("bwa mem {reference} {reads} > {bam}")
            .with_input(
                InputSpec::new("reference", ValueType::File).with_secondary(vec![
                    SecondaryPattern::parse(".fai").unwrap(),
                    SecondaryPattern::parse("^.dict").unwrap(),
                ]),
            )
            .with_input(InputSpec::new("reads", ValueType::File))
            .with_output(OutputSpec::new(
                "bam",
                Derivation::ReplaceExtension {
                    input: "reads".to_string(),
                    ext: ".bam".to_string(),
                },
            ))
    }

    fn mark_duplicates_task() -> TaskDescriptor {
        TaskDescriptor::new("mark_duplicates", "1.0")
            .with_command("gatk MarkDuplicates -I {bam} -O {md_bam}")
            .with_input(InputSpec::new("bam", ValueType::File))
            .with_output(
                OutputSpec::new(
                    "md_bam",
                    Derivation::ReplaceExtension {
                        input: "bam".to_string(),
                        ext: ".md.bam".to_string(),
                    },
                )
                .with_secondary(vec![SecondaryPattern::parse(".bai").unwrap()]),
            )
    }

    fn call_variants_task() -> TaskDescriptor {
        TaskDescriptor::new("haplotype_caller", "1.0")
            .with_command("gatk HaplotypeCaller -I {bam} -L {interval} -O {vcf}")
            .with_input(InputSpec::new("bam", ValueType::File))
            .with_input(InputSpec::new("interval", ValueType::Scalar))
            .with_output(OutputSpec::new(
                "vcf",
                Derivation::FromInput("interval".to_string()),
            ))
    }

    fn variant_pipeline() -> Pipeline {
        let workflow = Workflow::new("variant_calling")
            .with_input(WorkflowInput::new("reference", ValueType::File))
            .with_input(WorkflowInput::new("reads", ValueType::File))
            .with_input(WorkflowInput::new("intervals", ValueType::Array))
            .with_step(
                WorkflowStep::new("align", "bwa_align")
                    .bind_input("reference")
                    .bind_input("reads"),
            )
            .with_step(
                WorkflowStep::new("mark_duplicates", "mark_duplicates")
                    .bind_step("bam", "align", "bam"),
            )
            .with_step(
                WorkflowStep::new("call_variants", "haplotype_caller")
                    .bind_step("bam", "mark_duplicates", "md_bam")
                    .bind("interval", SourceRef::WorkflowInput("intervals".to_string()))
                    .scatter_over("interval"),
            )
            .with_output(
                "variants",
                SourceRef::StepOutput {
                    step: "call_variants".to_string(),
                    output: "vcf".to_string(),
                },
            );

        Pipeline::new(workflow)
            .with_task(align_task())
            .with_task(mark_duplicates_task())
            .with_task(call_variants_task())
    }

    fn pipeline_inputs() -> HashMap<String, Value> {
        let mut inputs = HashMap::new();
        inputs.insert("reference".to_string(), Value::string("ref.fasta"));
        inputs.insert("reads".to_string(), Value::string("sample.fastq"));
        inputs.insert(
            "intervals".to_string(),
            Value::Array(vec![
                Value::string("chr1"),
                Value::string("chr2"),
                Value::string("chr3"),
            ]),
        );
        inputs
    }

    #[test]
    fn test_linear_then_scattered_run() {
        let adapter = Arc::new(RecordingAdapter::new());
        let engine = Engine::new(variant_pipeline(), Arc::clone(&adapter) as Arc<dyn Adapter>);

        let report = engine.run(pipeline_inputs()).unwrap();
        assert!(report.success());
        assert_eq!(adapter.invocation_count("bwa_align"), 1);
        assert_eq!(adapter.invocation_count("mark_duplicates"), 1);
        assert_eq!(adapter.invocation_count("haplotype_caller"), 3);

        match report.outputs.get("variants") {
            Some(Value::Array(items)) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].as_file().map(|f| f.primary.as_str()), Some("chr1"));
                assert_eq!(items[2].as_file().map(|f| f.primary.as_str()), Some("chr3"));
            }
            other => panic!("expected gathered array, got {:?}", other),
        }
    }

    #[test]
    fn test_secondary_files_flow_through() {
        let adapter = Arc::new(RecordingAdapter::new());
        let engine = Engine::new(variant_pipeline(), Arc::clone(&adapter) as Arc<dyn Adapter>);
        engine.run(pipeline_inputs()).unwrap();

        let invocations = adapter.invocations.lock().unwrap();

        // Input coercion attached the reference index files.
        let (_, align_inputs) = invocations
            .iter()
            .find(|(name, _)| name == "bwa_align")
            .unwrap();
        let reference = align_inputs.get("reference").unwrap().as_file().unwrap();
        assert_eq!(reference.secondary, vec!["ref.fasta.fai", "ref.dict"]);

        // The index attached at mark_duplicates travelled to the caller.
        let (_, caller_inputs) = invocations
            .iter()
            .find(|(name, _)| name == "haplotype_caller")
            .unwrap();
        let bam = caller_inputs.get("bam").unwrap().as_file().unwrap();
        assert_eq!(bam.primary, "sample.md.bam");
        assert_eq!(bam.secondary, vec!["sample.md.bam.bai"]);
    }

    #[test]
    fn test_failure_skips_transitive_dependents() {
        let adapter = Arc::new(RecordingAdapter::failing("bwa_align"));
        let engine = Engine::new(variant_pipeline(), Arc::clone(&adapter) as Arc<dyn Adapter>);

        let report = engine.run(pipeline_inputs()).unwrap();
        assert!(!report.success());
        assert!(matches!(report.status("align"), Some(StepStatus::Failed(_))));
        assert_eq!(report.status("mark_duplicates"), Some(&StepStatus::Skipped));
        assert_eq!(report.status("call_variants"), Some(&StepStatus::Skipped));
        assert_eq!(adapter.invocation_count("mark_duplicates"), 0);
        assert!(report.outputs.is_empty());
    }

    #[test]
    fn test_failed_shard_discards_sibling_results() {
        let mut adapter = RecordingAdapter::new();
        adapter.fail_on_input = Some(("interval".to_string(), "chr2".to_string()));
        let adapter = Arc::new(adapter);
        let engine = Engine::new(variant_pipeline(), Arc::clone(&adapter) as Arc<dyn Adapter>);

        let report = engine.run(pipeline_inputs()).unwrap();
        assert!(!report.success());
        assert_eq!(report.status("align"), Some(&StepStatus::Completed));
        assert_eq!(report.status("mark_duplicates"), Some(&StepStatus::Completed));
        assert!(matches!(
            report.status("call_variants"),
            Some(StepStatus::Failed(_))
        ));
        // All shards were attempted, but the chr1/chr3 results were
        // thrown away with the step.
        assert_eq!(adapter.invocation_count("haplotype_caller"), 3);
        assert!(report.outputs.get("variants").is_none());
    }

    #[test]
    fn test_independent_branch_survives_failure() {
        let workflow = Workflow::new("two_branches")
            .with_input(WorkflowInput::new("reads", ValueType::File))
            .with_step(WorkflowStep::new("bad", "broken").bind_input("reads"))
            .with_step(
                WorkflowStep::new("good", "bwa_align")
                    .bind("reference", SourceRef::WorkflowInput("reads".to_string()))
                    .bind_input("reads"),
            );
        let pipeline = Pipeline::new(workflow)
            .with_task(align_task())
            .with_task(
                TaskDescriptor::new("broken", "1.0")
                    .with_command("false")
                    .with_input(InputSpec::new("reads", ValueType::File)),
            );

        let adapter = Arc::new(RecordingAdapter::failing("broken"));
        let engine = Engine::new(pipeline, Arc::clone(&adapter) as Arc<dyn Adapter>);

        let mut inputs = HashMap::new();
        inputs.insert("reads".to_string(), Value::string("sample.fastq"));
        let report = engine.run(inputs).unwrap();

        assert!(matches!(report.status("bad"), Some(StepStatus::Failed(_))));
        assert_eq!(report.status("good"), Some(&StepStatus::Completed));
    }

    #[test]
    fn test_scatter_length_mismatch_fails_step() {
        let workflow = Workflow::new("zip_mismatch")
            .with_input(WorkflowInput::new("bams", ValueType::Array))
            .with_input(WorkflowInput::new("intervals", ValueType::Array))
            .with_step(
                WorkflowStep::new("call", "haplotype_caller")
                    .bind("bam", SourceRef::WorkflowInput("bams".to_string()))
                    .bind("interval", SourceRef::WorkflowInput("intervals".to_string()))
                    .scatter_over("bam")
                    .scatter_over("interval"),
            );
        let pipeline = Pipeline::new(workflow).with_task(call_variants_task());

        let adapter = Arc::new(RecordingAdapter::new());
        let engine = Engine::new(pipeline, Arc::clone(&adapter) as Arc<dyn Adapter>);

        let mut inputs = HashMap::new();
        inputs.insert(
            "bams".to_string(),
            Value::Array(vec![Value::file("a.bam"), Value::file("b.bam")]),
        );
        inputs.insert(
            "intervals".to_string(),
            Value::Array(vec![Value::string("chr1")]),
        );
        let report = engine.run(inputs).unwrap();

        match report.status("call") {
            Some(StepStatus::Failed(reason)) => assert!(reason.contains("length mismatch")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(adapter.invocation_count("haplotype_caller"), 0);
    }

    #[test]
    fn test_outputs_dropped_after_last_consumer_dispatches() {
        let pipeline = variant_pipeline();
        let graph = ExecutionGraph::build(&pipeline).unwrap();
        let mut store = OutputStore::new(&pipeline, &graph);

        let mut align_outputs = HashMap::new();
        align_outputs.insert("bam".to_string(), Value::file("sample.bam"));
        store.insert("align".to_string(), align_outputs);
        assert!(store.get("align").is_some());

        // mark_duplicates is align's only consumer.
        store.release(graph.deps("mark_duplicates"));
        assert!(store.get("align").is_none());
    }

    #[test]
    fn test_outputs_feeding_workflow_outputs_are_retained() {
        let pipeline = variant_pipeline();
        let graph = ExecutionGraph::build(&pipeline).unwrap();
        let mut store = OutputStore::new(&pipeline, &graph);

        let mut call_outputs = HashMap::new();
        call_outputs.insert("vcf".to_string(), Value::file("calls.vcf"));
        store.insert("call_variants".to_string(), call_outputs);

        // The 'variants' workflow output holds an edge on call_variants,
        // so its results survive until the end of the run.
        assert!(store.get("call_variants").is_some());
    }

    /// Adapter that records how many invocations overlap in time.
    struct GaugeAdapter {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GaugeAdapter {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl Adapter for GaugeAdapter {
        fn invoke(
            &self,
            task: &TaskDescriptor,
            inputs: &HashMap<String, Value>,
        ) -> Result<HashMap<String, String>, AdapterFailure> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut outputs = HashMap::new();
            for spec in &task.outputs {
                let path = spec
                    .derivation
                    .derive(inputs)
                    .map_err(|e| AdapterFailure::new(&task.name, e.to_string()))?;
                outputs.insert(spec.name.clone(), path);
            }
            Ok(outputs)
        }
    }

    #[test]
    fn test_parallel_limit_caps_concurrent_invocations() {
        // Two independent scattered steps run at the same time; their
        // shard workers draw from one budget.
        let workflow = Workflow::new("two_scatters")
            .with_input(WorkflowInput::new("bam", ValueType::File))
            .with_input(WorkflowInput::new("intervals", ValueType::Array))
            .with_step(
                WorkflowStep::new("call_a", "haplotype_caller")
                    .bind_input("bam")
                    .bind("interval", SourceRef::WorkflowInput("intervals".to_string()))
                    .scatter_over("interval"),
            )
            .with_step(
                WorkflowStep::new("call_b", "haplotype_caller")
                    .bind_input("bam")
                    .bind("interval", SourceRef::WorkflowInput("intervals".to_string()))
                    .scatter_over("interval"),
            );
        let pipeline = Pipeline::new(workflow).with_task(call_variants_task());

        let adapter = Arc::new(GaugeAdapter::new());
        let mut engine = Engine::new(pipeline, Arc::clone(&adapter) as Arc<dyn Adapter>);
        engine.set_max_parallel(2);

        let mut inputs = HashMap::new();
        inputs.insert("bam".to_string(), Value::file("sample.bam"));
        inputs.insert(
            "intervals".to_string(),
            Value::Array(vec![
                Value::string("chr1"),
                Value::string("chr2"),
                Value::string("chr3"),
                Value::string("chr4"),
            ]),
        );
        let report = engine.run(inputs).unwrap();

        assert!(report.success());
        let peak = adapter.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak concurrency was {}", peak);
    }

    #[test]
    fn test_missing_required_workflow_input() {
        let engine = Engine::new(
            variant_pipeline(),
            Arc::new(RecordingAdapter::new()) as Arc<dyn Adapter>,
        );
        let err = engine.run(HashMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::MissingWorkflowInput(_)));
    }

    #[test]
    fn test_graph_error_aborts_before_execution() {
        let workflow = Workflow::new("broken_ref")
            .with_step(WorkflowStep::new("a", "bwa_align").bind_step("reads", "ghost", "bam"));
        let pipeline = Pipeline::new(workflow).with_task(align_task());

        let adapter = Arc::new(RecordingAdapter::new());
        let engine = Engine::new(pipeline, Arc::clone(&adapter) as Arc<dyn Adapter>);

        let err = engine.run(HashMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::Graph(_)));
        assert!(adapter.invocations.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_before_run_marks_all_cancelled() {
        let adapter = Arc::new(RecordingAdapter::new());
        let engine = Engine::new(variant_pipeline(), Arc::clone(&adapter) as Arc<dyn Adapter>);
        engine.cancel_handle().cancel();

        let report = engine.run(pipeline_inputs()).unwrap();
        assert!(!report.success());
        for status in report.statuses.values() {
            assert_eq!(status, &StepStatus::Cancelled);
        }
        assert!(adapter.invocations.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_mid_run_lets_running_step_finish() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut adapter = RecordingAdapter::new();
        adapter.cancel_on_invoke = Some(CancelHandle(Arc::clone(&flag)));

        let adapter = Arc::new(adapter);
        let mut engine = Engine::new(variant_pipeline(), Arc::clone(&adapter) as Arc<dyn Adapter>);
        engine.cancel = flag;
        engine.set_max_parallel(1);

        let report = engine.run(pipeline_inputs()).unwrap();
        // The first step ran to completion, everything downstream was
        // cancelled before dispatch.
        assert_eq!(report.status("align"), Some(&StepStatus::Completed));
        assert_eq!(report.status("mark_duplicates"), Some(&StepStatus::Cancelled));
        assert_eq!(report.status("call_variants"), Some(&StepStatus::Cancelled));
        assert_eq!(adapter.invocation_count("bwa_align"), 1);
        assert_eq!(adapter.invocation_count("mark_duplicates"), 0);
    }

    #[test]
    fn test_dry_run_invokes_nothing() {
        let adapter = Arc::new(RecordingAdapter::new());
        let mut engine = Engine::new(variant_pipeline(), Arc::clone(&adapter) as Arc<dyn Adapter>);
        engine.set_dry_run(true);

        let report = engine.run(pipeline_inputs()).unwrap();
        assert!(report.success());
        assert!(adapter.invocations.lock().unwrap().is_empty());
        // Step outputs are not materialized in a dry run.
        assert!(report.outputs.is_empty());
    }

    #[test]
    fn test_literal_binding_reaches_adapter() {
        let workflow = Workflow::new("literal")
            .with_input(WorkflowInput::new("reads", ValueType::File))
            .with_step(
                WorkflowStep::new("align", "bwa_align")
                    .bind("reference", SourceRef::Literal(Value::string("hg38.fasta")))
                    .bind_input("reads"),
            );
        let pipeline = Pipeline::new(workflow).with_task(align_task());

        let adapter = Arc::new(RecordingAdapter::new());
        let engine = Engine::new(pipeline, Arc::clone(&adapter) as Arc<dyn Adapter>);

        let mut inputs = HashMap::new();
        inputs.insert("reads".to_string(), Value::string("sample.fastq"));
        engine.run(inputs).unwrap();

        let invocations = adapter.invocations.lock().unwrap();
        let (_, align_inputs) = &invocations[0];
        let reference = align_inputs.get("reference").unwrap().as_file().unwrap();
        assert_eq!(reference.primary, "hg38.fasta");
    }
}
