//! The chain: the ordered list of instantiated stages and their buffers.
//!
//! A [`Chain`] is built from the resolved order of a [`Registry`] and drives
//! every lifecycle phase across its stages in pipeline order. Stage N's output
//! shape is stage N+1's input shape during Validate, and stage N's output
//! buffer is stage N+1's input buffer during Execute.
//!
//! # Per-call boundary
//!
//! Every stage call goes through one wrapper that turns a returned
//! [`StageError`](crate::pipeline::error::StageError) or a panic into a
//! diagnostic tagged with the stage name and phase. Per-block calls are also
//! timed against the block duration and, when profiling is on, recorded into
//! the stage's [`PerformanceData`].
//!
//! # Buffers
//!
//! The chain owns one output buffer per stage, allocated at Allocate from the
//! validated shapes. The final buffer is copied into the caller's output; no
//! reference to an internal buffer outlives an `execute_block` call.

use crate::pipeline::diagnostics::{Diagnostic, DiagnosticSink};
use crate::pipeline::environment::{Environment, SAMPLE_BLOCK_SIZE, VISUALIZE_SECTION};
use crate::pipeline::error::{ChainError, ChainResult, StageResult};
use crate::pipeline::params::{ParamDecl, ParamValue};
use crate::pipeline::phase::{ChainState, Phase};
use crate::pipeline::profiling::{PerformanceData, StopWatch};
use crate::pipeline::registrar::{ChainEntry, ChainInfo, Registry};
use crate::pipeline::signal::{SignalBuffer, SignalShape};
use crate::pipeline::stage::{BlockContext, Stage, StageContext, Surface};
use crate::pipeline::states::StateVector;
use crate::pipeline::visualization::{VisKind, VisualizationSink};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

/// Warning text for a per-block call that overran its budget.
pub const OVERRUN_MESSAGE: &str = "Execution required more than a sample block duration";

const PATH_SEPARATOR: char = '/';

/// Performance of one stage, as reported by [`Chain::performance`].
#[derive(Debug, Clone, PartialEq)]
pub struct StagePerformance {
    pub position: String,
    pub name: String,
    pub data: PerformanceData,
}

struct Slot {
    stage: Box<dyn Stage>,
    name: String,
    position: String,
    /// `Visualize<Name>`, for stages that allow visualization.
    vis_param: Option<String>,
    vis_enabled: bool,
    allocated: bool,
    /// Set by a successful RunStart, cleared by RunStop.
    started: bool,
    profiling: bool,
    perf: PerformanceData,
    input_shape: SignalShape,
    output_shape: SignalShape,
    output: SignalBuffer,
}

/// Ordered, instantiated stages plus their buffers and taps.
pub struct Chain {
    path: String,
    slots: Vec<Slot>,
    vis: Box<dyn VisualizationSink>,
    state: ChainState,
    input_shape: Option<SignalShape>,
    output_shape: Option<SignalShape>,
    timed: bool,
    block_duration: Duration,
    blocks: u64,
}

impl Chain {
    /// Instantiate one stage per surviving registrar, in pipeline order.
    pub fn instantiate(registry: &Registry, vis: Box<dyn VisualizationSink>) -> ChainResult<Self> {
        Self::with_path("", registry, vis)
    }

    /// Like [`instantiate`](Self::instantiate) for a chain nested under `path`.
    pub fn with_path(
        path: impl Into<String>,
        registry: &Registry,
        vis: Box<dyn VisualizationSink>,
    ) -> ChainResult<Self> {
        let mut chain = Self {
            path: path.into(),
            slots: Vec::new(),
            vis,
            state: ChainState::Released,
            input_shape: None,
            output_shape: None,
            timed: false,
            block_duration: Duration::ZERO,
            blocks: 0,
        };
        chain.reinstantiate(registry)?;
        Ok(chain)
    }

    /// Rebuild the stage list from `registry` after a release.
    pub fn reinstantiate(&mut self, registry: &Registry) -> ChainResult<()> {
        self.enter(Phase::Instantiate)?;

        let mut slots = Vec::with_capacity(registry.len());
        for registrar in registry.resolved() {
            let placement = registrar.placement(&self.path);
            let stage = panic::catch_unwind(AssertUnwindSafe(|| registrar.create(&placement)))
                .map_err(|payload| {
                    tracing::error!(
                        "{}::Instantiate panicked: {}",
                        registrar.type_name(),
                        panic_message(payload.as_ref())
                    );
                    ChainError::StageFailed {
                        stage: registrar.type_name().to_string(),
                        phase: Phase::Instantiate,
                    }
                })?;
            let name = registrar.type_name().to_string();
            let vis_param = if stage.allows_visualization() {
                self.vis.create(registrar.position(), VisKind::Signal);
                Some(format!("Visualize{}", name))
            } else {
                None
            };
            slots.push(Slot {
                stage,
                name,
                position: registrar.position().to_string(),
                vis_param,
                vis_enabled: false,
                allocated: false,
                started: false,
                profiling: false,
                perf: PerformanceData::default(),
                input_shape: SignalShape::default(),
                output_shape: SignalShape::default(),
                output: SignalBuffer::new(SignalShape::default()),
            });
        }

        self.slots = slots;
        self.input_shape = None;
        self.output_shape = None;
        self.state = ChainState::Instantiated;
        tracing::info!("Instantiated chain: {}", self.info());
        Ok(())
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Pipeline order as (position, stage name) pairs.
    pub fn info(&self) -> ChainInfo {
        ChainInfo(
            self.slots
                .iter()
                .map(|s| ChainEntry {
                    position: s.position.clone(),
                    name: s.name.clone(),
                })
                .collect(),
        )
    }

    /// Validated input shape of the whole chain.
    pub fn input_shape(&self) -> Option<&SignalShape> {
        self.input_shape.as_ref()
    }

    /// Validated output shape of the whole chain.
    pub fn output_shape(&self) -> Option<&SignalShape> {
        self.output_shape.as_ref()
    }

    /// Validated output shape of every stage, in pipeline order.
    pub fn stage_shapes(&self) -> Vec<SignalShape> {
        self.slots.iter().map(|s| s.output_shape.clone()).collect()
    }

    /// Shapes of the buffers at every stage boundary, external input first:
    /// N+1 entries for N stages once allocated, empty before validation.
    pub fn buffer_shapes(&self) -> Vec<SignalShape> {
        match &self.input_shape {
            Some(input) => std::iter::once(input.clone())
                .chain(self.slots.iter().map(|s| s.output.shape().clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether the tap of the stage named `name` is enabled.
    pub fn visualization_enabled(&self, name: &str) -> bool {
        self.slots.iter().any(|s| s.name == name && s.vis_enabled)
    }

    pub fn timing_enabled(&self) -> bool {
        self.timed
    }

    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Blocks processed since the last run start.
    pub fn blocks_processed(&self) -> u64 {
        self.blocks
    }

    // ── Profiling ──────────────────────────────────────────────────

    /// Enable or disable profiling for every stage.
    pub fn set_profiling(&mut self, enabled: bool) {
        for slot in &mut self.slots {
            slot.profiling = enabled;
        }
    }

    /// Enable or disable profiling for the stage named `name`.
    /// Returns `false` if no such stage exists.
    pub fn set_stage_profiling(&mut self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for slot in self.slots.iter_mut().filter(|s| s.name == name) {
            slot.profiling = enabled;
            found = true;
        }
        found
    }

    pub fn performance(&self) -> Vec<StagePerformance> {
        self.slots
            .iter()
            .map(|s| StagePerformance {
                position: s.position.clone(),
                name: s.name.clone(),
                data: s.perf,
            })
            .collect()
    }

    pub fn stage_performance(&self, name: &str) -> Option<PerformanceData> {
        self.slots.iter().find(|s| s.name == name).map(|s| s.perf)
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    fn enter(&self, phase: Phase) -> ChainResult<()> {
        if self.state.permits(phase) {
            tracing::debug!("Chain {:?}: {} from {}", self.path, phase, self.state);
            Ok(())
        } else {
            Err(ChainError::PhaseOrder {
                phase,
                state: self.state,
            })
        }
    }

    /// Let every stage declare its parameters, states and events.
    pub fn declare<D: DiagnosticSink>(&mut self, env: &mut Environment<D>) -> ChainResult<()> {
        self.enter(Phase::Declare)?;
        let errors_before = env.diagnostics.error_count();

        for slot in &mut self.slots {
            if let Some(param) = &slot.vis_param {
                env.parameters.declare(
                    ParamDecl::new(VISUALIZE_SECTION, param.as_str(), 0i64)
                        .range(0.0, 1.0)
                        .comment(format!("Visualize {} output (boolean)", slot.name)),
                );
            }
            let mut surface = Surface::new(&mut env.parameters, &mut env.states);
            call_stage(&slot.name, Phase::Declare, &mut env.diagnostics, |_| {
                slot.stage.declare(&mut surface)
            });
        }

        let errors = env.diagnostics.error_count().saturating_sub(errors_before);
        if errors > 0 {
            self.state = ChainState::Faulted;
            return Err(ChainError::ConfigurationRejected { errors });
        }
        self.state = ChainState::Declared;
        Ok(())
    }

    /// Auto-configure and validate every stage, propagating shapes.
    ///
    /// Validation errors accumulate across all stages before the chain
    /// decides; an auto-configuration error stops the walk at that stage.
    /// On success the chain's output shape is returned and Allocate becomes
    /// possible. On failure the chain stays declared and may be validated
    /// again with corrected parameters.
    pub fn validate<D: DiagnosticSink>(
        &mut self,
        input: &SignalShape,
        env: &mut Environment<D>,
    ) -> ChainResult<SignalShape> {
        self.enter(Phase::Validate)?;
        self.state = ChainState::Declared;
        self.input_shape = None;
        self.output_shape = None;
        env.parameters.clear_derived();
        let errors_before = env.diagnostics.error_count();

        let mut current = input.clone();
        for slot in &mut self.slots {
            slot.input_shape = current.clone();

            let auto_errors = env.diagnostics.error_count();
            call_stage(&slot.name, Phase::AutoConfig, &mut env.diagnostics, |diag| {
                let mut ctx = StageContext::new(
                    &slot.name,
                    Phase::AutoConfig,
                    &mut env.parameters,
                    &env.states,
                    diag,
                );
                slot.stage.auto_config(&current, &mut ctx)
            });
            if env.diagnostics.error_count() > auto_errors {
                let errors = env.diagnostics.error_count().saturating_sub(errors_before);
                tracing::warn!("{}: auto-configuration failed, validation stopped", slot.name);
                return Err(ChainError::ConfigurationRejected { errors });
            }

            let validated = call_stage(&slot.name, Phase::Validate, &mut env.diagnostics, |diag| {
                let mut ctx = StageContext::new(
                    &slot.name,
                    Phase::Validate,
                    &mut env.parameters,
                    &env.states,
                    diag,
                );
                slot.stage.validate(&current, &mut ctx)
            });

            let mut output = validated.unwrap_or_else(|| current.clone());
            if output.name.is_empty() || output.name == current.name {
                output.name = if self.path.is_empty() {
                    slot.name.clone()
                } else {
                    format!("{}{}{}", self.path, PATH_SEPARATOR, slot.name)
                };
            }
            slot.output_shape = output.clone();
            current = output;
        }

        let errors = env.diagnostics.error_count().saturating_sub(errors_before);
        if errors > 0 {
            tracing::warn!("Validation rejected with {} error(s)", errors);
            return Err(ChainError::ConfigurationRejected { errors });
        }

        self.input_shape = Some(input.clone());
        self.output_shape = Some(current.clone());
        self.state = ChainState::Validated;
        tracing::debug!("Validated chain: {} -> {}", input, current);
        Ok(current)
    }

    /// Allocate buffers and per-run resources, and set up visualization taps.
    pub fn allocate<D: DiagnosticSink>(&mut self, env: &mut Environment<D>) -> ChainResult<()> {
        self.enter(Phase::Allocate)?;
        let (samples, block_duration) = env.block_geometry()?;
        let validated = self.input_shape.as_ref().map_or(0, SignalShape::samples);
        if validated != samples {
            return Err(ChainError::InvalidBlock(format!(
                "validated input carries {} samples per block, {} is {}",
                validated, SAMPLE_BLOCK_SIZE, samples
            )));
        }

        self.block_duration = block_duration;
        self.timed = env.timing_enabled();
        self.blocks = 0;
        env.state_vector = StateVector::new(&env.states, samples);

        for slot in &mut self.slots {
            slot.perf.reset(block_duration);
            slot.output = SignalBuffer::new(slot.output_shape.clone());

            let ok = call_stage(&slot.name, Phase::Allocate, &mut env.diagnostics, |diag| {
                let mut ctx = StageContext::new(
                    &slot.name,
                    Phase::Allocate,
                    &mut env.parameters,
                    &env.states,
                    diag,
                );
                slot.stage
                    .allocate(&slot.input_shape, &slot.output_shape, &mut ctx)
            })
            .is_some();
            if !ok {
                self.state = ChainState::Faulted;
                return Err(ChainError::StageFailed {
                    stage: slot.name.clone(),
                    phase: Phase::Allocate,
                });
            }
            slot.allocated = true;

            slot.vis_enabled = false;
            if let Some(param) = &slot.vis_param {
                let enabled = env
                    .parameters
                    .optional(param, ParamValue::Int(0))
                    .as_bool()
                    .unwrap_or(false);
                if enabled {
                    self.vis.push_shape(&slot.position, &slot.output_shape);
                    self.vis.push_signal(
                        &slot.position,
                        &SignalBuffer::undefined(slot.output_shape.clone()),
                    );
                }
                self.vis.set_visible(&slot.position, enabled);
                slot.vis_enabled = enabled;
            }
        }

        self.state = ChainState::Allocated;
        tracing::debug!(
            "Allocated chain: {} stage(s), block {} samples / {:?}, timing {}",
            self.slots.len(),
            samples,
            block_duration,
            if self.timed { "on" } else { "off" }
        );
        Ok(())
    }

    /// Start a recording run.
    pub fn run_start<D: DiagnosticSink>(&mut self, env: &mut Environment<D>) -> ChainResult<()> {
        self.enter(Phase::RunStart)?;
        self.blocks = 0;
        env.state_vector.reset();
        if let Some(stage) = self.walk(Phase::RunStart, env, true) {
            self.state = ChainState::Faulted;
            return Err(ChainError::StageFailed {
                stage,
                phase: Phase::RunStart,
            });
        }
        self.state = ChainState::Running;
        Ok(())
    }

    /// Process one block while running.
    pub fn execute_block<D: DiagnosticSink>(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        env: &mut Environment<D>,
    ) -> ChainResult<()> {
        self.enter(Phase::Execute)?;
        self.process(Phase::Execute, input, output, env)
    }

    /// Process one block while idle between runs.
    pub fn rest_block<D: DiagnosticSink>(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        env: &mut Environment<D>,
    ) -> ChainResult<()> {
        self.enter(Phase::Resting)?;
        self.process(Phase::Resting, input, output, env)
    }

    /// End the current run. Every stage is stopped even if one fails.
    pub fn run_stop<D: DiagnosticSink>(&mut self, env: &mut Environment<D>) -> ChainResult<()> {
        self.enter(Phase::RunStop)?;
        let failed = self.walk(Phase::RunStop, env, false);
        if self.state == ChainState::Running {
            self.state = ChainState::Allocated;
        }
        match failed {
            Some(stage) => Err(ChainError::StageFailed {
                stage,
                phase: Phase::RunStop,
            }),
            None => Ok(()),
        }
    }

    /// Stop asynchronous stage activity without releasing resources.
    pub fn halt<D: DiagnosticSink>(&mut self, env: &mut Environment<D>) -> ChainResult<()> {
        self.enter(Phase::Halt)?;
        match self.walk(Phase::Halt, env, false) {
            Some(stage) => Err(ChainError::StageFailed {
                stage,
                phase: Phase::Halt,
            }),
            None => Ok(()),
        }
    }

    /// Release every allocated stage, then drop all stages and buffers.
    pub fn release<D: DiagnosticSink>(&mut self, env: &mut Environment<D>) -> ChainResult<()> {
        self.enter(Phase::Release)?;
        let failed = self.walk(Phase::Release, env, false);
        for slot in &mut self.slots {
            slot.allocated = false;
            slot.started = false;
        }
        let released = self.slots.len();
        self.slots.clear();
        self.input_shape = None;
        self.output_shape = None;
        self.blocks = 0;
        self.state = ChainState::Released;
        tracing::info!("Released chain with {} stage(s)", released);
        match failed {
            Some(stage) => Err(ChainError::StageFailed {
                stage,
                phase: Phase::Release,
            }),
            None => Ok(()),
        }
    }

    /// Call a context-only phase on every allocated stage, in pipeline order.
    /// RunStop only reaches stages whose RunStart succeeded.
    /// With `stop_on_error`, the walk ends at the first failing stage.
    /// Returns the name of the first failing stage.
    fn walk<D: DiagnosticSink>(
        &mut self,
        phase: Phase,
        env: &mut Environment<D>,
        stop_on_error: bool,
    ) -> Option<String> {
        let mut failed = None;
        let targets = self.slots.iter_mut().filter(|s| match phase {
            Phase::RunStop => s.started,
            _ => s.allocated,
        });
        for slot in targets {
            let ok = call_stage(&slot.name, phase, &mut env.diagnostics, |diag| {
                let mut ctx =
                    StageContext::new(&slot.name, phase, &mut env.parameters, &env.states, diag);
                match phase {
                    Phase::RunStart => slot.stage.run_start(&mut ctx),
                    Phase::RunStop => slot.stage.run_stop(&mut ctx),
                    Phase::Halt => slot.stage.halt(&mut ctx),
                    _ => slot.stage.release(&mut ctx),
                }
            })
            .is_some();
            match phase {
                Phase::RunStart => slot.started = ok,
                Phase::RunStop => slot.started = false,
                _ => {}
            }
            if !ok && failed.is_none() {
                failed = Some(slot.name.clone());
                if stop_on_error {
                    break;
                }
            }
        }
        failed
    }

    fn process<D: DiagnosticSink>(
        &mut self,
        phase: Phase,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        env: &mut Environment<D>,
    ) -> ChainResult<()> {
        if let Some(expected) = &self.input_shape {
            if !expected.same_dimensions(input.shape()) {
                return Err(ChainError::InputMismatch {
                    expected: format!("{}x{}", expected.channels(), expected.samples()),
                    actual: format!("{}x{}", input.channels(), input.samples()),
                });
            }
        }

        let Environment {
            parameters,
            state_vector,
            diagnostics,
            ..
        } = env;
        state_vector.commit_block();

        let block = self.blocks;
        let block_duration = self.block_duration;
        let timed = self.timed;

        for i in 0..self.slots.len() {
            let (done, rest) = self.slots.split_at_mut(i);
            let slot = &mut rest[0];
            let current: &SignalBuffer = done.last().map(|s| &s.output).unwrap_or(input);

            let errors_before = diagnostics.error_count();
            let profile = slot.profiling && phase == Phase::Execute;
            let watch = (timed || profile).then(StopWatch::start);

            let ok = call_stage(&slot.name, phase, &mut *diagnostics, |diag| {
                let mut ctx = BlockContext {
                    stage: &slot.name,
                    phase,
                    params: &*parameters,
                    states: &mut *state_vector,
                    diagnostics: diag,
                    block,
                    block_duration,
                };
                if phase == Phase::Resting {
                    slot.stage.resting(current, &mut slot.output, &mut ctx)
                } else {
                    slot.stage.execute(current, &mut slot.output, &mut ctx)
                }
            })
            .is_some();

            if let Some(watch) = watch {
                let elapsed = watch.elapsed();
                if profile {
                    slot.perf.record(elapsed);
                }
                if timed && elapsed > block_duration && diagnostics.error_count() == errors_before {
                    diagnostics.report(Diagnostic::warning(&slot.name, phase, OVERRUN_MESSAGE));
                }
            }

            if !ok {
                self.state = ChainState::Faulted;
                return Err(ChainError::StageFailed {
                    stage: slot.name.clone(),
                    phase,
                });
            }

            if slot.vis_enabled {
                self.vis.push_signal(&slot.position, &slot.output);
            }
        }

        match self.slots.last() {
            Some(last) => output.assign_values(&last.output),
            None => output.assign_values(input),
        }
        if phase == Phase::Execute {
            self.blocks += 1;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("stages", &self.info().to_string())
            .finish()
    }
}

/// Run one stage call, turning errors and panics into diagnostics.
/// Returns `None` if the call failed.
fn call_stage<T, F>(
    stage: &str,
    phase: Phase,
    diagnostics: &mut dyn DiagnosticSink,
    f: F,
) -> Option<T>
where
    F: FnOnce(&mut dyn DiagnosticSink) -> StageResult<T>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut *diagnostics)));
    match outcome {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            if !e.is_reported() {
                diagnostics.report(Diagnostic::error(stage, phase, e.to_string()));
            }
            None
        }
        Err(payload) => {
            diagnostics.report(Diagnostic::error(
                stage,
                phase,
                format!("panicked: {}", panic_message(payload.as_ref())),
            ));
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::diagnostics::{DiagnosticLog, MockDiagnosticSink};
    use crate::pipeline::error::StageError;
    use crate::pipeline::registrar::Placement;
    use crate::pipeline::visualization::{MockVisualizationSink, NullVisualizationSink};
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::Arc;

    /// Output = input with one extra channel holding the block index.
    struct Widen;

    impl Stage for Widen {
        fn validate(&self, input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
            let mut out = input.clone();
            out.set_channels(input.channels() + 1);
            Ok(out)
        }

        fn execute(
            &mut self,
            input: &SignalBuffer,
            output: &mut SignalBuffer,
            ctx: &mut BlockContext<'_>,
        ) -> StageResult<()> {
            for ch in 0..input.channels() {
                output.channel_mut(ch).copy_from_slice(input.channel(ch));
            }
            let last = output.channels() - 1;
            output.channel_mut(last).fill(ctx.block() as f64);
            Ok(())
        }
    }

    struct Panicky;

    impl Stage for Panicky {
        fn validate(&self, input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
            Ok(input.clone())
        }

        fn execute(
            &mut self,
            _input: &SignalBuffer,
            _output: &mut SignalBuffer,
            _ctx: &mut BlockContext<'_>,
        ) -> StageResult<()> {
            panic!("sensor unplugged");
        }
    }

    fn registry_with(stages: &[(&str, &'static str)]) -> Registry {
        let mut registry = Registry::new();
        for (position, kind) in stages {
            let factory: Arc<dyn Fn(&Placement) -> Box<dyn Stage> + Send + Sync> = match *kind {
                "Panicky" => Arc::new(|_: &Placement| Box::new(Panicky) as Box<dyn Stage>),
                _ => Arc::new(|_: &Placement| Box::new(Widen) as Box<dyn Stage>),
            };
            registry.register(*position, 0, *kind, factory, true);
        }
        registry
    }

    fn env(samples: i64) -> Environment {
        let mut env = Environment::new();
        env.set_parameter("SampleBlockSize", samples);
        env.set_parameter("SamplingRate", 1000.0);
        env
    }

    #[test]
    fn test_phase_order_enforced() {
        let registry = registry_with(&[("1", "Widen")]);
        let mut chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink)).unwrap();
        let mut env = env(4);
        assert!(matches!(
            chain.allocate(&mut env),
            Err(ChainError::PhaseOrder { phase: Phase::Allocate, state: ChainState::Instantiated })
        ));
        chain.declare(&mut env).unwrap();
        assert!(matches!(
            chain.run_start(&mut env),
            Err(ChainError::PhaseOrder { .. })
        ));
    }

    #[test]
    fn test_shapes_and_name_synthesis() {
        let registry = registry_with(&[("1", "Widen"), ("2", "Widen")]);
        let mut chain =
            Chain::with_path("Sub", &registry, Box::new(NullVisualizationSink)).unwrap();
        let mut env = env(4);
        chain.declare(&mut env).unwrap();
        let out = chain
            .validate(&SignalShape::new(2, 4).with_name("Raw"), &mut env)
            .unwrap();
        assert_eq!(out.channels(), 4);
        assert_eq!(out.name, "Sub/Widen");
        assert_eq!(chain.stage_shapes()[0].channels(), 3);
    }

    #[test]
    fn test_execute_and_copy_out() {
        let registry = registry_with(&[("1", "Widen")]);
        let mut chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink)).unwrap();
        let mut env = env(2);
        chain.declare(&mut env).unwrap();
        chain.validate(&SignalShape::new(1, 2), &mut env).unwrap();
        chain.allocate(&mut env).unwrap();
        chain.run_start(&mut env).unwrap();

        let input = SignalBuffer::filled(SignalShape::new(1, 2), 3.0);
        let mut output = SignalBuffer::new(SignalShape::new(1, 1));
        chain.execute_block(&input, &mut output, &mut env).unwrap();
        chain.execute_block(&input, &mut output, &mut env).unwrap();
        assert_eq!(output.channels(), 2);
        assert_eq!(output.channel(0), &[3.0, 3.0]);
        assert_eq!(output.channel(1), &[1.0, 1.0]);
        assert_eq!(chain.blocks_processed(), 2);

        let wrong = SignalBuffer::new(SignalShape::new(5, 2));
        assert!(matches!(
            chain.execute_block(&wrong, &mut output, &mut env),
            Err(ChainError::InputMismatch { .. })
        ));
        assert_eq!(chain.state(), ChainState::Running);
    }

    #[test]
    fn test_panic_becomes_fatal_diagnostic() {
        let registry = registry_with(&[("1", "Panicky")]);
        let mut chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink)).unwrap();
        let mut env = env(2);
        chain.declare(&mut env).unwrap();
        chain.validate(&SignalShape::new(1, 2), &mut env).unwrap();
        chain.allocate(&mut env).unwrap();
        chain.run_start(&mut env).unwrap();

        let input = SignalBuffer::new(SignalShape::new(1, 2));
        let mut output = SignalBuffer::new(SignalShape::new(1, 2));
        let err = chain.execute_block(&input, &mut output, &mut env).unwrap_err();
        assert!(matches!(err, ChainError::StageFailed { phase: Phase::Execute, .. }));
        assert_eq!(chain.state(), ChainState::Faulted);
        let entry = env.diagnostics.errors().next().unwrap();
        assert_eq!(entry.stage, "Panicky");
        assert!(entry.message.contains("sensor unplugged"));

        chain.run_stop(&mut env).unwrap();
        assert_eq!(chain.state(), ChainState::Faulted);
        chain.release(&mut env).unwrap();
        assert_eq!(chain.state(), ChainState::Released);
    }

    #[test]
    fn test_zero_block_rejected_at_allocate() {
        let registry = registry_with(&[("1", "Widen")]);
        let mut chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink)).unwrap();
        let mut env = env(0);
        chain.declare(&mut env).unwrap();
        chain.validate(&SignalShape::new(1, 1), &mut env).unwrap();
        assert!(matches!(chain.allocate(&mut env), Err(ChainError::InvalidBlock(_))));
        assert_eq!(chain.state(), ChainState::Validated);
    }

    #[test]
    fn test_validated_samples_must_match_block_size() {
        let registry = registry_with(&[("1", "Widen")]);
        let mut chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink)).unwrap();
        let mut env = env(4);
        chain.declare(&mut env).unwrap();

        chain.validate(&SignalShape::new(1, 0), &mut env).unwrap();
        assert!(matches!(chain.allocate(&mut env), Err(ChainError::InvalidBlock(_))));
        assert_eq!(chain.state(), ChainState::Validated);

        chain.validate(&SignalShape::new(1, 2), &mut env).unwrap();
        assert!(matches!(chain.allocate(&mut env), Err(ChainError::InvalidBlock(_))));

        chain.validate(&SignalShape::new(1, 4), &mut env).unwrap();
        chain.allocate(&mut env).unwrap();
        assert_eq!(env.state_vector.samples(), 4);
    }

    #[test]
    fn test_unrepresentable_block_duration_rejected_at_allocate() {
        let registry = registry_with(&[("1", "Widen")]);
        let mut chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink)).unwrap();
        let mut env = env(4);
        env.set_parameter("SamplingRate", 1e-20);
        chain.declare(&mut env).unwrap();
        chain.validate(&SignalShape::new(1, 4), &mut env).unwrap();
        assert!(matches!(chain.allocate(&mut env), Err(ChainError::InvalidBlock(_))));
        assert_eq!(chain.state(), ChainState::Validated);
    }

    #[test]
    fn test_visualization_snapshot_order() {
        let registry = registry_with(&[("1.Filter", "Widen")]);
        let mut vis = MockVisualizationSink::new();
        let mut seq = Sequence::new();
        vis.expect_create()
            .with(eq("1.Filter"), eq(VisKind::Signal))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        vis.expect_push_shape()
            .withf(|id, shape| id == "1.Filter" && shape.channels() == 2)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        vis.expect_push_signal()
            .withf(|_, buf| buf.as_slice().iter().all(|v| v.is_nan()))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        vis.expect_set_visible()
            .with(eq("1.Filter"), eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        vis.expect_push_signal()
            .withf(|_, buf| buf.get(0, 0) == Some(7.0))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut chain = Chain::instantiate(&registry, Box::new(vis)).unwrap();
        let mut env = env(2);
        env.set_parameter("VisualizeWiden", 1i64);
        chain.declare(&mut env).unwrap();
        chain.validate(&SignalShape::new(1, 2), &mut env).unwrap();
        chain.allocate(&mut env).unwrap();
        assert!(chain.visualization_enabled("Widen"));
        chain.run_start(&mut env).unwrap();
        let input = SignalBuffer::filled(SignalShape::new(1, 2), 7.0);
        let mut output = SignalBuffer::new(SignalShape::new(2, 2));
        chain.execute_block(&input, &mut output, &mut env).unwrap();
    }

    #[test]
    fn test_disabled_tap_only_hidden() {
        let registry = registry_with(&[("1.Filter", "Widen")]);
        let mut vis = MockVisualizationSink::new();
        vis.expect_create().return_const(());
        vis.expect_push_shape().times(0);
        vis.expect_push_signal().times(0);
        vis.expect_set_visible()
            .with(eq("1.Filter"), eq(false))
            .times(1)
            .return_const(());

        let mut chain = Chain::instantiate(&registry, Box::new(vis)).unwrap();
        let mut env = env(2);
        chain.declare(&mut env).unwrap();
        chain.validate(&SignalShape::new(1, 2), &mut env).unwrap();
        chain.allocate(&mut env).unwrap();
        chain.run_start(&mut env).unwrap();
        let input = SignalBuffer::new(SignalShape::new(1, 2));
        let mut output = SignalBuffer::new(SignalShape::new(2, 2));
        chain.execute_block(&input, &mut output, &mut env).unwrap();
    }

    #[test]
    fn test_reported_marker_not_recorded_twice() {
        let mut sink = MockDiagnosticSink::new();
        sink.expect_report().times(1).return_const(());
        let result: Option<()> = call_stage("Stage", Phase::Validate, &mut sink, |diag| {
            diag.report(Diagnostic::error("Stage", Phase::Validate, "already said"));
            Err(StageError::Reported)
        });
        assert!(result.is_none());
    }

    #[test]
    fn test_call_stage_records_error() {
        let mut log = DiagnosticLog::new();
        let result: Option<()> = call_stage("Stage", Phase::Allocate, &mut log, |_| {
            Err(StageError::environment("device busy"))
        });
        assert!(result.is_none());
        assert_eq!(log.entries()[0].to_string(), "Stage::Allocate: device busy");
    }
}
