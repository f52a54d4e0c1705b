//! The stage lifecycle contract.
//!
//! Every stage (acquisition driver, DSP filter, stimulus controller) is driven
//! through the same phases, in this order, once per phase across the chain:
//!
//! 1. [`declare`](Stage::declare): register parameters, states and events.
//! 2. [`auto_config`](Stage::auto_config): derive `auto` parameter values.
//! 3. [`validate`](Stage::validate): compute the output shape, read-only.
//! 4. [`allocate`](Stage::allocate): acquire per-run resources.
//! 5. [`run_start`](Stage::run_start): once per recording run.
//! 6. [`execute`](Stage::execute) / [`resting`](Stage::resting): once per block.
//! 7. [`run_stop`](Stage::run_stop): end of the run.
//! 8. [`halt`](Stage::halt): stop asynchronous activity.
//! 9. [`release`](Stage::release): inverse of allocate.
//!
//! Stages report problems either by returning a [`StageError`] or by writing
//! to the diagnostic stream through their context; both end up tagged with
//! the stage name and phase.

use crate::pipeline::diagnostics::{Diagnostic, DiagnosticSink};
use crate::pipeline::error::{StageError, StageResult};
use crate::pipeline::params::{ParamDecl, ParamValue, ParameterResolver, ParameterSet};
use crate::pipeline::phase::Phase;
use crate::pipeline::signal::{SignalBuffer, SignalShape};
use crate::pipeline::states::{StateAccess, StateField, StateList, StateVector};
use std::time::Duration;

/// A processing stage.
pub trait Stage: Send {
    /// Declare the stage's configuration surface.
    fn declare(&mut self, _surface: &mut Surface<'_>) -> StageResult<()> {
        Ok(())
    }

    /// Fill in parameters the operator left as `auto`, e.g. by probing hardware.
    fn auto_config(&mut self, _input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        Ok(())
    }

    /// Compute the output shape for `input`. Must not change observable state.
    fn validate(&self, input: &SignalShape, ctx: &mut StageContext<'_>) -> StageResult<SignalShape>;

    /// Acquire per-run resources for the finalized shapes.
    fn allocate(
        &mut self,
        _input: &SignalShape,
        _output: &SignalShape,
        _ctx: &mut StageContext<'_>,
    ) -> StageResult<()> {
        Ok(())
    }

    fn run_start(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        Ok(())
    }

    /// Process one block. `output` is pre-shaped to the validated output shape.
    fn execute(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        ctx: &mut BlockContext<'_>,
    ) -> StageResult<()>;

    /// Called instead of `execute` while the pipeline idles between runs.
    fn resting(
        &mut self,
        _input: &SignalBuffer,
        _output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        Ok(())
    }

    fn run_stop(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        Ok(())
    }

    fn halt(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        Ok(())
    }

    fn release(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        Ok(())
    }

    /// Whether the chain should offer a visualization tap for this stage.
    fn allows_visualization(&self) -> bool {
        true
    }
}

/// Collects a stage's declarations during the Declare phase.
pub struct Surface<'a> {
    pub(crate) params: &'a mut ParameterSet,
    pub(crate) states: &'a mut StateList,
}

impl<'a> Surface<'a> {
    pub fn new(params: &'a mut ParameterSet, states: &'a mut StateList) -> Self {
        Self { params, states }
    }

    pub fn parameter(&mut self, decl: ParamDecl) {
        self.params.declare(decl);
    }

    /// Declare a state field this stage writes.
    pub fn state(&mut self, name: &str, bits: u8, default: u32) -> StageResult<()> {
        self.states.declare(StateField::state(name, bits, default))?;
        Ok(())
    }

    /// Declare an asynchronous event field this stage reads.
    pub fn event(&mut self, name: &str, bits: u8, default: u32) -> StageResult<()> {
        self.states.declare(StateField::event(name, bits, default))?;
        Ok(())
    }
}

/// Context for the configuration and resource phases.
pub struct StageContext<'a> {
    pub(crate) stage: &'a str,
    pub(crate) phase: Phase,
    pub(crate) params: &'a mut ParameterSet,
    pub(crate) states: &'a StateList,
    pub(crate) diagnostics: &'a mut dyn DiagnosticSink,
}

impl<'a> StageContext<'a> {
    pub fn new(
        stage: &'a str,
        phase: Phase,
        params: &'a mut ParameterSet,
        states: &'a StateList,
        diagnostics: &'a mut dyn DiagnosticSink,
    ) -> Self {
        Self {
            stage,
            phase,
            params,
            states,
            diagnostics,
        }
    }

    pub fn stage_name(&self) -> &str {
        self.stage
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn params(&self) -> &ParameterSet {
        self.params
    }

    /// The value of a declared parameter.
    pub fn param(&self, name: &str) -> StageResult<&ParamValue> {
        self.params.get(name).map_err(|_| StageError::Missing {
            kind: "parameter",
            name: name.to_string(),
        })
    }

    pub fn param_float(&self, name: &str) -> StageResult<f64> {
        Ok(self.params.get_float(name)?)
    }

    pub fn param_int(&self, name: &str) -> StageResult<i64> {
        Ok(self.params.get_int(name)?)
    }

    /// A numeric parameter checked against its declared range.
    pub fn param_in_range(&self, name: &str) -> StageResult<f64> {
        Ok(self.params.check_range(name)?)
    }

    pub fn optional_param(&self, name: &str, default: ParamValue) -> ParamValue {
        self.params.optional(name, default)
    }

    pub fn is_auto(&self, name: &str) -> bool {
        self.params.is_auto(name)
    }

    /// Supply the derived value of an `auto` parameter. Only valid during
    /// auto-configuration.
    pub fn derive(&mut self, name: &str, value: impl Into<ParamValue>) -> StageResult<()> {
        if self.phase != Phase::AutoConfig {
            return Err(crate::pipeline::error::ParamError::WrongPhase(name.to_string()).into());
        }
        self.params.resolve_auto(name, value)?;
        Ok(())
    }

    pub fn state_exists(&self, name: &str) -> bool {
        self.states.exists(name)
    }

    /// Fail unless `name` was declared as a state or event field.
    pub fn require_state(&self, name: &str) -> StageResult<()> {
        if self.states.exists(name) {
            Ok(())
        } else {
            Err(StageError::Missing {
                kind: "state",
                name: name.to_string(),
            })
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.diagnostics
            .report(Diagnostic::error(self.stage, self.phase, message));
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.diagnostics
            .report(Diagnostic::warning(self.stage, self.phase, message));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.diagnostics
            .report(Diagnostic::info(self.stage, self.phase, message));
    }
}

impl ParameterResolver for StageContext<'_> {
    fn get_parameter(&self, name: &str) -> Option<&ParamValue> {
        self.params.get_parameter(name)
    }
}

/// Context for the per-block phases.
pub struct BlockContext<'a> {
    pub(crate) stage: &'a str,
    pub(crate) phase: Phase,
    pub(crate) params: &'a ParameterSet,
    pub(crate) states: &'a mut StateVector,
    pub(crate) diagnostics: &'a mut dyn DiagnosticSink,
    pub(crate) block: u64,
    pub(crate) block_duration: Duration,
}

impl<'a> BlockContext<'a> {
    pub fn stage_name(&self) -> &str {
        self.stage
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Index of the current block within the run.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Nominal wall-clock duration of one block.
    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    pub fn params(&self) -> &ParameterSet {
        self.params
    }

    pub fn state(&self, name: &str, sample: usize) -> StageResult<u32> {
        Ok(self.states.get_state(name, sample)?)
    }

    pub fn set_state(&mut self, name: &str, sample: usize, value: u32) -> StageResult<()> {
        Ok(self.states.set_state(name, sample, value)?)
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.diagnostics
            .report(Diagnostic::error(self.stage, self.phase, message));
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.diagnostics
            .report(Diagnostic::warning(self.stage, self.phase, message));
    }
}

impl ParameterResolver for BlockContext<'_> {
    fn get_parameter(&self, name: &str) -> Option<&ParamValue> {
        self.params.get_parameter(name)
    }
}

impl StateAccess for BlockContext<'_> {
    fn get_state(&self, name: &str, sample: usize) -> Result<u32, crate::pipeline::error::StateError> {
        self.states.get_state(name, sample)
    }

    fn set_state(
        &mut self,
        name: &str,
        sample: usize,
        value: u32,
    ) -> Result<(), crate::pipeline::error::StateError> {
        self.states.set_state(name, sample, value)
    }
}
