//! The shared environment every lifecycle call reads and writes.
//!
//! Stages never see the environment directly; the chain hands out
//! [`StageContext`](crate::pipeline::stage::StageContext) and
//! [`BlockContext`](crate::pipeline::stage::BlockContext) views of it.

use crate::config::EngineConfig;
use crate::pipeline::diagnostics::{DiagnosticLog, DiagnosticSink};
use crate::pipeline::error::{ChainError, ChainResult};
use crate::pipeline::params::{ParamDecl, ParamValue, ParameterSet};
use crate::pipeline::states::{StateList, StateVector};
use std::time::Duration;

/// Sampling rate of the external input, in Hz.
pub const SAMPLING_RATE: &str = "SamplingRate";
/// Samples per block.
pub const SAMPLE_BLOCK_SIZE: &str = "SampleBlockSize";
/// Nonzero enables timing supervision of per-block calls.
pub const EVALUATE_TIMING: &str = "EvaluateTiming";

/// Section of the per-stage `Visualize<Stage>` switches.
pub const VISUALIZE_SECTION: &str = "Visualize:Processing Stages";

const SIGNAL_SECTION: &str = "Source:Signal Properties";
const SYSTEM_SECTION: &str = "System:Core";

/// Parameters, state layout, state values and the diagnostic stream.
#[derive(Debug, Clone)]
pub struct Environment<D: DiagnosticSink = DiagnosticLog> {
    pub parameters: ParameterSet,
    pub states: StateList,
    /// Laid out at Allocate from `states`.
    pub state_vector: StateVector,
    pub diagnostics: D,
}

impl Environment<DiagnosticLog> {
    pub fn new() -> Self {
        Self::with_diagnostics(DiagnosticLog::new())
    }

    /// Seed block geometry, timing and operator values from `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut env = Self::new();
        let params = &mut env.parameters;
        params.set(SAMPLING_RATE, config.block.sampling_rate);
        params.set(
            SAMPLE_BLOCK_SIZE,
            i64::try_from(config.block.sample_block_size).unwrap_or(i64::MAX),
        );
        params.set(EVALUATE_TIMING, i64::from(config.timing.evaluate_timing));
        for (name, value) in &config.parameters {
            params.set(name.clone(), value.clone());
        }
        env
    }
}

impl Default for Environment<DiagnosticLog> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DiagnosticSink> Environment<D> {
    /// An environment with the engine parameters declared at their defaults.
    pub fn with_diagnostics(diagnostics: D) -> Self {
        let mut parameters = ParameterSet::new();
        declare_engine_parameters(&mut parameters);
        Self {
            parameters,
            states: StateList::new(),
            state_vector: StateVector::default(),
            diagnostics,
        }
    }

    /// Set an operator parameter value.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.parameters.set(name, value);
    }

    /// Samples per block and the nominal duration of one block.
    pub fn block_geometry(&self) -> ChainResult<(usize, Duration)> {
        let samples = self
            .parameters
            .get_int(SAMPLE_BLOCK_SIZE)
            .map_err(|e| ChainError::InvalidBlock(e.to_string()))?;
        let rate = self
            .parameters
            .get_float(SAMPLING_RATE)
            .map_err(|e| ChainError::InvalidBlock(e.to_string()))?;
        if samples <= 0 {
            return Err(ChainError::InvalidBlock(format!(
                "{} must be positive, got {}",
                SAMPLE_BLOCK_SIZE, samples
            )));
        }
        if !(rate > 0.0) || !rate.is_finite() {
            return Err(ChainError::InvalidBlock(format!(
                "{} must be positive, got {}",
                SAMPLING_RATE, rate
            )));
        }
        let samples = usize::try_from(samples)
            .map_err(|e| ChainError::InvalidBlock(e.to_string()))?;
        let duration = Duration::try_from_secs_f64(samples as f64 / rate).map_err(|e| {
            ChainError::InvalidBlock(format!(
                "block of {} samples at {} Hz: {}",
                samples, rate, e
            ))
        })?;
        Ok((samples, duration))
    }

    /// Whether per-block calls are timed. Always on in debug builds.
    pub fn timing_enabled(&self) -> bool {
        if cfg!(debug_assertions) {
            return true;
        }
        self.parameters
            .optional(EVALUATE_TIMING, ParamValue::Int(1))
            .as_bool()
            .unwrap_or(true)
    }
}

fn declare_engine_parameters(params: &mut ParameterSet) {
    params.declare(
        ParamDecl::new(SIGNAL_SECTION, SAMPLING_RATE, crate::config::DEFAULT_SAMPLING_RATE)
            .comment("sampling rate in Hz"),
    );
    params.declare(
        ParamDecl::new(
            SIGNAL_SECTION,
            SAMPLE_BLOCK_SIZE,
            crate::config::DEFAULT_SAMPLE_BLOCK_SIZE as i64,
        )
        .comment("samples per block"),
    );
    params.declare(
        ParamDecl::new(SYSTEM_SECTION, EVALUATE_TIMING, 1i64)
            .range(0.0, 1.0)
            .comment("warn when a stage exceeds one block duration (boolean)"),
    );
}
