//! Sine-wave acquisition stand-in.

use crate::pipeline::{
    BlockContext, ParamDecl, SignalBuffer, SignalShape, Stage, StageContext, StageError,
    StageResult, Surface, SAMPLE_BLOCK_SIZE, SAMPLING_RATE,
};
use std::f64::consts::TAU;

/// Channels reported by the simulated device when `SourceCh` is `auto`.
pub const DEVICE_CHANNELS: i64 = 4;

const SECTION: &str = "Source:Signal Generator";

/// Produces one sine per channel, each channel phase-shifted by a quarter
/// period from the previous one.
#[derive(Debug, Default)]
pub struct SignalGenerator {
    amplitude: f64,
    /// Phase advance per sample, in radians.
    step: f64,
    phase: f64,
}

impl SignalGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for SignalGenerator {
    fn declare(&mut self, surface: &mut Surface<'_>) -> StageResult<()> {
        surface.parameter(
            ParamDecl::new(SECTION, "SourceCh", "auto")
                .auto()
                .range(1.0, 1024.0)
                .comment("number of acquired channels"),
        );
        surface.parameter(
            ParamDecl::new(SECTION, "SineAmplitude", 100.0)
                .range(0.0, 1e6)
                .comment("amplitude in muV"),
        );
        surface.parameter(
            ParamDecl::new(SECTION, "SineFrequency", 10.0)
                .range(0.0, 1e5)
                .comment("frequency in Hz"),
        );
        Ok(())
    }

    fn auto_config(&mut self, _input: &SignalShape, ctx: &mut StageContext<'_>) -> StageResult<()> {
        if ctx.is_auto("SourceCh") {
            ctx.derive("SourceCh", DEVICE_CHANNELS)?;
            ctx.info(format!("SourceCh set to {} from device", DEVICE_CHANNELS));
        }
        Ok(())
    }

    fn validate(&self, _input: &SignalShape, ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
        let channels = ctx.param_in_range("SourceCh")? as usize;
        ctx.param_in_range("SineAmplitude")?;
        let frequency = ctx.param_in_range("SineFrequency")?;
        let rate = ctx.param_float(SAMPLING_RATE)?;
        let samples = ctx.param_int(SAMPLE_BLOCK_SIZE)?;

        if frequency >= rate / 2.0 {
            return Err(StageError::config(format!(
                "SineFrequency {} Hz must stay below half the sampling rate ({} Hz)",
                frequency, rate
            )));
        }

        let mut shape = SignalShape::new(channels, usize::try_from(samples).unwrap_or(0))
            .with_sampling_rate(rate)
            .with_labels((1..=channels).map(|i| format!("Ch{}", i)));
        for ch in 0..channels {
            if let Some(unit) = shape.channel_unit_mut(ch) {
                unit.symbol = "muV".to_string();
            }
        }
        Ok(shape)
    }

    fn allocate(
        &mut self,
        _input: &SignalShape,
        _output: &SignalShape,
        ctx: &mut StageContext<'_>,
    ) -> StageResult<()> {
        self.amplitude = ctx.param_float("SineAmplitude")?;
        let frequency = ctx.param_float("SineFrequency")?;
        let rate = ctx.param_float(SAMPLING_RATE)?;
        self.step = TAU * frequency / rate;
        self.phase = 0.0;
        Ok(())
    }

    fn run_start(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        self.phase = 0.0;
        Ok(())
    }

    fn execute(
        &mut self,
        _input: &SignalBuffer,
        output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        let samples = output.samples();
        for ch in 0..output.channels() {
            let offset = ch as f64 * TAU / 4.0;
            for (s, value) in output.channel_mut(ch).iter_mut().enumerate() {
                *value = self.amplitude * (self.phase + s as f64 * self.step + offset).sin();
            }
        }
        self.phase = (self.phase + samples as f64 * self.step) % TAU;
        Ok(())
    }

    fn resting(
        &mut self,
        _input: &SignalBuffer,
        output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        output.fill(0.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Chain, Environment, NullVisualizationSink, Registry};

    fn chain(env: &mut Environment) -> Chain {
        let mut registry = Registry::new();
        registry.register_stage("1.Source", 0, |_| SignalGenerator::new());
        let mut chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink)).unwrap();
        chain.declare(env).unwrap();
        chain
    }

    #[test]
    fn test_auto_channel_count() {
        let mut env = Environment::new();
        let mut chain = chain(&mut env);
        let out = chain.validate(&SignalShape::new(0, 32), &mut env).unwrap();
        assert_eq!(out.channels(), DEVICE_CHANNELS as usize);
        assert_eq!(out.samples(), 32);
        assert_eq!(out.channel_label(0), Some("Ch1"));
        assert_eq!(out.name, "SignalGenerator");
    }

    #[test]
    fn test_explicit_channel_count_and_nyquist() {
        let mut env = Environment::new();
        env.set_parameter("SourceCh", 2i64);
        env.set_parameter("SineFrequency", 200.0);
        let mut chain = chain(&mut env);
        assert!(chain.validate(&SignalShape::new(0, 32), &mut env).is_err());

        env.diagnostics.drain();
        env.set_parameter("SineFrequency", 20.0);
        let out = chain.validate(&SignalShape::new(0, 32), &mut env).unwrap();
        assert_eq!(out.channels(), 2);
    }

    #[test]
    fn test_generates_bounded_sine() {
        let mut env = Environment::new();
        env.set_parameter("SineAmplitude", 5.0);
        let mut chain = chain(&mut env);
        let shape = SignalShape::new(0, 32);
        chain.validate(&shape, &mut env).unwrap();
        chain.allocate(&mut env).unwrap();
        chain.run_start(&mut env).unwrap();
        let input = SignalBuffer::new(shape);
        let mut output = SignalBuffer::new(SignalShape::default());
        chain.execute_block(&input, &mut output, &mut env).unwrap();
        assert!(output.as_slice().iter().all(|v| v.abs() <= 5.0 + 1e-9));
        assert!(output.as_slice().iter().any(|v| v.abs() > 0.1));
        chain.run_stop(&mut env).unwrap();
        chain.release(&mut env).unwrap();
    }
}
