use crate::pipeline::{
    BlockContext, ParamDecl, SignalBuffer, SignalShape, Stage, StageContext, StageError,
    StageResult, Surface,
};

const SECTION: &str = "Filtering:Linear Transform";

/// `out = in * Gain + Offset`, applied to every channel.
#[derive(Debug)]
pub struct LinearTransform {
    gain: f64,
    offset: f64,
}

impl LinearTransform {
    pub fn new() -> Self {
        Self {
            gain: 1.0,
            offset: 0.0,
        }
    }
}

impl Default for LinearTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for LinearTransform {
    fn declare(&mut self, surface: &mut Surface<'_>) -> StageResult<()> {
        surface.parameter(ParamDecl::new(SECTION, "Gain", 1.0).comment("multiplier applied to every sample"));
        surface.parameter(ParamDecl::new(SECTION, "Offset", 0.0).comment("added after the gain"));
        Ok(())
    }

    fn validate(&self, input: &SignalShape, ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
        for name in ["Gain", "Offset"] {
            let value = ctx.param_float(name)?;
            if !value.is_finite() {
                return Err(StageError::config(format!("{} must be finite, got {}", name, value)));
            }
        }
        let mut output = input.clone();
        output.name.clear();
        Ok(output)
    }

    fn allocate(
        &mut self,
        _input: &SignalShape,
        _output: &SignalShape,
        ctx: &mut StageContext<'_>,
    ) -> StageResult<()> {
        self.gain = ctx.param_float("Gain")?;
        self.offset = ctx.param_float("Offset")?;
        Ok(())
    }

    fn execute(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        for (out, &value) in output.as_mut_slice().iter_mut().zip(input.as_slice()) {
            *out = value * self.gain + self.offset;
        }
        Ok(())
    }

    fn resting(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        output.assign_values(input);
        Ok(())
    }
}
