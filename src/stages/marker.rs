//! Marks samples where one channel exceeds a threshold.

use crate::pipeline::{
    BlockContext, ParamDecl, SignalBuffer, SignalShape, Stage, StageContext, StageError,
    StageResult, Surface,
};

/// State written once per sample: 1 while the marked channel is above threshold.
pub const THRESHOLD_STATE: &str = "ThresholdCrossed";

const SECTION: &str = "Application:Threshold Marker";

/// Passes the signal through unchanged and writes [`THRESHOLD_STATE`].
#[derive(Debug, Default)]
pub struct ThresholdMarker {
    threshold: f64,
    channel: usize,
    crossings: u64,
}

impl ThresholdMarker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for ThresholdMarker {
    fn declare(&mut self, surface: &mut Surface<'_>) -> StageResult<()> {
        surface.parameter(ParamDecl::new(SECTION, "MarkerThreshold", 50.0));
        surface.parameter(
            ParamDecl::new(SECTION, "MarkerChannel", 1i64)
                .range(1.0, 1024.0)
                .comment("1-based channel compared against MarkerThreshold"),
        );
        surface.state(THRESHOLD_STATE, 1, 0)
    }

    fn validate(&self, input: &SignalShape, ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
        ctx.require_state(THRESHOLD_STATE)?;
        ctx.param_float("MarkerThreshold")?;
        let channel = ctx.param_in_range("MarkerChannel")? as usize;
        if channel > input.channels() {
            return Err(StageError::config(format!(
                "MarkerChannel {} exceeds the {} input channel(s)",
                channel,
                input.channels()
            )));
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
        self.threshold = ctx.param_float("MarkerThreshold")?;
        self.channel = usize::try_from(ctx.param_int("MarkerChannel")? - 1)
            .map_err(|_| StageError::config("MarkerChannel must be positive"))?;
        Ok(())
    }

    fn run_start(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        self.crossings = 0;
        Ok(())
    }

    fn execute(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        output.assign_values(input);
        if input.samples() == 0 {
            return Ok(());
        }
        // sample 0 still holds the value carried over from the previous block
        let mut previous = ctx.state(THRESHOLD_STATE, 0)?;
        for (sample, &value) in input.channel(self.channel).iter().enumerate() {
            let above = u32::from(value > self.threshold);
            if above > previous {
                self.crossings += 1;
            }
            ctx.set_state(THRESHOLD_STATE, sample, above)?;
            previous = above;
        }
        Ok(())
    }

    fn run_stop(&mut self, ctx: &mut StageContext<'_>) -> StageResult<()> {
        ctx.info(format!("{} threshold crossing(s) this run", self.crossings));
        Ok(())
    }
}
