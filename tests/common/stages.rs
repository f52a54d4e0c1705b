//! Stages that record how the chain drives them

use filter_chain::pipeline::{
    BlockContext, SignalBuffer, SignalShape, Stage, StageContext, StageError, StageResult,
    Surface,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared, ordered record of lifecycle calls: `"<tag>:<phase>"`.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Per-phase call counters.
#[derive(Debug, Default)]
pub struct Counters {
    pub allocate: AtomicUsize,
    pub run_start: AtomicUsize,
    pub execute: AtomicUsize,
    pub run_stop: AtomicUsize,
    pub release: AtomicUsize,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Pass-through stage that logs every lifecycle call.
pub struct Recorder {
    tag: String,
    log: CallLog,
    counters: Arc<Counters>,
}

impl Recorder {
    pub fn new(tag: &str, log: CallLog, counters: Arc<Counters>) -> Self {
        Self {
            tag: tag.to_string(),
            log,
            counters,
        }
    }

    fn record(&self, phase: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", self.tag, phase));
    }
}

impl Stage for Recorder {
    fn declare(&mut self, _surface: &mut Surface<'_>) -> StageResult<()> {
        self.record("declare");
        Ok(())
    }

    fn validate(&self, input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
        self.record("validate");
        Ok(input.clone())
    }

    fn allocate(
        &mut self,
        _input: &SignalShape,
        _output: &SignalShape,
        _ctx: &mut StageContext<'_>,
    ) -> StageResult<()> {
        self.record("allocate");
        self.counters.allocate.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn run_start(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        self.record("run_start");
        self.counters.run_start.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        self.record("execute");
        self.counters.execute.fetch_add(1, Ordering::SeqCst);
        output.assign_values(input);
        Ok(())
    }

    fn run_stop(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        self.record("run_stop");
        self.counters.run_stop.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        self.record("release");
        self.counters.release.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Adds `extra` channels; copied channels keep their values and every added
/// channel holds `value`.
pub struct ChannelAdder {
    pub extra: usize,
    pub value: f64,
}

impl Stage for ChannelAdder {
    fn validate(&self, input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
        let mut output = input.clone();
        output.set_channels(input.channels() + self.extra);
        output.name.clear();
        Ok(output)
    }

    fn execute(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        for ch in 0..input.channels() {
            output.channel_mut(ch).copy_from_slice(input.channel(ch));
        }
        for ch in input.channels()..output.channels() {
            output.channel_mut(ch).fill(self.value);
        }
        Ok(())
    }
}

/// Always rejects its configuration and counts allocations it should never see.
pub struct FailingValidate {
    pub message: String,
    pub allocations: Arc<AtomicUsize>,
}

impl Stage for FailingValidate {
    fn validate(&self, _input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
        Err(StageError::config(self.message.clone()))
    }

    fn allocate(
        &mut self,
        _input: &SignalShape,
        _output: &SignalShape,
        _ctx: &mut StageContext<'_>,
    ) -> StageResult<()> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(
        &mut self,
        _input: &SignalBuffer,
        _output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        Ok(())
    }
}

/// Pass-through stage whose RunStart always fails.
pub struct FailingRunStart {
    pub log: CallLog,
}

impl Stage for FailingRunStart {
    fn validate(&self, input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
        Ok(input.clone())
    }

    fn run_start(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        self.log.lock().unwrap().push("failing:run_start".to_string());
        Err(StageError::environment("amplifier not responding"))
    }

    fn execute(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        output.assign_values(input);
        Ok(())
    }

    fn run_stop(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<()> {
        self.log.lock().unwrap().push("failing:run_stop".to_string());
        Ok(())
    }
}

/// Sleeps `delay` in every Execute call.
pub struct SleepyStage {
    pub delay: Duration,
}

impl Stage for SleepyStage {
    fn validate(&self, input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
        Ok(input.clone())
    }

    fn execute(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        _ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        std::thread::sleep(self.delay);
        output.assign_values(input);
        Ok(())
    }
}

/// Fails Execute on block `fail_at`.
pub struct FailOnBlock {
    pub fail_at: u64,
}

impl Stage for FailOnBlock {
    fn validate(&self, input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
        Ok(input.clone())
    }

    fn execute(
        &mut self,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
        ctx: &mut BlockContext<'_>,
    ) -> StageResult<()> {
        if ctx.block() == self.fail_at {
            return Err(StageError::environment("device disconnected"));
        }
        output.assign_values(input);
        Ok(())
    }
}
