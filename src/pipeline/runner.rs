//! Block runner: drives an allocated chain on a dedicated thread.
//!
//! The runner owns the chain and its environment while it runs. It is
//! controlled through [`RunnerCommand`]s and reports through
//! [`RunnerMessage`]s, both carried over crossbeam channels held by a
//! [`RunnerBridge`]. Each loop iteration:
//!
//! 1. Drain commands.
//! 2. Process one block (Execute while running, Resting while resting).
//! 3. Forward diagnostics recorded during the iteration.
//! 4. Pace to the nominal block duration when real-time pacing is on.
//!
//! Per-block progress and diagnostics are dropped under backpressure.
//! `RunStopped`, `Faulted` and `Shutdown` are control messages and always
//! arrive, so the receiver must keep draining until it sees `Shutdown`.

use crate::config::RunnerConfig;
use crate::pipeline::chain::Chain;
use crate::pipeline::diagnostics::Diagnostic;
use crate::pipeline::environment::Environment;
use crate::pipeline::error::ChainResult;
use crate::pipeline::signal::{SignalBuffer, SignalShape};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Sleep between loop iterations while idle.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Commands sent to the runner thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerCommand {
    /// Start a run and process blocks until stopped.
    Start,
    /// Stop the current run after the in-flight block.
    Stop,
    /// While idle, process Resting blocks.
    Rest,
    /// Stop any run and exit the thread.
    Shutdown,
}

/// Messages sent from the runner thread.
#[derive(Debug, Clone)]
pub enum RunnerMessage {
    /// A block went through the whole chain.
    BlockProcessed { block: u64, resting: bool },
    /// A diagnostic recorded by the chain or a stage.
    Diagnostic(Diagnostic),
    /// A run ended after `blocks` blocks.
    RunStopped { blocks: u64 },
    /// The chain failed; it needs a release before it can run again.
    Faulted(String),
    /// The runner thread is exiting.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Running,
    Resting,
}

/// Caller-side handle for a runner thread.
pub struct RunnerBridge {
    pub cmd_tx: Sender<RunnerCommand>,
    pub msg_rx: Receiver<RunnerMessage>,
}

impl RunnerBridge {
    /// Create a bridge pair: `(bridge, cmd_rx, msg_tx)`.
    ///
    /// The runner thread owns `cmd_rx` and `msg_tx`.
    pub fn new(capacity: usize) -> (Self, Receiver<RunnerCommand>, Sender<RunnerMessage>) {
        let (cmd_tx, cmd_rx) = bounded(capacity.max(1));
        let (msg_tx, msg_rx) = bounded(capacity.max(1));
        (Self { cmd_tx, msg_rx }, cmd_rx, msg_tx)
    }

    /// Drain all pending messages.
    pub fn drain(&self) -> Vec<RunnerMessage> {
        self.msg_rx.try_iter().collect()
    }

    pub fn try_recv(&self) -> Option<RunnerMessage> {
        self.msg_rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<RunnerMessage> {
        self.msg_rx.recv_timeout(timeout).ok()
    }

    pub fn send_command(&self, cmd: RunnerCommand) -> bool {
        self.cmd_tx.send(cmd).is_ok()
    }

    pub fn start(&self) {
        let _ = self.cmd_tx.send(RunnerCommand::Start);
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(RunnerCommand::Stop);
    }

    pub fn rest(&self) {
        let _ = self.cmd_tx.send(RunnerCommand::Rest);
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(RunnerCommand::Shutdown);
    }
}

/// Drives an allocated [`Chain`] block by block.
pub struct BlockRunner {
    chain: Chain,
    env: Environment,
    input: SignalBuffer,
    output: SignalBuffer,
    mode: Mode,
    realtime: bool,
    max_blocks: u64,
    cmd_rx: Receiver<RunnerCommand>,
    msg_tx: Sender<RunnerMessage>,
    last_block: Option<Instant>,
    dropped: u64,
}

impl BlockRunner {
    pub fn new(
        chain: Chain,
        env: Environment,
        config: &RunnerConfig,
        cmd_rx: Receiver<RunnerCommand>,
        msg_tx: Sender<RunnerMessage>,
    ) -> Self {
        let input_shape = chain.input_shape().cloned().unwrap_or_default();
        let output_shape = chain.output_shape().cloned().unwrap_or_default();
        Self {
            chain,
            env,
            input: SignalBuffer::new(input_shape),
            output: SignalBuffer::new(output_shape),
            mode: Mode::Idle,
            realtime: config.realtime,
            max_blocks: config.max_blocks,
            cmd_rx,
            msg_tx,
            last_block: None,
            dropped: 0,
        }
    }

    /// Spawn a runner thread for an allocated chain.
    ///
    /// The thread hands the chain and environment back when it exits, so the
    /// caller can release the chain.
    pub fn spawn(
        chain: Chain,
        env: Environment,
        config: &RunnerConfig,
    ) -> std::io::Result<(RunnerBridge, JoinHandle<(Chain, Environment)>)> {
        let (bridge, cmd_rx, msg_tx) = RunnerBridge::new(config.channel_capacity);
        let runner = Self::new(chain, env, config, cmd_rx, msg_tx);
        let handle = std::thread::Builder::new()
            .name("block-runner".into())
            .spawn(move || runner.run())?;
        Ok((bridge, handle))
    }

    /// Replace the constant external input fed into the first stage.
    pub fn set_input(&mut self, input: SignalBuffer) {
        self.input = input;
    }

    /// Run until shutdown.
    pub fn run(mut self) -> (Chain, Environment) {
        tracing::info!("Block runner started");

        while self.process_commands() {
            match self.mode {
                Mode::Running => self.tick(false),
                Mode::Resting => self.tick(true),
                Mode::Idle => {}
            }
            self.forward_diagnostics();
            self.rate_limit();
        }

        if self.mode == Mode::Running {
            self.stop_run();
        }
        self.forward_diagnostics();

        if self.dropped > 0 {
            tracing::warn!("Block runner dropped {} messages due to backpressure", self.dropped);
        }
        self.notify(RunnerMessage::Shutdown);
        tracing::info!("Block runner exiting");
        (self.chain, self.env)
    }

    /// Handle pending commands. Returns `false` on shutdown.
    fn process_commands(&mut self) -> bool {
        loop {
            let cmd = if self.mode == Mode::Idle {
                match self.cmd_rx.recv_timeout(IDLE_WAIT) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => return true,
                    Err(RecvTimeoutError::Disconnected) => return false,
                }
            } else {
                match self.cmd_rx.try_recv() {
                    Ok(cmd) => cmd,
                    Err(crossbeam_channel::TryRecvError::Empty) => return true,
                    Err(crossbeam_channel::TryRecvError::Disconnected) => return false,
                }
            };

            match cmd {
                RunnerCommand::Start => {
                    if self.mode != Mode::Running {
                        self.start_run();
                    }
                }
                RunnerCommand::Stop => match self.mode {
                    Mode::Running => self.stop_run(),
                    Mode::Resting => self.mode = Mode::Idle,
                    Mode::Idle => {}
                },
                RunnerCommand::Rest => {
                    if self.mode == Mode::Idle {
                        self.mode = Mode::Resting;
                    }
                }
                RunnerCommand::Shutdown => return false,
            }
        }
    }

    fn start_run(&mut self) {
        match self.chain.run_start(&mut self.env) {
            Ok(()) => {
                tracing::debug!("Run started");
                self.mode = Mode::Running;
                self.last_block = None;
            }
            Err(e) => self.fault(e.to_string()),
        }
    }

    fn stop_run(&mut self) {
        let blocks = self.chain.blocks_processed();
        if let Err(e) = self.chain.run_stop(&mut self.env) {
            tracing::warn!("Run stop reported errors: {}", e);
        }
        self.mode = Mode::Idle;
        self.notify(RunnerMessage::RunStopped { blocks });
        tracing::debug!("Run stopped after {} blocks", blocks);
    }

    fn tick(&mut self, resting: bool) {
        let block = self.chain.blocks_processed();
        self.last_block = Some(Instant::now());
        let result: ChainResult<()> = if resting {
            self.chain
                .rest_block(&self.input, &mut self.output, &mut self.env)
        } else {
            self.chain
                .execute_block(&self.input, &mut self.output, &mut self.env)
        };

        match result {
            Ok(()) => {
                self.send(RunnerMessage::BlockProcessed { block, resting });
                if !resting && self.max_blocks > 0 && self.chain.blocks_processed() >= self.max_blocks {
                    self.stop_run();
                }
            }
            Err(e) => {
                let was_running = self.mode == Mode::Running;
                self.fault(e.to_string());
                if was_running {
                    self.stop_run();
                }
            }
        }
    }

    fn fault(&mut self, message: String) {
        tracing::error!("Block runner fault: {}", message);
        self.mode = Mode::Idle;
        self.notify(RunnerMessage::Faulted(message));
    }

    fn forward_diagnostics(&mut self) {
        for diagnostic in self.env.diagnostics.drain() {
            self.send(RunnerMessage::Diagnostic(diagnostic));
        }
    }

    fn send(&mut self, message: RunnerMessage) {
        if self.msg_tx.try_send(message).is_err() {
            self.dropped += 1;
        }
    }

    /// Blocking send for control messages. Only fails once the bridge is gone.
    fn notify(&self, message: RunnerMessage) {
        if self.msg_tx.send(message).is_err() {
            tracing::debug!("Runner bridge disconnected");
        }
    }

    fn rate_limit(&self) {
        if !self.realtime || self.mode == Mode::Idle {
            return;
        }
        let target = self.chain.block_duration();
        if let Some(last) = self.last_block {
            let elapsed = last.elapsed();
            if elapsed < target {
                let remaining = target - elapsed;
                // Sleep for the bulk, spin for the last millisecond
                if remaining > Duration::from_millis(2) {
                    std::thread::sleep(remaining - Duration::from_millis(1));
                }
                while last.elapsed() < target {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

/// Input shape for a chain whose first stage acquires its own signal.
pub fn source_input_shape(samples: usize) -> SignalShape {
    SignalShape::new(0, samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::StageResult;
    use crate::pipeline::phase::ChainState;
    use crate::pipeline::registrar::Registry;
    use crate::pipeline::stage::{BlockContext, Stage, StageContext};
    use crate::pipeline::visualization::NullVisualizationSink;

    struct Counter;

    impl Stage for Counter {
        fn validate(&self, input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
            let mut out = input.clone();
            out.set_channels(1);
            Ok(out)
        }

        fn execute(
            &mut self,
            _input: &SignalBuffer,
            output: &mut SignalBuffer,
            ctx: &mut BlockContext<'_>,
        ) -> StageResult<()> {
            output.fill(ctx.block() as f64);
            Ok(())
        }
    }

    fn allocated_chain() -> (Chain, Environment) {
        let mut registry = Registry::new();
        registry.register_stage("1.Source", 0, |_| Counter);
        let mut chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink)).unwrap();
        let mut env = Environment::new();
        env.set_parameter("SampleBlockSize", 4i64);
        env.set_parameter("SamplingRate", 4000.0);
        chain.declare(&mut env).unwrap();
        chain.validate(&source_input_shape(4), &mut env).unwrap();
        chain.allocate(&mut env).unwrap();
        (chain, env)
    }

    fn wait_for<F: Fn(&RunnerMessage) -> bool>(bridge: &RunnerBridge, pred: F) -> Vec<RunnerMessage> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(msg) = bridge.recv_timeout(Duration::from_millis(50)) {
                let done = pred(&msg);
                seen.push(msg);
                if done {
                    return seen;
                }
            }
        }
        panic!("timed out; saw {:?}", seen);
    }

    #[test]
    fn test_runs_block_limit_then_stops() {
        let (chain, env) = allocated_chain();
        let config = RunnerConfig {
            realtime: false,
            max_blocks: 5,
            ..RunnerConfig::default()
        };
        let (bridge, handle) = BlockRunner::spawn(chain, env, &config).unwrap();
        bridge.start();

        let seen = wait_for(&bridge, |m| matches!(m, RunnerMessage::RunStopped { .. }));
        let blocks = seen
            .iter()
            .filter(|m| matches!(m, RunnerMessage::BlockProcessed { resting: false, .. }))
            .count();
        assert_eq!(blocks, 5);
        assert!(matches!(seen.last(), Some(RunnerMessage::RunStopped { blocks: 5 })));

        bridge.shutdown();
        wait_for(&bridge, |m| matches!(m, RunnerMessage::Shutdown));
        let (mut chain, mut env) = handle.join().unwrap();
        assert_eq!(chain.state(), ChainState::Allocated);
        chain.release(&mut env).unwrap();
    }

    #[test]
    fn test_run_stopped_arrives_through_full_channel() {
        let (chain, env) = allocated_chain();
        let config = RunnerConfig {
            realtime: false,
            max_blocks: 2000,
            channel_capacity: 8,
        };
        let (bridge, handle) = BlockRunner::spawn(chain, env, &config).unwrap();
        bridge.start();

        // a consumer slower than the runner keeps the channel full
        let seen = wait_for(&bridge, |m| {
            std::thread::sleep(Duration::from_micros(200));
            matches!(m, RunnerMessage::RunStopped { .. })
        });
        assert!(matches!(seen.last(), Some(RunnerMessage::RunStopped { blocks: 2000 })));

        bridge.shutdown();
        wait_for(&bridge, |m| matches!(m, RunnerMessage::Shutdown));
        let (chain, _env) = handle.join().unwrap();
        assert_eq!(chain.state(), ChainState::Allocated);
    }

    #[test]
    fn test_rest_then_shutdown() {
        let (chain, env) = allocated_chain();
        let config = RunnerConfig {
            realtime: true,
            ..RunnerConfig::default()
        };
        let (bridge, handle) = BlockRunner::spawn(chain, env, &config).unwrap();
        bridge.rest();
        wait_for(&bridge, |m| matches!(m, RunnerMessage::BlockProcessed { resting: true, .. }));
        bridge.shutdown();
        wait_for(&bridge, |m| matches!(m, RunnerMessage::Shutdown));
        let (chain, _env) = handle.join().unwrap();
        assert_eq!(chain.state(), ChainState::Allocated);
    }

    #[test]
    fn test_start_on_unallocated_chain_faults() {
        let registry = Registry::new();
        let chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink)).unwrap();
        let config = RunnerConfig::default();
        let (bridge, handle) = BlockRunner::spawn(chain, Environment::new(), &config).unwrap();
        bridge.start();
        wait_for(&bridge, |m| matches!(m, RunnerMessage::Faulted(_)));
        bridge.shutdown();
        handle.join().unwrap();
    }
}
