//! Block-synchronous filter chain engine.
//!
//! Independently written stages register into a [`Registry`], are
//! instantiated into a [`Chain`] in resolved order, and are driven through a
//! fixed lifecycle once per phase across the whole chain.
//!
//! # Architecture
//!
//! ```text
//! Registry ──resolve──► Chain [Source] ──► [Filter] ──► [App] ──► output block
//!                          │         │           │          │
//!                          │         └── taps ───┴──────────┴──► VisualizationSink
//!                          └── StageContext / BlockContext ◄── Environment
//!                                                              (params, states,
//!                                                               diagnostics)
//! ```
//!
//! # Lifecycle
//!
//! `declare → validate → allocate → {run_start → execute_block* → run_stop}* → release`
//!
//! # Design
//!
//! - **Trait objects for stages**: the chain owns `Box<dyn Stage>` in pipeline order.
//! - **Context passing**: diagnostics, parameters and state values reach stages
//!   through per-call contexts, never through globals.
//! - **No allocation per block**: inter-stage buffers are allocated once at Allocate.
//! - **Dedicated thread**: [`BlockRunner`] drives an allocated chain and talks to
//!   its owner over crossbeam channels.

pub mod chain;
pub mod diagnostics;
pub mod environment;
pub mod error;
pub mod params;
pub mod phase;
pub mod profiling;
pub mod registrar;
pub mod runner;
pub mod signal;
pub mod stage;
pub mod states;
pub mod visualization;

pub use chain::{Chain, StagePerformance, OVERRUN_MESSAGE};
pub use diagnostics::{Diagnostic, DiagnosticLog, DiagnosticSink, Severity};
pub use environment::{
    Environment, EVALUATE_TIMING, SAMPLE_BLOCK_SIZE, SAMPLING_RATE, VISUALIZE_SECTION,
};
pub use error::{ChainError, ChainResult, ParamError, StageError, StageResult, StateError};
pub use params::{ParamDecl, ParamValue, ParameterResolver, ParameterSet};
pub use phase::{ChainState, Phase};
pub use profiling::{PerformanceData, StopWatch};
pub use registrar::{
    register_global, short_type_name, ChainEntry, ChainInfo, Placement, Registrar, Registry,
    StageFactory,
};
pub use runner::{source_input_shape, BlockRunner, RunnerBridge, RunnerCommand, RunnerMessage};
pub use signal::{ChannelUnit, SignalBuffer, SignalShape};
pub use stage::{BlockContext, Stage, StageContext, Surface};
pub use states::{FieldKind, StateAccess, StateField, StateList, StateVector};
pub use visualization::{
    ChannelVisualizationSink, NullVisualizationSink, VisKind, VisMessage, VisualizationSink,
};
