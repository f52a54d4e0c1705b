//! # filter-chain: block-synchronous signal processing chains
//!
//! Independently written processing stages register themselves at named
//! positions, are resolved into one linear chain, and are then driven through
//! a fixed lifecycle: declare their configuration surface, validate and
//! propagate signal shapes, allocate, and process sample blocks in lockstep.
//!
//! ## Architecture
//!
//! - **Registry**: priority-resolved registrars, one per position
//! - **Chain**: owns the stage instances, enforces phase order and fault isolation
//! - **Environment**: parameters, state fields and the diagnostic stream
//! - **Runner**: drives an allocated chain on its own thread over crossbeam channels
//!
//! ## Example
//!
//! ```no_run
//! use filter_chain::pipeline::{Chain, Environment, NullVisualizationSink, Registry, SignalBuffer};
//! use filter_chain::stages::register_builtin_stages;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut registry = Registry::new();
//!     register_builtin_stages(&mut registry);
//!
//!     let mut env = Environment::new();
//!     let mut chain = Chain::instantiate(&registry, Box::new(NullVisualizationSink))?;
//!     chain.declare(&mut env)?;
//!     let input = filter_chain::pipeline::source_input_shape(32);
//!     chain.validate(&input, &mut env)?;
//!     chain.allocate(&mut env)?;
//!     chain.run_start(&mut env)?;
//!
//!     let mut output = SignalBuffer::new(Default::default());
//!     chain.execute_block(&SignalBuffer::new(input), &mut output, &mut env)?;
//!
//!     chain.run_stop(&mut env)?;
//!     chain.release(&mut env)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod stages;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, Result, ResultExt};
pub use pipeline::{
    Chain, ChainError, ChainState, Environment, Phase, Registry, SignalBuffer, SignalShape, Stage,
    StageError,
};
