//! Built-in stages used by the `filter-chain` binary and the test suite.
//!
//! | Position        | Stage               | Purpose                          |
//! |-----------------|---------------------|----------------------------------|
//! | `1.Source`      | [`SignalGenerator`] | sine source, `SourceCh` may be `auto` |
//! | `2.Filter`      | [`LinearTransform`] | gain and offset                  |
//! | `3.Application` | [`ThresholdMarker`] | writes `ThresholdCrossed` state  |

pub mod generator;
pub mod linear;
pub mod marker;

pub use generator::{SignalGenerator, DEVICE_CHANNELS};
pub use linear::LinearTransform;
pub use marker::{ThresholdMarker, THRESHOLD_STATE};

use crate::pipeline::Registry;

pub const SOURCE_POSITION: &str = "1.Source";
pub const FILTER_POSITION: &str = "2.Filter";
pub const APPLICATION_POSITION: &str = "3.Application";

/// Register the built-in stages at their default positions with priority 0.
pub fn register_builtin_stages(registry: &mut Registry) {
    registry.register_stage(SOURCE_POSITION, 0, |_| SignalGenerator::new());
    registry.register_stage(FILTER_POSITION, 0, |_| LinearTransform::new());
    registry.register_stage(APPLICATION_POSITION, 0, |_| ThresholdMarker::new());
}
