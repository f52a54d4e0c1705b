//! Lifecycle phases and the chain's state machine.
//!
//! A chain moves through its states strictly in this order:
//!
//! ```text
//! Instantiated ─declare─► Declared ─validate─► Validated ─allocate─► Allocated
//!                            ▲  │ (errors)          │                 │  ▲
//!                            └──┘                   └─validate─┘      │  │
//!                                                          run_start ─┘  └─ run_stop
//!                                                                 ▼         │
//!                                                              Running ─────┘
//! any non-running state ─release─► Released
//! Allocate/RunStart/Execute failure ─► Faulted ─release─► Released
//! ```

use std::fmt;

/// One lifecycle phase of a stage, used to tag diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Instantiate,
    Declare,
    AutoConfig,
    Validate,
    Allocate,
    RunStart,
    Execute,
    Resting,
    RunStop,
    Halt,
    Release,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Instantiate => "Instantiate",
            Phase::Declare => "Declare",
            Phase::AutoConfig => "AutoConfig",
            Phase::Validate => "Validate",
            Phase::Allocate => "Allocate",
            Phase::RunStart => "RunStart",
            Phase::Execute => "Execute",
            Phase::Resting => "Resting",
            Phase::RunStop => "RunStop",
            Phase::Halt => "Halt",
            Phase::Release => "Release",
        }
    }

    /// Phases whose failures end the current run rather than just
    /// rejecting the configuration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Phase::Allocate | Phase::RunStart | Phase::Execute | Phase::Resting
        )
    }

    /// Phases timed against the block duration.
    pub fn is_timed(&self) -> bool {
        matches!(self, Phase::Execute | Phase::Resting)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a chain is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Instantiated,
    Declared,
    Validated,
    Allocated,
    Running,
    Faulted,
    Released,
}

impl ChainState {
    /// Whether `phase` may be entered from this state.
    pub fn permits(self, phase: Phase) -> bool {
        use ChainState::*;
        match phase {
            Phase::Instantiate => matches!(self, Released),
            Phase::Declare => matches!(self, Instantiated),
            Phase::AutoConfig | Phase::Validate => matches!(self, Declared | Validated),
            Phase::Allocate => matches!(self, Validated),
            Phase::RunStart => matches!(self, Allocated),
            Phase::Execute => matches!(self, Running),
            Phase::Resting => matches!(self, Allocated),
            Phase::RunStop => matches!(self, Running | Faulted),
            Phase::Halt => matches!(self, Allocated | Faulted),
            Phase::Release => !matches!(self, Running | Released),
        }
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
