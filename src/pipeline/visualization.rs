//! Visualization taps: per-stage pushes of output signals to a display sink.
//!
//! The chain owns one tap per visualization-capable stage, keyed by the
//! stage's position. Rendering happens elsewhere; the chain only talks to a
//! [`VisualizationSink`].

use crate::pipeline::signal::{SignalBuffer, SignalShape};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What kind of display a tap feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisKind {
    /// Time series of the stage's output block.
    Signal,
    /// Free text.
    Memo,
}

/// Receiver of visualization data.
#[cfg_attr(test, mockall::automock)]
pub trait VisualizationSink: Send {
    fn create(&mut self, vis_id: &str, kind: VisKind);
    fn push_shape(&mut self, vis_id: &str, shape: &SignalShape);
    fn push_signal(&mut self, vis_id: &str, buffer: &SignalBuffer);
    fn set_visible(&mut self, vis_id: &str, visible: bool);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullVisualizationSink;

impl VisualizationSink for NullVisualizationSink {
    fn create(&mut self, _vis_id: &str, _kind: VisKind) {}
    fn push_shape(&mut self, _vis_id: &str, _shape: &SignalShape) {}
    fn push_signal(&mut self, _vis_id: &str, _buffer: &SignalBuffer) {}
    fn set_visible(&mut self, _vis_id: &str, _visible: bool) {}
}

/// Messages forwarded by [`ChannelVisualizationSink`].
#[derive(Debug, Clone)]
pub enum VisMessage {
    Create { vis_id: String, kind: VisKind },
    Shape { vis_id: String, shape: SignalShape },
    Signal { vis_id: String, buffer: SignalBuffer },
    Visible { vis_id: String, visible: bool },
}

impl VisMessage {
    pub fn vis_id(&self) -> &str {
        match self {
            VisMessage::Create { vis_id, .. }
            | VisMessage::Shape { vis_id, .. }
            | VisMessage::Signal { vis_id, .. }
            | VisMessage::Visible { vis_id, .. } => vis_id,
        }
    }
}

/// Forwards taps to a display thread over a bounded channel.
///
/// Sends never block the block clock: when the channel is full the message is
/// dropped and counted.
pub struct ChannelVisualizationSink {
    tx: Sender<VisMessage>,
    dropped: Arc<AtomicU64>,
}

impl ChannelVisualizationSink {
    /// Create a sink and the receiving end for the display side.
    pub fn bounded(capacity: usize) -> (Self, Receiver<VisMessage>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self::new(tx), rx)
    }

    pub fn new(tx: Sender<VisMessage>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of messages dropped due to backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared handle to the drop counter, readable after the sink moved into a chain.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    fn send(&self, message: VisMessage) {
        if self.tx.try_send(message).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl VisualizationSink for ChannelVisualizationSink {
    fn create(&mut self, vis_id: &str, kind: VisKind) {
        self.send(VisMessage::Create {
            vis_id: vis_id.to_string(),
            kind,
        });
    }

    fn push_shape(&mut self, vis_id: &str, shape: &SignalShape) {
        self.send(VisMessage::Shape {
            vis_id: vis_id.to_string(),
            shape: shape.clone(),
        });
    }

    fn push_signal(&mut self, vis_id: &str, buffer: &SignalBuffer) {
        self.send(VisMessage::Signal {
            vis_id: vis_id.to_string(),
            buffer: buffer.clone(),
        });
    }

    fn set_visible(&mut self, vis_id: &str, visible: bool) {
        self.send(VisMessage::Visible {
            vis_id: vis_id.to_string(),
            visible,
        });
    }
}

impl Drop for ChannelVisualizationSink {
    fn drop(&mut self) {
        let dropped = self.dropped();
        if dropped > 0 {
            tracing::warn!("Visualization sink dropped {} messages due to backpressure", dropped);
        }
    }
}
