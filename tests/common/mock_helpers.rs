//! Mock construction helpers

use crossbeam_channel::Receiver;
use filter_chain::pipeline::{ChannelVisualizationSink, VisMessage, VisualizationSink};

/// A channel-backed visualization sink plus its receiving end.
pub fn create_test_vis() -> (Box<dyn VisualizationSink>, Receiver<VisMessage>) {
    let (sink, rx) = ChannelVisualizationSink::bounded(1024);
    (Box::new(sink), rx)
}

/// Everything currently queued on `rx`.
pub fn drain_vis(rx: &Receiver<VisMessage>) -> Vec<VisMessage> {
    rx.try_iter().collect()
}
