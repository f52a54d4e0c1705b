//! Signal shapes and the rectangular sample buffers passed between stages.
//!
//! A `SignalBuffer` is allocated once per stage boundary at Allocate time and
//! reused every block; nothing on the per-block path allocates unless a shape
//! changes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical unit of one channel: `physical = (raw - offset) * gain` in `symbol`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelUnit {
    pub offset: f64,
    pub gain: f64,
    pub symbol: String,
}

impl ChannelUnit {
    pub fn new(offset: f64, gain: f64, symbol: impl Into<String>) -> Self {
        Self {
            offset,
            gain,
            symbol: symbol.into(),
        }
    }

    #[inline]
    pub fn raw_to_physical(&self, raw: f64) -> f64 {
        (raw - self.offset) * self.gain
    }

    #[inline]
    pub fn physical_to_raw(&self, physical: f64) -> f64 {
        if self.gain == 0.0 {
            self.offset
        } else {
            physical / self.gain + self.offset
        }
    }
}

impl Default for ChannelUnit {
    fn default() -> Self {
        Self::new(0.0, 1.0, "")
    }
}

/// Description of a rectangular sample block: channels × samples per block.
///
/// Fixed for the duration of one run once a stage has produced it at Validate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalShape {
    /// Human-readable signal name; synthesized by the chain when empty.
    #[serde(default)]
    pub name: String,
    channel_labels: Vec<String>,
    channel_units: Vec<ChannelUnit>,
    samples: usize,
    /// Sampling rate of the signal, in Hz. Zero when not meaningful.
    #[serde(default)]
    pub sampling_rate: f64,
}

impl SignalShape {
    /// Create a shape with default labels ("1", "2", ...) and unit gains.
    pub fn new(channels: usize, samples: usize) -> Self {
        Self {
            name: String::new(),
            channel_labels: (1..=channels).map(|i| i.to_string()).collect(),
            channel_units: vec![ChannelUnit::default(); channels],
            samples,
            sampling_rate: 0.0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self
    }

    /// Replace the channel labels. Extra labels are ignored, missing ones
    /// keep their previous value.
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for (slot, label) in self.channel_labels.iter_mut().zip(labels) {
            *slot = label.into();
        }
        self
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channel_labels.len()
    }

    #[inline]
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Total number of values in a buffer of this shape.
    #[inline]
    pub fn len(&self) -> usize {
        self.channels() * self.samples
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two shapes describe buffers of identical dimensions.
    #[inline]
    pub fn same_dimensions(&self, other: &SignalShape) -> bool {
        self.channels() == other.channels() && self.samples == other.samples
    }

    pub fn channel_label(&self, channel: usize) -> Option<&str> {
        self.channel_labels.get(channel).map(String::as_str)
    }

    pub fn channel_labels(&self) -> &[String] {
        &self.channel_labels
    }

    pub fn channel_unit(&self, channel: usize) -> Option<&ChannelUnit> {
        self.channel_units.get(channel)
    }

    pub fn channel_unit_mut(&mut self, channel: usize) -> Option<&mut ChannelUnit> {
        self.channel_units.get_mut(channel)
    }

    pub fn set_channel_label(&mut self, channel: usize, label: impl Into<String>) {
        if let Some(slot) = self.channel_labels.get_mut(channel) {
            *slot = label.into();
        }
    }

    /// Index of the channel with the given label.
    pub fn channel_index(&self, label: &str) -> Option<usize> {
        self.channel_labels.iter().position(|l| l == label)
    }

    /// Resize the channel dimension. New channels get default labels/units.
    pub fn set_channels(&mut self, channels: usize) {
        let old = self.channels();
        self.channel_labels.truncate(channels);
        self.channel_units.truncate(channels);
        for i in old..channels {
            self.channel_labels.push((i + 1).to_string());
            self.channel_units.push(ChannelUnit::default());
        }
    }

    pub fn set_samples(&mut self, samples: usize) {
        self.samples = samples;
    }
}

impl fmt::Display for SignalShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}x{}", self.channels(), self.samples)
        } else {
            write!(f, "{} {}x{}", self.name, self.channels(), self.samples)
        }
    }
}

/// Mutable channels × samples array of values, channel-major.
#[derive(Clone, PartialEq)]
pub struct SignalBuffer {
    shape: SignalShape,
    values: Vec<f64>,
}

impl SignalBuffer {
    /// Create a zero-filled buffer for the given shape.
    pub fn new(shape: SignalShape) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Create a buffer with every value set to `value`.
    pub fn filled(shape: SignalShape, value: f64) -> Self {
        let values = vec![value; shape.len()];
        Self { shape, values }
    }

    /// Create a buffer of NaNs ("undefined"), used as an initial display snapshot.
    pub fn undefined(shape: SignalShape) -> Self {
        Self::filled(shape, f64::NAN)
    }

    #[inline]
    pub fn shape(&self) -> &SignalShape {
        &self.shape
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.shape.channels()
    }

    #[inline]
    pub fn samples(&self) -> usize {
        self.shape.samples()
    }

    /// Replace the shape, resizing storage. Values are zeroed when the
    /// dimensions change and kept otherwise.
    pub fn set_shape(&mut self, shape: SignalShape) {
        if !self.shape.same_dimensions(&shape) {
            self.values.clear();
            self.values.resize(shape.len(), 0.0);
        }
        self.shape = shape;
    }

    #[inline]
    fn index(&self, channel: usize, sample: usize) -> Option<usize> {
        if channel < self.channels() && sample < self.samples() {
            Some(channel * self.samples() + sample)
        } else {
            None
        }
    }

    /// Value at (channel, sample), or `None` if out of bounds.
    #[inline]
    pub fn get(&self, channel: usize, sample: usize) -> Option<f64> {
        self.index(channel, sample).map(|i| self.values[i])
    }

    /// Set the value at (channel, sample). Returns `false` if out of bounds.
    #[inline]
    pub fn set(&mut self, channel: usize, sample: usize, value: f64) -> bool {
        match self.index(channel, sample) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => false,
        }
    }

    /// The samples of one channel.
    #[inline]
    pub fn channel(&self, channel: usize) -> &[f64] {
        let n = self.samples();
        &self.values[channel * n..(channel + 1) * n]
    }

    #[inline]
    pub fn channel_mut(&mut self, channel: usize) -> &mut [f64] {
        let n = self.samples();
        &mut self.values[channel * n..(channel + 1) * n]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn fill(&mut self, value: f64) {
        self.values.iter_mut().for_each(|v| *v = value);
    }

    /// Copy values (and shape, if dimensions differ) from `src`.
    pub fn assign_values(&mut self, src: &SignalBuffer) {
        if !self.shape.same_dimensions(&src.shape) {
            self.shape = src.shape.clone();
            self.values.resize(src.values.len(), 0.0);
        }
        self.values.copy_from_slice(&src.values);
    }

    /// Bit-for-bit equality of values (NaN-aware), ignoring shape metadata.
    pub fn bitwise_eq(&self, other: &SignalBuffer) -> bool {
        self.shape.same_dimensions(&other.shape)
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl fmt::Debug for SignalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBuffer")
            .field("shape", &self.shape)
            .field("len", &self.values.len())
            .finish()
    }
}
