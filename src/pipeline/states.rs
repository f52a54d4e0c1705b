//! State and event fields: small unsigned values co-sampled with the signal.
//!
//! Stages declare the fields they write (states) or want to read (events)
//! during the Declare phase. The chain lays them out into a [`StateVector`]
//! at Allocate time, holding one value per field per sample of the block.

use crate::pipeline::error::StateError;
use std::collections::HashMap;

/// Whether a field is written by stages or fed from asynchronous events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    State,
    Event,
}

/// Declaration of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateField {
    pub name: String,
    /// Bit width, 1..=32.
    pub bits: u8,
    pub default: u32,
    pub kind: FieldKind,
}

impl StateField {
    pub fn state(name: impl Into<String>, bits: u8, default: u32) -> Self {
        Self {
            name: name.into(),
            bits,
            default,
            kind: FieldKind::State,
        }
    }

    pub fn event(name: impl Into<String>, bits: u8, default: u32) -> Self {
        Self {
            name: name.into(),
            bits,
            default,
            kind: FieldKind::Event,
        }
    }

    /// Largest value representable in this field.
    #[inline]
    pub fn max_value(&self) -> u32 {
        if self.bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.bits) - 1
        }
    }

    fn check(&self) -> Result<(), StateError> {
        if self.bits == 0 || self.bits > 32 {
            return Err(StateError::InvalidWidth {
                name: self.name.clone(),
                bits: self.bits,
            });
        }
        if self.default > self.max_value() {
            return Err(StateError::ValueOutOfRange {
                name: self.name.clone(),
                value: self.default,
                bits: self.bits,
            });
        }
        Ok(())
    }
}

/// Ordered list of declared fields.
#[derive(Debug, Clone, Default)]
pub struct StateList {
    fields: Vec<StateField>,
    index: HashMap<String, usize>,
}

impl StateList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field. Re-declaring an identical field is a no-op; re-declaring
    /// with a different layout is an error.
    pub fn declare(&mut self, field: StateField) -> Result<(), StateError> {
        field.check()?;
        if let Some(&i) = self.index.get(&field.name) {
            let existing = &self.fields[i];
            if existing.bits != field.bits || existing.kind != field.kind {
                return Err(StateError::Conflict(field.name));
            }
            return Ok(());
        }
        self.index.insert(field.name.clone(), self.fields.len());
        self.fields.push(field);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&StateField> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn exists(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Per-sample field access used by stages during Execute.
pub trait StateAccess {
    fn get_state(&self, name: &str, sample: usize) -> Result<u32, StateError>;
    fn set_state(&mut self, name: &str, sample: usize, value: u32) -> Result<(), StateError>;
}

/// Values of every declared field for every sample of one block.
#[derive(Debug, Clone, Default)]
pub struct StateVector {
    fields: Vec<StateField>,
    index: HashMap<String, usize>,
    samples: usize,
    /// Field-major: `values[field * samples + sample]`.
    values: Vec<u32>,
}

impl StateVector {
    /// Lay out `list` for blocks of `samples` samples, initialized to defaults.
    pub fn new(list: &StateList, samples: usize) -> Self {
        let fields: Vec<StateField> = list.iter().cloned().collect();
        let index = list.index.clone();
        let mut values = Vec::with_capacity(fields.len() * samples);
        for field in &fields {
            values.extend(std::iter::repeat(field.default).take(samples));
        }
        Self {
            fields,
            index,
            samples,
            values,
        }
    }

    #[inline]
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn fields(&self) -> &[StateField] {
        &self.fields
    }

    fn locate(&self, name: &str, sample: usize) -> Result<(usize, &StateField), StateError> {
        let &i = self
            .index
            .get(name)
            .ok_or_else(|| StateError::Unknown(name.to_string()))?;
        if sample >= self.samples {
            return Err(StateError::SampleOutOfRange {
                name: name.to_string(),
                sample,
                samples: self.samples,
            });
        }
        Ok((i * self.samples + sample, &self.fields[i]))
    }

    /// Carry the last sample's values over to every sample of the next block,
    /// the way state values persist across block boundaries.
    pub fn commit_block(&mut self) {
        if self.samples == 0 {
            return;
        }
        for chunk in self.values.chunks_mut(self.samples) {
            let last = chunk[chunk.len() - 1];
            chunk.iter_mut().for_each(|v| *v = last);
        }
    }

    /// Reset every field to its declared default.
    pub fn reset(&mut self) {
        for (chunk, field) in self.values.chunks_mut(self.samples.max(1)).zip(&self.fields) {
            chunk.iter_mut().for_each(|v| *v = field.default);
        }
    }
}

impl StateAccess for StateVector {
    fn get_state(&self, name: &str, sample: usize) -> Result<u32, StateError> {
        let (i, _) = self.locate(name, sample)?;
        Ok(self.values[i])
    }

    fn set_state(&mut self, name: &str, sample: usize, value: u32) -> Result<(), StateError> {
        let (i, field) = self.locate(name, sample)?;
        if value > field.max_value() {
            return Err(StateError::ValueOutOfRange {
                name: name.to_string(),
                value,
                bits: field.bits,
            });
        }
        self.values[i] = value;
        Ok(())
    }
}
