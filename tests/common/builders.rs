//! Test data builders for environments and chains

use filter_chain::pipeline::{
    Chain, Environment, NullVisualizationSink, ParamValue, SignalBuffer, SignalShape,
    VisualizationSink, SAMPLE_BLOCK_SIZE, SAMPLING_RATE,
};
use filter_chain::Registry;

/// Builder for an [`Environment`] with a chosen block geometry.
pub struct EnvBuilder {
    sampling_rate: f64,
    samples: i64,
    parameters: Vec<(String, ParamValue)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self {
            sampling_rate: 1000.0,
            samples: 10,
            parameters: Vec::new(),
        }
    }

    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn samples(mut self, samples: i64) -> Self {
        self.samples = samples;
        self
    }

    pub fn param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.parameters.push((name.to_string(), value.into()));
        self
    }

    pub fn build(self) -> Environment {
        let mut env = Environment::new();
        env.set_parameter(SAMPLING_RATE, self.sampling_rate);
        env.set_parameter(SAMPLE_BLOCK_SIZE, self.samples);
        for (name, value) in self.parameters {
            env.set_parameter(name, value);
        }
        env
    }
}

/// Instantiate and declare a chain from `registry` with no visualization.
pub fn declared_chain(registry: &Registry, env: &mut Environment) -> Chain {
    declared_chain_with(registry, env, Box::new(NullVisualizationSink))
}

pub fn declared_chain_with(
    registry: &Registry,
    env: &mut Environment,
    vis: Box<dyn VisualizationSink>,
) -> Chain {
    let mut chain = Chain::instantiate(registry, vis).unwrap();
    chain.declare(env).unwrap();
    chain
}

/// Declare, validate, allocate and start a run for `input`.
pub fn running_chain(registry: &Registry, env: &mut Environment, input: &SignalShape) -> Chain {
    let mut chain = declared_chain(registry, env);
    chain.validate(input, env).unwrap();
    chain.allocate(env).unwrap();
    chain.run_start(env).unwrap();
    chain
}

/// A buffer whose value at (ch, s) is `ch * 100 + s`.
pub fn ramp_buffer(channels: usize, samples: usize) -> SignalBuffer {
    let mut buffer = SignalBuffer::new(SignalShape::new(channels, samples));
    for ch in 0..channels {
        for (s, value) in buffer.channel_mut(ch).iter_mut().enumerate() {
            *value = (ch * 100 + s) as f64;
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_buffer() {
        let buffer = ramp_buffer(2, 3);
        assert_eq!(buffer.get(1, 2), Some(102.0));
    }
}
