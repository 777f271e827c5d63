// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Name → constructor map for backbones, filled in explicitly at start-up.

use crate::monitor::{Encoder, FeatureMode};
use crate::{ContinualError, Result};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use spiral_config::determinism;
use std::collections::BTreeMap;
use std::fmt;

/// Shape and seed of the backbone to build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSpec {
    pub name: String,
    pub input_dim: usize,
    /// Width of the feature head.
    pub output_dim: usize,
    /// Width of the logits head.
    pub num_classes: usize,
    pub seed: Option<u64>,
}

impl Default for EncoderSpec {
    fn default() -> Self {
        Self {
            name: "identity".to_string(),
            input_dim: 0,
            output_dim: 0,
            num_classes: 0,
            seed: None,
        }
    }
}

pub type BoxedEncoder = Box<dyn Encoder + Send + Sync>;
type Constructor = Box<dyn Fn(&EncoderSpec) -> Result<BoxedEncoder> + Send + Sync>;

#[derive(Default)]
pub struct ModelRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names())
            .finish()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `identity` and `random_projection`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("identity", |_| Ok(Box::new(IdentityEncoder) as BoxedEncoder));
        registry.register("random_projection", |spec| {
            Ok(Box::new(RandomProjectionEncoder::new(spec)?) as BoxedEncoder)
        });
        registry
    }

    /// Adds or replaces the constructor for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&EncoderSpec) -> Result<BoxedEncoder> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn build(&self, spec: &EncoderSpec) -> Result<BoxedEncoder> {
        let constructor = self
            .constructors
            .get(&spec.name)
            .ok_or_else(|| ContinualError::UnknownModel(spec.name.clone()))?;
        constructor(spec)
    }
}

/// Returns its input for either head.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IdentityEncoder;

impl Encoder for IdentityEncoder {
    fn forward(&self, inputs: &Array2<f32>, _mode: FeatureMode) -> Result<Array2<f32>> {
        Ok(inputs.clone())
    }
}

/// Fixed random backbone: `features = tanh(x·P)`, `logits = features·H`.
#[derive(Clone, Debug, PartialEq)]
pub struct RandomProjectionEncoder {
    projection: Array2<f32>,
    head: Array2<f32>,
}

impl RandomProjectionEncoder {
    pub fn new(spec: &EncoderSpec) -> Result<Self> {
        if spec.input_dim == 0 || spec.output_dim == 0 || spec.num_classes == 0 {
            return Err(ContinualError::InvalidArgument(format!(
                "random_projection needs input_dim, output_dim and num_classes > 0 (got {}, {}, {})",
                spec.input_dim, spec.output_dim, spec.num_classes
            )));
        }
        let mut rng = determinism::rng_from_optional(spec.seed, "model/random_projection");
        let bound = 1.0 / (spec.input_dim as f32).sqrt();
        let projection =
            Array2::from_shape_fn((spec.input_dim, spec.output_dim), |_| rng.gen_range(-bound..bound));
        let bound = 1.0 / (spec.output_dim as f32).sqrt();
        let head =
            Array2::from_shape_fn((spec.output_dim, spec.num_classes), |_| rng.gen_range(-bound..bound));
        Ok(Self { projection, head })
    }
}

impl Encoder for RandomProjectionEncoder {
    fn forward(&self, inputs: &Array2<f32>, mode: FeatureMode) -> Result<Array2<f32>> {
        if inputs.ncols() != self.projection.nrows() {
            return Err(ContinualError::Shape(format!(
                "random_projection expects {} inputs, got {}",
                self.projection.nrows(),
                inputs.ncols()
            )));
        }
        let features = inputs.dot(&self.projection).mapv(f32::tanh);
        Ok(match mode {
            FeatureMode::Features => features,
            FeatureMode::Logits => features.dot(&self.head),
        })
    }
}
