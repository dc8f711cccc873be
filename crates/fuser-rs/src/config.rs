//! Cache and dispatcher configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How `deserialize` treats persisted portable artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePolicy {
    /// Rebuild every portable artifact while loading; a restore failure fails the load.
    #[default]
    Eager,
    /// Keep the bytes and rebuild on first compatible lookup.
    Lazy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Compile on a cache miss. When off, a miss fails with `ShapeConcretization`.
    pub compile_on_miss: bool,
    pub capture_debug_output: bool,
    pub restore_policy: RestorePolicy,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            compile_on_miss: true,
            capture_debug_output: false,
            restore_policy: RestorePolicy::Eager,
        }
    }
}

impl FusionConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse fusion config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read fusion config {}", path.display()))?;
        Self::from_json_str(&text)
    }
}

/// Per-call overrides for [`FusionContext::execute`](crate::dispatch::FusionContext::execute).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    pub capture_debug_output: Option<bool>,
    /// Key every axis by its exact extent.
    pub static_shapes: bool,
    pub compile_on_miss: Option<bool>,
    /// Base seed for stochastic operators.
    pub rng_seed: u64,
}

impl ExecuteOptions {
    pub fn with_debug_output(mut self) -> Self {
        self.capture_debug_output = Some(true);
        self
    }

    pub fn with_static_shapes(mut self) -> Self {
        self.static_shapes = true;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }
}
