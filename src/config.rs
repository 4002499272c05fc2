//! Deserializable configuration for [`CompressionLayer`](crate::CompressionLayer).
//!
//! Loading the configuration (files, environment) is left to the host
//! application; this type only describes the shape.

use crate::codec::Codec;
use crate::layer::DEFAULT_MIN_SIZE;
use crate::policy::DEFAULT_EXCLUDED_EXTENSIONS;
use serde::{Deserialize, Serialize};

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Codec used in both directions
    #[serde(default)]
    pub codec: Codec,

    /// Compression level (-1 = codec default, 0 = no compression)
    #[serde(default = "default_level")]
    pub level: i32,

    /// Minimum response size to compress (in bytes)
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Request path prefixes never compressed
    #[serde(default)]
    pub excluded_paths: Vec<String>,

    /// File extensions never compressed
    #[serde(default = "default_excluded_extensions")]
    pub excluded_extensions: Vec<String>,

    /// Regular expressions matched against the request path
    #[serde(default)]
    pub excluded_path_patterns: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            level: default_level(),
            min_size: default_min_size(),
            excluded_paths: Vec::new(),
            excluded_extensions: default_excluded_extensions(),
            excluded_path_patterns: Vec::new(),
        }
    }
}

fn default_level() -> i32 {
    -1
}

fn default_min_size() -> usize {
    DEFAULT_MIN_SIZE
}

fn default_excluded_extensions() -> Vec<String> {
    DEFAULT_EXCLUDED_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}
