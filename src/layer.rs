use crate::codec::Codec;
use crate::config::CompressionConfig;
use crate::decompress::{DefaultDecompress, NoDecompress};
use crate::error::Error;
use crate::level::CompressionLevel;
use crate::policy::{Exclusions, ResponsePolicy};
use crate::pool::CodecPool;
use crate::service::CompressionService;
use std::sync::Arc;
use tower::Layer;

/// Default minimum body size for compression.
///
/// Zero compresses every eligible response, empty ones included. Raise it
/// (860 bytes, roughly one MTU, is a common choice) to leave payloads where
/// codec framing outweighs the savings uncompressed.
pub const DEFAULT_MIN_SIZE: usize = 0;

/// Configuration shared by every request of one middleware instance.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) codec: Codec,
    pub(crate) level: CompressionLevel,
    pub(crate) exclusions: Exclusions,
    pub(crate) response: ResponsePolicy,
    pub(crate) pool: Arc<CodecPool>,
}

/// A Tower layer that compresses HTTP response bodies and, optionally,
/// decompresses request bodies.
///
/// The type parameter is the request decompression strategy. The default
/// [`NoDecompress`] leaves request bodies alone; see
/// [`decompress_requests`](Self::decompress_requests).
#[derive(Debug, Clone)]
pub struct CompressionLayer<D = NoDecompress> {
    settings: Settings,
    decompress: D,
}

impl CompressionLayer {
    /// Creates a gzip layer at the default level.
    ///
    /// Responses for `.png`, `.gif`, `.jpeg` and `.jpg` paths are excluded.
    pub fn new() -> Self {
        Self {
            settings: Settings {
                codec: Codec::Gzip,
                level: CompressionLevel::Default,
                exclusions: Exclusions::default(),
                response: ResponsePolicy {
                    min_size: DEFAULT_MIN_SIZE,
                },
                pool: CodecPool::global(),
            },
            decompress: NoDecompress,
        }
    }

    /// Creates a layer for `codec` at `level`.
    ///
    /// Fails with [`Error::InvalidLevel`] if the codec does not support the level.
    pub fn with_codec(codec: Codec, level: CompressionLevel) -> Result<Self, Error> {
        codec.validate_level(level)?;

        let mut layer = Self::new();
        layer.settings.codec = codec;
        layer.settings.level = level;
        Ok(layer)
    }

    /// Creates a layer from deserialized configuration.
    pub fn from_config(config: &CompressionConfig) -> Result<Self, Error> {
        let layer = Self::with_codec(config.codec, config.level.into())?
            .min_size(config.min_size)
            .exclude_extensions(&config.excluded_extensions)
            .exclude_paths(config.excluded_paths.iter().cloned())
            .exclude_path_patterns(&config.excluded_path_patterns)?;

        tracing::debug!(
            codec = %config.codec,
            level = config.level,
            min_size = config.min_size,
            "compression layer configured"
        );
        Ok(layer)
    }
}

impl<D> CompressionLayer<D> {
    /// Sets the minimum body size required for compression.
    ///
    /// Responses with a known size (Content-Length or an exact body size
    /// hint) smaller than this value will not be compressed.
    pub fn min_size(mut self, size: usize) -> Self {
        self.settings.response.min_size = size;
        self
    }

    /// Replaces the excluded file extensions. A leading dot is optional.
    pub fn exclude_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exclusions = std::mem::take(&mut self.settings.exclusions);
        self.settings.exclusions = exclusions.extensions(extensions);
        self
    }

    /// Excludes request paths starting with any of `paths`.
    pub fn exclude_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let exclusions = std::mem::take(&mut self.settings.exclusions);
        self.settings.exclusions = exclusions.paths(paths);
        self
    }

    /// Excludes request paths matching any of the regular expressions.
    pub fn exclude_path_patterns<I, S>(mut self, patterns: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exclusions = std::mem::take(&mut self.settings.exclusions);
        self.settings.exclusions = exclusions.patterns(patterns)?;
        Ok(self)
    }

    /// Replaces all path and extension exclusions.
    pub fn exclusions(mut self, exclusions: Exclusions) -> Self {
        self.settings.exclusions = exclusions;
        self
    }

    /// Uses `pool` instead of the process-wide codec pool.
    pub fn pool(mut self, pool: Arc<CodecPool>) -> Self {
        self.settings.pool = pool;
        self
    }

    /// Decompresses request bodies flagged with the configured codec.
    pub fn decompress_requests(self) -> CompressionLayer<DefaultDecompress> {
        self.decompress_with(DefaultDecompress)
    }

    /// Decompresses flagged request bodies with a custom strategy.
    pub fn decompress_with<D2>(self, decompress: D2) -> CompressionLayer<D2> {
        CompressionLayer {
            settings: self.settings,
            decompress,
        }
    }
}

impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, D> Layer<S> for CompressionLayer<D>
where
    D: Clone,
{
    type Service = CompressionService<S, D>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::from_parts(
            inner,
            Arc::new(self.settings.clone()),
            self.decompress.clone(),
        )
    }
}
