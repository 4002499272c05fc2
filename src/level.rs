use std::fmt;

/// Speed/ratio trade-off for the configured codec.
///
/// The integer form used in configuration follows the usual flate
/// conventions: `-1` selects the codec default and `0` disables
/// compression. Any other value is a precise codec level and is checked
/// against the codec's range when the middleware is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionLevel {
    /// The codec's default level.
    #[default]
    Default,
    /// Store without compressing. Only flate-based codecs support this.
    None,
    /// The fastest level the codec offers.
    Fastest,
    /// The best ratio the codec offers.
    Best,
    /// A codec-specific level.
    Precise(i32),
}

impl From<i32> for CompressionLevel {
    fn from(value: i32) -> Self {
        match value {
            -1 => CompressionLevel::Default,
            0 => CompressionLevel::None,
            n => CompressionLevel::Precise(n),
        }
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionLevel::Default => f.write_str("default"),
            CompressionLevel::None => f.write_str("none"),
            CompressionLevel::Fastest => f.write_str("fastest"),
            CompressionLevel::Best => f.write_str("best"),
            CompressionLevel::Precise(n) => write!(f, "{n}"),
        }
    }
}
