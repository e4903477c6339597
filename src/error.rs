use thiserror::Error;

/// Errors raised by the digest core and its input decoders.
#[derive(Debug, Error)]
pub enum DigestError {
    /// `summarize` was called on an accumulator that never saw a sample.
    #[error("latency accumulator has no samples")]
    EmptyAccumulator,

    /// Adding the duration would push a fingerprint's cumulative time past
    /// `u64::MAX` nanoseconds. The record is rejected and nothing changes.
    #[error("cumulative duration for `{fingerprint}` would overflow u64 nanoseconds")]
    DurationOverflow { fingerprint: String },

    /// An input entry could not be decoded into a record.
    #[error("{source_name}:{line}: {message}")]
    Parse {
        source_name: String,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DigestError {
    pub fn parse(source_name: &str, line: usize, message: impl Into<String>) -> Self {
        DigestError::Parse {
            source_name: source_name.to_string(),
            line,
            message: message.into(),
        }
    }
}
