use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort an extraction run.
///
/// Classification misses are not errors (the engine reports them as
/// [`crate::engine::Outcome::Unsupported`]), and a carver chain that stops
/// validating mid-scan is silently skipped. Everything that reaches this type
/// indicates an environment problem: an unmappable input or a decoder that
/// could not complete its write.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cannot open {path}: {source}")]
    Resource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{decoder} failed on {path}: {reason}")]
    Decoder {
        decoder: &'static str,
        path: PathBuf,
        reason: String,
    },
}

impl ExtractError {
    pub fn resource(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Resource {
            path: path.into(),
            source,
        }
    }

    pub fn decoder(decoder: &'static str, path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Decoder {
            decoder,
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtractError>;
