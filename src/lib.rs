//! Recursive extractor for LG EPK firmware packages and related TV boot
//! artifacts: an ordered chain of binary-signature detectors, a work-queue
//! extraction engine, and a structural carver for chained LZHS records.

pub mod artifact;
pub mod carver;
pub mod engine;
pub mod error;
pub mod formats;
pub mod mfile;
pub mod naming;
pub mod registry;

pub use artifact::Artifact;
pub use engine::{Context, ExtractionEngine, Outcome};
pub use error::{ExtractError, Result};
pub use mfile::MappedFile;
pub use registry::{Category, Decoder, DecoderKind, Extraction, FormatRegistry};
