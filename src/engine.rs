//! Dispatch and recursion driver.
//!
//! One input artifact is classified, extracted, and its derived artifacts are
//! fed back through classification until every branch ends in a terminal step
//! or a leaf nothing recognizes. An explicit FIFO work list bounds stack
//! usage regardless of how deeply a firmware image nests.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::artifact::Artifact;
use crate::error::{ExtractError, Result};
use crate::naming::{self, Destination};
use crate::registry::{Category, FormatRegistry};

/// Process-wide configuration, immutable once constructed.
pub struct Context {
    /// Destination root for every derived artifact.
    pub dest_dir: PathBuf,
}

impl Context {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The top-level decoder ran to completion.
    Success,
    /// No decoder claimed the top-level input. Normal, non-fatal.
    Unsupported,
}

pub struct ExtractionEngine {
    registry: FormatRegistry,
}

impl ExtractionEngine {
    pub fn new() -> Self {
        Self {
            registry: FormatRegistry::standard(),
        }
    }

    pub fn with_registry(registry: FormatRegistry) -> Self {
        Self { registry }
    }

    /// Unpack `input` and everything derived from it.
    ///
    /// A derived artifact that matches no decoder is a leaf, not an error;
    /// only the top-level input reports `Unsupported`. Decoder and resource
    /// failures abort the run, since they indicate an environment problem
    /// rather than a data problem.
    pub fn process(&self, input: &Path, ctx: &Context) -> Result<Outcome> {
        let mut queue: VecDeque<PathBuf> = VecDeque::new();
        queue.push_back(input.to_path_buf());
        let mut top_level = true;

        while let Some(path) = queue.pop_front() {
            let top = std::mem::replace(&mut top_level, false);

            // The mapping lives exactly as long as this step; it is released
            // before any derived artifact is opened.
            let followups = {
                let artifact = Artifact::open(&path)?;

                let Some(decoder) = self.registry.classify(&artifact) else {
                    if top {
                        return Ok(Outcome::Unsupported);
                    }
                    debug!(path = %path.display(), "no decoder matched, leaf artifact");
                    continue;
                };

                let kind = decoder.kind();
                let dest = naming::plan(kind, &path, &ctx.dest_dir);

                if let Destination::Dir(dir) = &dest {
                    if dir.exists() {
                        fs::remove_dir_all(dir).map_err(|e| {
                            ExtractError::decoder(kind.name(), dir.clone(), e)
                        })?;
                    }
                }

                info!(
                    decoder = kind.name(),
                    source = %path.display(),
                    dest = %dest.path().display(),
                    "extracting"
                );

                let extraction = decoder.extract(&artifact, &dest, ctx)?;

                match kind.category() {
                    Category::Terminal => Vec::new(),
                    Category::Transparent => {
                        debug_assert_eq!(
                            extraction.produced.len(),
                            1,
                            "transparent decoders produce exactly one artifact"
                        );
                        extraction.produced
                    }
                    Category::FanOut => extraction.recurse,
                }
            };

            queue.extend(followups);
        }

        Ok(Outcome::Success)
    }
}

impl Default for ExtractionEngine {
    fn default() -> Self {
        Self::new()
    }
}
