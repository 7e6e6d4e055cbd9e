//! The workspace generation pipeline and its compensation protocol.

/// Failure compensation and orphan sweeping.
pub mod compensator;
/// The ordered generation steps.
pub mod pipeline;
/// Named templates for generated files.
pub mod templates;

pub use compensator::{CleanupReport, Compensator};
pub use pipeline::{GenerationPipeline, GenerationStep};
pub use templates::{TemplateSet, TemplateVars};
