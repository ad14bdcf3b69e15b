//! Pipeline steps as queue executors
//!
//! Each step is a thin loop over the pages named in its job parameters: ask
//! the [`StepBackend`] for a result, persist it as a new artifact version and
//! report progress. The backend is the external model and renderer
//! collaborator; tests substitute a fake.

pub mod backend;
pub mod http_backend;
pub mod steps;

pub use backend::{SectionDraft, StepBackend};
pub use http_backend::HttpStepBackend;
pub use steps::{pipeline_executors, PipelineContext, StepParams};

/// Job type: raw text per page
pub const EXTRACT: &str = "extract";
/// Job type: whole-book metadata
pub const METADATA: &str = "metadata";
/// Job type: text groups per page
pub const CLASSIFY: &str = "classify";
/// Job type: sections per page
pub const SECTION: &str = "section";
/// Job type: rendered sections
pub const RENDER: &str = "render";

pub const JOB_TYPES: [&str; 5] = [EXTRACT, METADATA, CLASSIFY, SECTION, RENDER];
