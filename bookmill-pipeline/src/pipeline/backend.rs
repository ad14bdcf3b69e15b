//! External step collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One section proposed for a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionDraft {
    /// Section id within the page, e.g. `s001`
    pub section_id: String,
    /// `None` prunes the section
    pub data: Option<Value>,
}

/// Model and renderer calls behind the pipeline steps
///
/// Implementations do the network or process work; the executors own
/// persistence, progress and cancellation.
#[async_trait]
pub trait StepBackend: Send + Sync {
    /// Raw text of one page; `None` when the page has no text
    async fn extract_page(&self, label: &str, page_id: &str) -> anyhow::Result<Option<Value>>;

    /// Book metadata from the extracted page texts, in page order
    async fn extract_metadata(&self, label: &str, pages: &[(String, Value)]) -> anyhow::Result<Value>;

    /// Text groups of one page
    async fn classify_page(&self, label: &str, page_id: &str, text: &Value) -> anyhow::Result<Value>;

    /// Sections of one page from its classification
    async fn section_page(
        &self,
        label: &str,
        page_id: &str,
        classification: &Value,
    ) -> anyhow::Result<Vec<SectionDraft>>;

    /// Rendered form of one section
    async fn render_section(&self, label: &str, item_id: &str, section: &Value) -> anyhow::Result<Value>;
}
