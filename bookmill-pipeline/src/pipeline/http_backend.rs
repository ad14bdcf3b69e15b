//! Step backend reached over HTTP
//!
//! Each step is one `POST {base_url}/{step}` with a JSON body; the response
//! body is the step result. A `null` extraction result means the page has
//! no text.

use super::backend::{SectionDraft, StepBackend};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("bookmill/", env!("CARGO_PKG_VERSION"));

pub struct HttpStepBackend {
    http_client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpStepBackend {
    /// `base_url` of `None` makes every step fail until configured
    pub fn new(base_url: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    async fn call<B, T>(&self, step: &str, body: &B) -> anyhow::Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let Some(base_url) = &self.base_url else {
            anyhow::bail!("step_backend_url is not configured");
        };
        let url = format!("{}/{}", base_url, step);
        debug!(url = %url, "Calling step backend");

        let response = self.http_client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("step backend returned {} for {}: {}", status, step, error_text);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl StepBackend for HttpStepBackend {
    async fn extract_page(&self, label: &str, page_id: &str) -> anyhow::Result<Option<Value>> {
        let text: Value = self
            .call("extract", &json!({ "label": label, "page_id": page_id }))
            .await?;
        Ok((!text.is_null()).then_some(text))
    }

    async fn extract_metadata(&self, label: &str, pages: &[(String, Value)]) -> anyhow::Result<Value> {
        let pages: Vec<Value> = pages
            .iter()
            .map(|(page_id, text)| json!({ "page_id": page_id, "text": text }))
            .collect();
        self.call("metadata", &json!({ "label": label, "pages": pages }))
            .await
    }

    async fn classify_page(&self, label: &str, page_id: &str, text: &Value) -> anyhow::Result<Value> {
        self.call(
            "classify",
            &json!({ "label": label, "page_id": page_id, "text": text }),
        )
        .await
    }

    async fn section_page(
        &self,
        label: &str,
        page_id: &str,
        classification: &Value,
    ) -> anyhow::Result<Vec<SectionDraft>> {
        self.call(
            "section",
            &json!({ "label": label, "page_id": page_id, "classification": classification }),
        )
        .await
    }

    async fn render_section(&self, label: &str, item_id: &str, section: &Value) -> anyhow::Result<Value> {
        self.call(
            "render",
            &json!({ "label": label, "item_id": item_id, "section": section }),
        )
        .await
    }
}
