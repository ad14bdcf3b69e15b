//! Step executors

use super::backend::StepBackend;
use super::{CLASSIFY, EXTRACT, METADATA, RENDER, SECTION};
use crate::jobs::{ExecutorRegistry, Job, JobPatch, JobUpdater};
use crate::services::ImageIndex;
use crate::store::{ArtifactKind, ArtifactStore, Payload};
use anyhow::Context;
use bookmill_common::db::BookRegistry;
use bookmill_common::ids::{validate_item_id, validate_page_id};
use bookmill_common::Error;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Item id of the whole-book metadata chain
pub const METADATA_ITEM: &str = "book";

/// Shared dependencies of the step executors
#[derive(Clone)]
pub struct PipelineContext {
    pub books: Arc<BookRegistry>,
    pub backend: Arc<dyn StepBackend>,
    pub lock_wait_ms: u64,
}

/// Parameters common to every step
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct StepParams {
    /// Pages to process; empty means every page with a raster
    #[serde(default)]
    pub pages: Vec<String>,
}

impl StepParams {
    pub fn from_value(params: &Value) -> anyhow::Result<Self> {
        if params.is_null() {
            return Ok(Self::default());
        }
        let mut parsed: StepParams =
            serde_json::from_value(params.clone()).context("invalid job parameters")?;

        let mut seen = HashSet::new();
        parsed.pages.retain(|p| seen.insert(p.clone()));
        for page_id in &parsed.pages {
            validate_page_id(page_id)?;
        }
        Ok(parsed)
    }
}

/// Executor registry with every pipeline step
pub fn pipeline_executors(ctx: PipelineContext) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();

    let c = ctx.clone();
    registry.register(EXTRACT, move |job, updater| run_extract(c.clone(), job, updater));
    let c = ctx.clone();
    registry.register(METADATA, move |job, updater| run_metadata(c.clone(), job, updater));
    let c = ctx.clone();
    registry.register(CLASSIFY, move |job, updater| run_classify(c.clone(), job, updater));
    let c = ctx.clone();
    registry.register(SECTION, move |job, updater| run_section(c.clone(), job, updater));
    let c = ctx;
    registry.register(RENDER, move |job, updater| run_render(c.clone(), job, updater));

    registry
}

async fn prepare(ctx: &PipelineContext, job: &Job) -> anyhow::Result<(ArtifactStore, Vec<String>)> {
    let params = StepParams::from_value(&job.params)?;
    let book = ctx.books.open(&job.label).await?;
    let store = ArtifactStore::new(&book, ctx.lock_wait_ms);

    let pages = if params.pages.is_empty() {
        ImageIndex::new(&book, ctx.lock_wait_ms).page_ids().await?
    } else {
        params.pages
    };
    debug!(job_id = %job.id, label = %job.label, pages = pages.len(), "Step prepared");
    Ok((store, pages))
}

/// Run `work` unless the job is cancelled first
async fn guarded<T, F>(updater: &JobUpdater, work: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        _ = updater.cancellation_token().cancelled() => Err(cancelled(updater).into()),
        result = work => result,
    }
}

/// Stop before writing for a cancelled job
fn ensure_running(updater: &JobUpdater) -> anyhow::Result<()> {
    if updater.is_cancelled() {
        return Err(cancelled(updater).into());
    }
    Ok(())
}

fn cancelled(updater: &JobUpdater) -> Error {
    Error::Cancelled(format!("job {} cancelled", updater.job_id()))
}

fn summary(total: usize) -> Option<JobPatch> {
    Some(JobPatch::progress(json!({ "done": total, "total": total })))
}

async fn run_extract(ctx: PipelineContext, job: Job, updater: JobUpdater) -> anyhow::Result<Option<JobPatch>> {
    let (store, pages) = prepare(&ctx, &job).await?;
    let total = pages.len();

    for (i, page_id) in pages.iter().enumerate() {
        let text = guarded(&updater, ctx.backend.extract_page(&job.label, page_id))
            .await
            .with_context(|| format!("extraction failed for {}", page_id))?;

        ensure_running(&updater)?;
        let version = store
            .append_version(ArtifactKind::TextExtraction, page_id, text)
            .await?;
        store
            .set_current(ArtifactKind::TextExtraction, page_id, version)
            .await?;
        updater.progress(i + 1, total, page_id)?;
    }

    info!(job_id = %job.id, label = %job.label, pages = total, "Extraction finished");
    Ok(summary(total))
}

async fn run_metadata(ctx: PipelineContext, job: Job, updater: JobUpdater) -> anyhow::Result<Option<JobPatch>> {
    let (store, pages) = prepare(&ctx, &job).await?;

    let mut texts = Vec::new();
    for page_id in &pages {
        if let Some(text) = store
            .read(ArtifactKind::TextExtraction, page_id, None)
            .await?
            .and_then(|r| r.data)
        {
            texts.push((page_id.clone(), text));
        }
    }
    if texts.is_empty() {
        anyhow::bail!("no extracted text for book '{}'", job.label);
    }

    let metadata = guarded(&updater, ctx.backend.extract_metadata(&job.label, &texts))
        .await
        .context("metadata extraction failed")?;

    ensure_running(&updater)?;
    let version = store
        .append_version(ArtifactKind::Metadata, METADATA_ITEM, Some(metadata))
        .await?;
    updater.progress(1, 1, METADATA_ITEM)?;

    info!(job_id = %job.id, label = %job.label, version, "Metadata stored");
    Ok(summary(1))
}

async fn run_classify(ctx: PipelineContext, job: Job, updater: JobUpdater) -> anyhow::Result<Option<JobPatch>> {
    let (store, pages) = prepare(&ctx, &job).await?;
    let total = pages.len();

    for (i, page_id) in pages.iter().enumerate() {
        let text = store
            .read(ArtifactKind::TextExtraction, page_id, None)
            .await?
            .and_then(|r| r.data);

        let groups: Payload = match text {
            Some(text) => Some(
                guarded(&updater, ctx.backend.classify_page(&job.label, page_id, &text))
                    .await
                    .with_context(|| format!("classification failed for {}", page_id))?,
            ),
            None => None,
        };

        ensure_running(&updater)?;
        store
            .append_version(ArtifactKind::TextClassification, page_id, groups)
            .await?;
        updater.progress(i + 1, total, page_id)?;
    }

    info!(job_id = %job.id, label = %job.label, pages = total, "Classification finished");
    Ok(summary(total))
}

async fn run_section(ctx: PipelineContext, job: Job, updater: JobUpdater) -> anyhow::Result<Option<JobPatch>> {
    let (store, pages) = prepare(&ctx, &job).await?;
    let total = pages.len();

    for (i, page_id) in pages.iter().enumerate() {
        let classification = store
            .read(ArtifactKind::TextClassification, page_id, None)
            .await?
            .and_then(|r| r.data);

        if let Some(classification) = classification {
            let drafts = guarded(
                &updater,
                ctx.backend.section_page(&job.label, page_id, &classification),
            )
            .await
            .with_context(|| format!("sectioning failed for {}", page_id))?;

            ensure_running(&updater)?;
            let mut written = HashSet::new();
            for draft in drafts {
                let item_id = format!("{}_{}", page_id, draft.section_id);
                validate_item_id(&item_id)?;
                store
                    .append_version(ArtifactKind::Sectioning, &item_id, draft.data)
                    .await?;
                written.insert(item_id);
            }

            // Sections the backend no longer proposes are pruned
            for item_id in store.versions().page_items(ArtifactKind::Sectioning, page_id).await? {
                if written.contains(&item_id) {
                    continue;
                }
                if let Some((_, Some(_))) = store.get_latest(ArtifactKind::Sectioning, &item_id).await? {
                    store
                        .append_version(ArtifactKind::Sectioning, &item_id, None)
                        .await?;
                    debug!(label = %job.label, item_id = %item_id, "Section pruned");
                }
            }
        }

        updater.progress(i + 1, total, page_id)?;
    }

    info!(job_id = %job.id, label = %job.label, pages = total, "Sectioning finished");
    Ok(summary(total))
}

async fn run_render(ctx: PipelineContext, job: Job, updater: JobUpdater) -> anyhow::Result<Option<JobPatch>> {
    let (store, pages) = prepare(&ctx, &job).await?;
    let total = pages.len();

    for (i, page_id) in pages.iter().enumerate() {
        for item_id in store.versions().page_items(ArtifactKind::Sectioning, page_id).await? {
            let section = store
                .get_latest(ArtifactKind::Sectioning, &item_id)
                .await?
                .and_then(|(_, data)| data);

            let rendered: Payload = match section {
                Some(section) => Some(
                    guarded(&updater, ctx.backend.render_section(&job.label, &item_id, &section))
                        .await
                        .with_context(|| format!("rendering failed for {}", item_id))?,
                ),
                None => match store.get_latest(ArtifactKind::Rendering, &item_id).await? {
                    Some((_, Some(_))) => None,
                    _ => continue,
                },
            };

            ensure_running(&updater)?;
            let version = store
                .append_version(ArtifactKind::Rendering, &item_id, rendered)
                .await?;
            store
                .set_current(ArtifactKind::Rendering, &item_id, version)
                .await?;
        }
        updater.progress(i + 1, total, page_id)?;
    }

    info!(job_id = %job.id, label = %job.label, pages = total, "Rendering finished");
    Ok(summary(total))
}
