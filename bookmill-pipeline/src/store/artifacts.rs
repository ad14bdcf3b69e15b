//! Kind-routed facade over the database and file version chains

use super::{
    ArtifactKind, EditOutcome, FieldEdit, FileVersionChain, PageComposite, Payload, Version,
    VersionStore, VersionedPayload,
};
use bookmill_common::config::ValueDomains;
use bookmill_common::db::BookHandle;
use bookmill_common::Result;

/// All artifact versions of one open book
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    versions: VersionStore,
    files: FileVersionChain,
}

impl ArtifactStore {
    pub fn new(book: &BookHandle, lock_wait_ms: u64) -> Self {
        Self {
            versions: VersionStore::new(book, lock_wait_ms),
            files: FileVersionChain::new(book, lock_wait_ms),
        }
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    pub fn files(&self) -> &FileVersionChain {
        &self.files
    }

    pub async fn put(&self, kind: ArtifactKind, item_id: &str, version: Version, data: Payload) -> Result<()> {
        if kind.is_file_backed() {
            self.files.put(item_id, version, data).await
        } else {
            self.versions.put(kind, item_id, version, data).await
        }
    }

    pub async fn list_versions(&self, kind: ArtifactKind, item_id: &str) -> Result<Vec<Version>> {
        if kind.is_file_backed() {
            self.files.list_versions(item_id).await
        } else {
            self.versions.list_versions(kind, item_id).await
        }
    }

    pub async fn get_version(&self, kind: ArtifactKind, item_id: &str, version: Version) -> Result<Payload> {
        if kind.is_file_backed() {
            self.files.get_version(item_id, version).await
        } else {
            self.versions.get_version(kind, item_id, version).await
        }
    }

    pub async fn get_latest(&self, kind: ArtifactKind, item_id: &str) -> Result<Option<(Version, Payload)>> {
        if kind.is_file_backed() {
            self.files.get_latest(item_id).await
        } else {
            self.versions.get_latest(kind, item_id).await
        }
    }

    pub async fn get_current(&self, kind: ArtifactKind, item_id: &str) -> Result<Option<Version>> {
        if kind.is_file_backed() {
            self.files.get_current(item_id).await
        } else {
            self.versions.get_current(kind, item_id).await
        }
    }

    pub async fn set_current(&self, kind: ArtifactKind, item_id: &str, version: Version) -> Result<()> {
        if kind.is_file_backed() {
            self.files.set_current(item_id, version).await
        } else {
            self.versions.set_current(kind, item_id, version).await
        }
    }

    pub async fn read(
        &self,
        kind: ArtifactKind,
        item_id: &str,
        version: Option<Version>,
    ) -> Result<Option<VersionedPayload>> {
        if kind.is_file_backed() {
            self.files.read(item_id, version).await
        } else {
            self.versions.read(kind, item_id, version).await
        }
    }

    pub async fn append_version(&self, kind: ArtifactKind, item_id: &str, data: Payload) -> Result<Version> {
        if kind.is_file_backed() {
            self.files.append_version(item_id, data).await
        } else {
            self.versions.append_version(kind, item_id, data).await
        }
    }

    pub async fn edit(
        &self,
        kind: ArtifactKind,
        item_id: &str,
        edit: &FieldEdit,
        base_version: Option<Version>,
        domains: &ValueDomains,
    ) -> Result<EditOutcome> {
        if kind.is_file_backed() {
            self.files.edit(item_id, edit, base_version, domains).await
        } else {
            self.versions.edit(kind, item_id, edit, base_version, domains).await
        }
    }

    pub async fn read_page(&self, kind: ArtifactKind, page_id: &str) -> Result<Option<PageComposite>> {
        kind.require_page_scoped()?;
        if kind.is_file_backed() {
            self.files.read_page(page_id).await
        } else {
            self.versions.read_page(kind, page_id).await
        }
    }
}
