//! In-memory metadata store: file entries, manifests, version chains, and
//! the trash lifecycle.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{topics, InMemoryBus, MessageEnvelope};

use super::types::{FileEntry, FileManifest, FileVersion};
use super::WallClock;

pub struct MetadataStore {
    files: DashMap<String, FileEntry>,
    manifests: DashMap<String, FileManifest>,
    current_manifests: DashMap<String, String>,
    versions: DashMap<String, Vec<FileVersion>>,
    bus: Option<Arc<InMemoryBus>>,
    clock: WallClock,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            manifests: DashMap::new(),
            current_manifests: DashMap::new(),
            versions: DashMap::new(),
            bus: None,
            clock: super::system_clock(),
        }
    }

    pub fn with_bus(mut self, bus: Arc<InMemoryBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> chrono::DateTime<Utc> {
        (self.clock)()
    }

    // Manifests ----------------------------------------------------------

    pub fn register_manifest(&self, manifest: FileManifest) {
        debug!(manifest_id = %manifest.manifest_id, "manifest registered");
        self.current_manifests
            .insert(manifest.file_id.clone(), manifest.manifest_id.clone());
        self.manifests
            .insert(manifest.manifest_id.clone(), manifest);
    }

    pub fn upsert_manifest(&self, manifest: FileManifest) {
        self.current_manifests
            .insert(manifest.file_id.clone(), manifest.manifest_id.clone());
        self.manifests
            .insert(manifest.manifest_id.clone(), manifest);
    }

    /// Current manifest for a file id.
    pub fn manifest_for_file(&self, file_id: &str) -> Option<FileManifest> {
        let manifest_id = self.current_manifests.get(file_id)?.clone();
        self.manifests.get(&manifest_id).map(|m| m.clone())
    }

    pub fn manifest(&self, manifest_id: &str) -> Option<FileManifest> {
        self.manifests.get(manifest_id).map(|m| m.clone())
    }

    pub fn list_manifests(&self) -> Vec<FileManifest> {
        let mut manifests: Vec<FileManifest> =
            self.manifests.iter().map(|m| m.value().clone()).collect();
        manifests.sort_by(|a, b| a.manifest_id.cmp(&b.manifest_id));
        manifests
    }

    // File entries -------------------------------------------------------

    pub fn create_folder(
        &self,
        org_id: &str,
        parent_id: Option<&str>,
        name: &str,
        created_by: &str,
    ) -> FileEntry {
        let now = self.now();
        let entry = FileEntry {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            parent_id: parent_id.map(String::from),
            name: name.to_string(),
            mime_type: "application/vnd.dir".to_string(),
            size_bytes: 0,
            checksum: None,
            is_folder: true,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
            labels: Vec::new(),
        };
        self.files.insert(entry.id.clone(), entry.clone());
        entry
    }

    #[allow(clippy::too_many_arguments)]
    pub fn ensure_file_entry(
        &self,
        file_id: &str,
        org_id: &str,
        parent_id: Option<&str>,
        name: &str,
        mime_type: &str,
        size_bytes: u64,
        created_by: &str,
        checksum: Option<String>,
    ) -> FileEntry {
        let now = self.now();
        let mut entry = self
            .files
            .entry(file_id.to_string())
            .or_insert_with(|| FileEntry {
                id: file_id.to_string(),
                org_id: org_id.to_string(),
                parent_id: parent_id.map(String::from),
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                size_bytes,
                checksum: checksum.clone(),
                is_folder: false,
                created_by: created_by.to_string(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
                deleted_by: None,
                labels: Vec::new(),
            });
        let entry_mut = entry.value_mut();
        entry_mut.size_bytes = size_bytes;
        entry_mut.checksum = checksum;
        entry_mut.updated_at = now;
        if !name.is_empty() {
            entry_mut.name = name.to_string();
        }
        if let Some(parent) = parent_id {
            entry_mut.parent_id = Some(parent.to_string());
        }
        if !mime_type.is_empty() {
            entry_mut.mime_type = mime_type.to_string();
        }
        entry_mut.deleted_at = None;
        entry_mut.deleted_by = None;
        entry_mut.clone()
    }

    pub fn file(&self, file_id: &str) -> Option<FileEntry> {
        let entry = self.files.get(file_id)?;
        if entry.deleted_at.is_some() {
            return None;
        }
        Some(entry.clone())
    }

    pub fn list_children(&self, parent_id: Option<&str>) -> Vec<FileEntry> {
        let mut children: Vec<FileEntry> = self
            .files
            .iter()
            .filter(|e| e.parent_id.as_deref() == parent_id && e.deleted_at.is_none())
            .map(|e| e.value().clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    pub fn list_recent_files(&self, limit: usize, include_folders: bool) -> Vec<FileEntry> {
        let mut entries: Vec<FileEntry> = self
            .files
            .iter()
            .filter(|e| e.deleted_at.is_none() && (include_folders || !e.is_folder))
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        entries.truncate(limit);
        entries
    }

    // Versions -----------------------------------------------------------

    pub fn record_version(
        &self,
        file_id: &str,
        manifest_id: &str,
        size_bytes: u64,
        actor: &str,
        change_summary: Option<&str>,
    ) -> FileVersion {
        let mut versions = self.versions.entry(file_id.to_string()).or_default();
        let parent = versions.last();
        let version = FileVersion {
            version_id: Uuid::new_v4().to_string(),
            file_id: file_id.to_string(),
            manifest_id: manifest_id.to_string(),
            version_number: parent.map(|p| p.version_number + 1).unwrap_or(1),
            created_by: actor.to_string(),
            created_at: self.now(),
            size_bytes,
            parent_version_id: parent.map(|p| p.version_id.clone()),
            change_summary: change_summary.map(String::from),
            autosave: false,
            is_pinned: false,
            label: None,
        };
        versions.push(version.clone());
        version
    }

    pub fn list_versions(&self, file_id: &str) -> Vec<FileVersion> {
        let mut versions = self
            .versions
            .get(file_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        versions.sort_by(|a, b| b.version_number.cmp(&a.version_number));
        versions
    }

    pub fn version(&self, file_id: &str, version_id: &str) -> Option<FileVersion> {
        self.versions
            .get(file_id)?
            .iter()
            .find(|v| v.version_id == version_id)
            .cloned()
    }

    /// Point the file back at an older manifest, recording the restore as a
    /// new version.
    pub fn restore_version(
        &self,
        file_id: &str,
        version_id: &str,
        actor: &str,
    ) -> Option<FileVersion> {
        let target = self.version(file_id, version_id)?;
        self.current_manifests
            .insert(file_id.to_string(), target.manifest_id.clone());
        Some(self.record_version(
            file_id,
            &target.manifest_id,
            target.size_bytes,
            actor,
            Some(&format!("restore:{version_id}")),
        ))
    }

    // Trash --------------------------------------------------------------

    pub fn delete_file(&self, file_id: &str, actor: &str) -> Option<FileEntry> {
        let mut entry = self.files.get_mut(file_id)?;
        if entry.deleted_at.is_none() {
            entry.deleted_at = Some(self.now());
            entry.deleted_by = Some(actor.to_string());
        }
        Some(entry.clone())
    }

    pub fn restore_file(&self, file_id: &str, target_parent: Option<&str>) -> Option<FileEntry> {
        let mut entry = self.files.get_mut(file_id)?;
        entry.deleted_at = None;
        entry.deleted_by = None;
        if let Some(parent) = target_parent {
            entry.parent_id = Some(parent.to_string());
        }
        entry.updated_at = self.now();
        Some(entry.clone())
    }

    pub fn list_trashed(&self) -> Vec<FileEntry> {
        let mut trashed: Vec<FileEntry> = self
            .files
            .iter()
            .filter(|e| e.deleted_at.is_some())
            .map(|e| e.value().clone())
            .collect();
        trashed.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at).then(a.id.cmp(&b.id)));
        trashed
    }

    /// Drop trashed entries older than the retention window, along with
    /// their manifests and version chains. Publishes `trash.expired`.
    pub fn purge_expired_trash(&self, retention_days: i64) -> Vec<String> {
        if retention_days <= 0 {
            return Vec::new();
        }
        let cutoff = self.now() - Duration::days(retention_days);
        let expired: Vec<String> = self
            .files
            .iter()
            .filter(|e| e.deleted_at.map(|d| d < cutoff).unwrap_or(false))
            .map(|e| e.id.clone())
            .collect();
        for file_id in &expired {
            self.files.remove(file_id);
            self.current_manifests.remove(file_id);
            self.versions.remove(file_id);
            let stale: Vec<String> = self
                .manifests
                .iter()
                .filter(|m| m.file_id == *file_id)
                .map(|m| m.manifest_id.clone())
                .collect();
            for manifest_id in stale {
                self.manifests.remove(&manifest_id);
            }
        }
        if !expired.is_empty() {
            if let Some(bus) = &self.bus {
                bus.publish(MessageEnvelope::new(
                    topics::TRASH_EXPIRED,
                    serde_json::json!({ "file_ids": expired }),
                ));
            }
        }
        expired
    }

    pub fn snapshot_stats(&self) -> (usize, usize) {
        (self.files.len(), self.manifests.len())
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ManifestSegment;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn manifest(id: &str, file_id: &str) -> FileManifest {
        FileManifest {
            manifest_id: id.to_string(),
            file_id: file_id.to_string(),
            total_size: 1024,
            segments: vec![ManifestSegment {
                node_id: "n1".to_string(),
                file_id: format!("{id}-seg0"),
                offset: 0,
                length: 1024,
                checksum: None,
                storage_tier: "hot".to_string(),
                zone: None,
                encrypted: false,
            }],
            encryption: None,
            durability: None,
        }
    }

    #[test]
    fn manifest_upsert_tracks_current() {
        let store = MetadataStore::new();
        store.register_manifest(manifest("m1", "f1"));
        store.upsert_manifest(manifest("m2", "f1"));
        assert_eq!(store.manifest_for_file("f1").unwrap().manifest_id, "m2");
        assert_eq!(store.list_manifests().len(), 2);
    }

    #[test]
    fn ensure_file_entry_is_upsert() {
        let store = MetadataStore::new();
        let first = store.ensure_file_entry(
            "f1", "org", None, "a.txt", "text/plain", 10, "user", None,
        );
        assert_eq!(first.size_bytes, 10);
        let second = store.ensure_file_entry(
            "f1", "org", Some("folder"), "a.txt", "text/plain", 20, "user", None,
        );
        assert_eq!(second.size_bytes, 20);
        assert_eq!(second.parent_id.as_deref(), Some("folder"));
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn version_chain_increments() {
        let store = MetadataStore::new();
        let v1 = store.record_version("f1", "m1", 10, "alice", Some("upload"));
        let v2 = store.record_version("f1", "m2", 20, "alice", Some("edit"));
        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);
        assert_eq!(v2.parent_version_id.as_deref(), Some(v1.version_id.as_str()));

        let listed = store.list_versions("f1");
        assert_eq!(listed[0].version_number, 2);
    }

    #[test]
    fn restore_version_repoints_manifest() {
        let store = MetadataStore::new();
        store.register_manifest(manifest("m1", "f1"));
        let v1 = store.record_version("f1", "m1", 10, "alice", None);
        store.register_manifest(manifest("m2", "f1"));
        store.record_version("f1", "m2", 20, "alice", None);

        let restored = store.restore_version("f1", &v1.version_id, "bob").unwrap();
        assert_eq!(restored.version_number, 3);
        assert_eq!(store.manifest_for_file("f1").unwrap().manifest_id, "m1");
    }

    #[test]
    fn trash_lifecycle_soft_deletes_then_purges() {
        let fake_now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let clock_now = Arc::clone(&fake_now);
        let bus = Arc::new(InMemoryBus::new());
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        bus.subscribe(topics::TRASH_EXPIRED, Box::new(move |_| *sink.lock() += 1));

        let store = MetadataStore::new()
            .with_bus(Arc::clone(&bus))
            .with_clock(Arc::new(move || *clock_now.lock()));
        store.ensure_file_entry("f1", "org", None, "a.txt", "text/plain", 10, "user", None);
        store.register_manifest(manifest("m1", "f1"));

        store.delete_file("f1", "user");
        assert!(store.file("f1").is_none());
        assert_eq!(store.list_trashed().len(), 1);

        // Nothing purges inside the retention window.
        assert!(store.purge_expired_trash(30).is_empty());

        *fake_now.lock() = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let purged = store.purge_expired_trash(30);
        assert_eq!(purged, vec!["f1".to_string()]);
        assert!(store.manifest_for_file("f1").is_none());
        assert_eq!(*seen.lock(), 1);
    }
}
