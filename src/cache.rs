//! Cache Store - per-target records of what the last good bundle was built from.
//!
//! Reads are fail-safe: a missing, unreadable or malformed record is a miss
//! and forces a full rebuild. Records for different targets never mix.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregator::TemplateIdentities;
use crate::assembler::Bundle;
use crate::hashing::{hex_encode, sha256_hex};
use crate::identity::Identity;
use crate::pipeline::BuildError;
use crate::BUNDLER_VERSION;

/// Bumped whenever the record layout changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const MAX_HEX_NAME: usize = 200;

/// Everything a cached bundle depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub core_identity: Identity,
    pub config_fingerprint: String,
    pub template_identities: TemplateIdentities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub format_version: u32,
    pub bundler_version: String,
    pub target: String,
    pub core_identity: Identity,
    pub config_fingerprint: String,
    pub template_identities: TemplateIdentities,
    pub built_at: DateTime<Utc>,
    pub build_id: Uuid,
    pub bundle: Bundle,
}

impl CacheRecord {
    pub fn new(target: &str, key: &CacheKey, bundle: Bundle) -> Self {
        Self {
            format_version: CACHE_FORMAT_VERSION,
            bundler_version: BUNDLER_VERSION.to_string(),
            target: target.to_string(),
            core_identity: key.core_identity.clone(),
            config_fingerprint: key.config_fingerprint.clone(),
            template_identities: key.template_identities.clone(),
            built_at: Utc::now(),
            build_id: Uuid::new_v4(),
            bundle,
        }
    }

    /// Records written by another format or another major.minor release
    /// are not trusted.
    pub fn is_compatible(&self) -> bool {
        if self.format_version != CACHE_FORMAT_VERSION {
            return false;
        }
        match (
            semver::Version::parse(&self.bundler_version),
            semver::Version::parse(BUNDLER_VERSION),
        ) {
            (Ok(stored), Ok(current)) => stored.major == current.major && stored.minor == current.minor,
            _ => false,
        }
    }

    /// Why this record cannot serve `key`, or `None` if it can.
    pub fn mismatch(&self, key: &CacheKey) -> Option<RebuildReason> {
        if self.core_identity != key.core_identity {
            return Some(RebuildReason::CoreChanged);
        }
        if self.config_fingerprint != key.config_fingerprint {
            return Some(RebuildReason::ConfigChanged);
        }
        let changes = TemplateChanges::between(&self.template_identities, &key.template_identities);
        if !changes.is_empty() {
            return Some(RebuildReason::TemplatesChanged(changes));
        }
        None
    }
}

/// Added, removed and touched template paths between two builds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateChanges {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
}

impl TemplateChanges {
    pub fn between(previous: &TemplateIdentities, current: &TemplateIdentities) -> Self {
        let mut changes = Self::default();
        for (path, identity) in current {
            match previous.get(path) {
                Some(old) if old == identity => {}
                Some(_) => changes.modified.push(path.clone()),
                None => changes.added.push(path.clone()),
            }
        }
        changes.removed = previous
            .keys()
            .filter(|p| !current.contains_key(*p))
            .cloned()
            .collect();
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    NoRecord,
    Corrupt,
    IncompatibleRecord,
    CoreChanged,
    ConfigChanged,
    TemplatesChanged(TemplateChanges),
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::NoRecord => write!(f, "no cached build"),
            RebuildReason::Corrupt => write!(f, "cached record unreadable"),
            RebuildReason::IncompatibleRecord => write!(f, "cached record from another version"),
            RebuildReason::CoreChanged => write!(f, "engine core changed"),
            RebuildReason::ConfigChanged => write!(f, "build options changed"),
            RebuildReason::TemplatesChanged(c) => write!(
                f,
                "templates changed ({} added, {} removed, {} modified)",
                c.added.len(),
                c.removed.len(),
                c.modified.len()
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CacheDecision {
    Reuse(Bundle),
    Rebuild(RebuildReason),
}

/// Host-provided keyed storage that survives between builds.
pub trait CacheBackend: Send + Sync {
    fn load(&self, target: &str) -> Result<Option<Vec<u8>>, BuildError>;
    /// Replace the stored bytes for `target` in one step.
    fn store(&self, target: &str, bytes: &[u8]) -> Result<(), BuildError>;
    fn remove(&self, target: &str) -> Result<(), BuildError>;
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self, target: &str) -> Result<Option<Vec<u8>>, BuildError> {
        Ok(self.entries().get(target).cloned())
    }

    fn store(&self, target: &str, bytes: &[u8]) -> Result<(), BuildError> {
        self.entries().insert(target.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, target: &str) -> Result<(), BuildError> {
        self.entries().remove(target);
        Ok(())
    }
}

/// One JSON file per target under a directory. File names are the
/// hex-encoded target name, so no two targets share a file.
#[derive(Debug, Clone)]
pub struct DirBackend {
    dir: PathBuf,
}

impl DirBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, target: &str) -> PathBuf {
        let mut name = hex_encode(target);
        // Keep under common file-name limits; the record's own target
        // field still guards against a digest collision.
        if name.len() > MAX_HEX_NAME {
            name = sha256_hex(target.as_bytes());
        }
        self.dir.join(format!("{}.json", name))
    }
}

impl CacheBackend for DirBackend {
    fn load(&self, target: &str) -> Result<Option<Vec<u8>>, BuildError> {
        let path = self.record_path(target);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildError::Io { path, source: e }),
        }
    }

    fn store(&self, target: &str, bytes: &[u8]) -> Result<(), BuildError> {
        fs::create_dir_all(&self.dir).map_err(|e| BuildError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        let path = self.record_path(target);
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, bytes).map_err(|e| BuildError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            BuildError::Io { path, source: e }
        })
    }

    fn remove(&self, target: &str) -> Result<(), BuildError> {
        let path = self.record_path(target);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::Io { path, source: e }),
        }
    }
}

#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Load the record for `target`.
    ///
    /// Unreadable or malformed records come back as
    /// [`BuildError::CacheCorruption`].
    pub fn load_record(&self, target: &str) -> Result<Option<CacheRecord>, BuildError> {
        let corrupt = |reason: String| BuildError::CacheCorruption {
            target: target.to_string(),
            reason,
        };
        let bytes = match self.backend.load(target) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => return Err(corrupt(e.to_string())),
        };
        let record: CacheRecord = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        if record.target != target {
            return Err(corrupt(format!("record belongs to target {:?}", record.target)));
        }
        Ok(Some(record))
    }

    /// Decide whether the stored bundle for `target` can be reused.
    pub fn lookup(&self, target: &str, key: &CacheKey) -> CacheDecision {
        let record = match self.load_record(target) {
            Ok(Some(record)) => record,
            Ok(None) => return CacheDecision::Rebuild(RebuildReason::NoRecord),
            Err(e) => {
                warn!(bundle = target, error = %e, "ignoring corrupt cache record");
                return CacheDecision::Rebuild(RebuildReason::Corrupt);
            }
        };
        if !record.is_compatible() {
            return CacheDecision::Rebuild(RebuildReason::IncompatibleRecord);
        }
        match record.mismatch(key) {
            Some(reason) => CacheDecision::Rebuild(reason),
            None => {
                debug!(bundle = target, build_id = %record.build_id, "cache record matches");
                CacheDecision::Reuse(record.bundle)
            }
        }
    }

    pub fn should_rebuild(&self, target: &str, key: &CacheKey) -> bool {
        matches!(self.lookup(target, key), CacheDecision::Rebuild(_))
    }

    /// Replace the record for `target` after a successful build.
    pub fn commit(&self, target: &str, key: &CacheKey, bundle: Bundle) -> Result<CacheRecord, BuildError> {
        let record = CacheRecord::new(target, key, bundle);
        let bytes = serde_json::to_vec(&record)?;
        self.backend.store(target, &bytes)?;
        Ok(record)
    }

    pub fn invalidate(&self, target: &str) -> Result<(), BuildError> {
        self.backend.remove(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(core: i64, templates: &[(&str, i64)]) -> CacheKey {
        CacheKey {
            core_identity: Identity::Mtime(core),
            config_fingerprint: "cfg".to_string(),
            template_identities: templates
                .iter()
                .map(|(p, m)| (PathBuf::from(p), Identity::Mtime(*m)))
                .collect(),
        }
    }

    fn bundle(text: &str) -> Bundle {
        Bundle { text: text.to_string(), source_map: None }
    }

    #[test]
    fn miss_without_record() {
        let store = CacheStore::in_memory();
        assert!(store.should_rebuild("bundle", &key(1, &[])));
    }

    #[test]
    fn hit_after_commit() {
        let store = CacheStore::in_memory();
        let k = key(1, &[("a.bh.js", 10)]);
        store.commit("bundle", &k, bundle("text")).unwrap();
        match store.lookup("bundle", &k) {
            CacheDecision::Reuse(b) => assert_eq!(b.text, "text"),
            other => panic!("expected reuse, got {:?}", other),
        }
    }

    #[test]
    fn core_change_forces_rebuild() {
        let store = CacheStore::in_memory();
        store.commit("bundle", &key(1, &[]), bundle("x")).unwrap();
        assert!(matches!(
            store.lookup("bundle", &key(2, &[])),
            CacheDecision::Rebuild(RebuildReason::CoreChanged)
        ));
    }

    #[test]
    fn config_change_forces_rebuild() {
        let store = CacheStore::in_memory();
        let k = key(1, &[]);
        store.commit("bundle", &k, bundle("x")).unwrap();
        let other = CacheKey { config_fingerprint: "other".to_string(), ..k };
        assert!(matches!(
            store.lookup("bundle", &other),
            CacheDecision::Rebuild(RebuildReason::ConfigChanged)
        ));
    }

    #[test]
    fn template_changes_detected() {
        let store = CacheStore::in_memory();
        store
            .commit("bundle", &key(1, &[("a.bh.js", 1), ("b.bh.js", 1)]), bundle("x"))
            .unwrap();

        let decision = store.lookup("bundle", &key(1, &[("a.bh.js", 2), ("c.bh.js", 1)]));
        match decision {
            CacheDecision::Rebuild(RebuildReason::TemplatesChanged(c)) => {
                assert_eq!(c.modified, vec![PathBuf::from("a.bh.js")]);
                assert_eq!(c.added, vec![PathBuf::from("c.bh.js")]);
                assert_eq!(c.removed, vec![PathBuf::from("b.bh.js")]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn targets_are_isolated() {
        let store = CacheStore::in_memory();
        let k = key(1, &[]);
        store.commit("a", &k, bundle("a")).unwrap();
        assert!(store.should_rebuild("b", &k));
        assert!(!store.should_rebuild("a", &k));
    }

    #[test]
    fn corrupt_record_is_a_miss() {
        let backend = Arc::new(MemoryBackend::new());
        backend.store("bundle", b"not json {{{").unwrap();
        let store = CacheStore::new(backend);
        assert!(matches!(
            store.lookup("bundle", &key(1, &[])),
            CacheDecision::Rebuild(RebuildReason::Corrupt)
        ));
        assert!(matches!(
            store.load_record("bundle"),
            Err(BuildError::CacheCorruption { .. })
        ));
    }

    #[test]
    fn record_under_wrong_target_is_corrupt() {
        let backend = Arc::new(MemoryBackend::new());
        let record = CacheRecord::new("a", &key(1, &[]), bundle("a"));
        backend.store("b", &serde_json::to_vec(&record).unwrap()).unwrap();
        let store = CacheStore::new(backend);
        assert!(store.load_record("b").is_err());
    }

    #[test]
    fn incompatible_version_is_a_miss() {
        let backend = Arc::new(MemoryBackend::new());
        let k = key(1, &[]);
        let mut record = CacheRecord::new("bundle", &k, bundle("x"));
        record.bundler_version = "0.0.1".to_string();
        backend.store("bundle", &serde_json::to_vec(&record).unwrap()).unwrap();
        let store = CacheStore::new(backend);
        assert!(matches!(
            store.lookup("bundle", &k),
            CacheDecision::Rebuild(RebuildReason::IncompatibleRecord)
        ));
    }

    #[test]
    fn dir_backend_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(Arc::new(DirBackend::new(dir.path().join("cache"))));
        let k = key(1, &[("blocks/a.bh.js", 3)]);

        store.commit("bundle/bundle.bh.js", &k, bundle("text")).unwrap();
        assert!(!store.should_rebuild("bundle/bundle.bh.js", &k));

        store.invalidate("bundle/bundle.bh.js").unwrap();
        assert!(store.should_rebuild("bundle/bundle.bh.js", &k));
    }

    #[test]
    fn dir_backend_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirBackend::new(dir.path());
        backend.store("t", b"one").unwrap();
        backend.store("t", b"two").unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", hex_encode("t"))]);
        assert_eq!(backend.load("t").unwrap().unwrap(), b"two");
    }
}
