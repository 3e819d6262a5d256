//! Build Orchestrator - single entry point for bundle builds.
//!
//! A build resolves the engine core, checks the target's cache record and
//! only aggregates and assembles when something the bundle depends on
//! changed. Builds of one target never overlap; a failed build leaves the
//! previous record in place.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::aggregator::{select_templates, template_identities, TemplateAggregator};
use crate::assembler::{Bundle, BundleAssembler};
use crate::cache::{CacheDecision, CacheKey, CacheStore, RebuildReason};
use crate::compiler::{BhModuleCompiler, TemplateCompiler};
use crate::config::BuildConfig;
use crate::engine::{CoreResolver, DefaultCore};
use crate::files::{FileList, FileSystem, OsFileSystem};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Engine core not found: {path:?}: {source}")]
    CoreNotFound {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Template compile error in {path:?}: {cause}")]
    TemplateCompile { path: PathBuf, cause: String },

    #[error("Assembly error: {0}")]
    Assembly(String),

    #[error("Cache record for {target:?} is corrupt: {reason}")]
    CacheCorruption { target: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One build invocation from the host.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Target identifier; cache records are scoped to it.
    pub target: String,
    pub files: FileList,
    pub config: BuildConfig,
}

impl BuildRequest {
    pub fn new(target: impl Into<String>, files: FileList, config: BuildConfig) -> Self {
        Self {
            target: target.into(),
            files,
            config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// The stored bundle was returned as is.
    Hit,
    Rebuilt(RebuildReason),
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub target: String,
    pub bundle: Bundle,
    pub cache: CacheStatus,
    /// Id of the cache record that holds this bundle.
    pub build_id: Option<Uuid>,
}

impl BuildOutput {
    pub fn cache_hit(&self) -> bool {
        self.cache == CacheStatus::Hit
    }
}

/// The build pipeline - wires resolver, aggregator, cache and assembler.
pub struct BundlePipeline {
    resolver: CoreResolver,
    compiler: Arc<dyn TemplateCompiler>,
    fs: Arc<dyn FileSystem>,
    assembler: BundleAssembler,
    cache: CacheStore,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BundlePipeline {
    /// Pipeline rooted at `root` with the embedded core, the BH module
    /// compiler, the OS file system and an in-memory cache.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            resolver: CoreResolver::new(root),
            compiler: Arc::new(BhModuleCompiler),
            fs: Arc::new(OsFileSystem),
            assembler: BundleAssembler::new(),
            cache: CacheStore::in_memory(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn TemplateCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_default_core(mut self, default_core: DefaultCore) -> Self {
        self.resolver = self.resolver.with_default_core(default_core);
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Build (or reuse) the bundle for `request.target`.
    ///
    /// A second call for a target that is already building waits for the
    /// first to finish, then checks the cache afresh.
    #[instrument(skip_all, fields(bundle = %request.target, files = request.files.len()))]
    pub fn build(&self, request: &BuildRequest) -> Result<BuildOutput, BuildError> {
        let lock = self.target_lock(&request.target);
        let result = {
            let _building = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.build_locked(request)
        };
        self.release_target_lock(&request.target, lock);
        result
    }

    fn build_locked(&self, request: &BuildRequest) -> Result<BuildOutput, BuildError> {
        let config = &request.config;
        let core = self.resolver.resolve(config.bh_file.as_deref(), self.fs.as_ref())?;
        let templates = select_templates(request.files.files(), &config.source_suffixes);
        let key = CacheKey {
            core_identity: core.identity.clone(),
            config_fingerprint: config.fingerprint()?,
            template_identities: template_identities(&templates),
        };

        let reason = match self.cache.lookup(&request.target, &key) {
            CacheDecision::Reuse(bundle) => {
                info!(templates = templates.len(), "bundle up to date, reusing cached build");
                return Ok(BuildOutput {
                    target: request.target.clone(),
                    bundle,
                    cache: CacheStatus::Hit,
                    build_id: None,
                });
            }
            CacheDecision::Rebuild(reason) => reason,
        };

        info!(%reason, core = %core.identity, templates = templates.len(), "rebuilding bundle");

        let aggregator = TemplateAggregator::new(
            self.resolver.root(),
            Arc::clone(&self.compiler),
            Arc::clone(&self.fs),
        );
        let aggregated = aggregator.aggregate(&templates)?;
        let bundle = self.assembler.assemble(&request.target, &core, &aggregated, config)?;
        let record = self.cache.commit(&request.target, &key, bundle.clone())?;

        info!(build_id = %record.build_id, bytes = bundle.text.len(), "bundle committed");

        Ok(BuildOutput {
            target: request.target.clone(),
            bundle,
            cache: CacheStatus::Rebuilt(reason),
            build_id: Some(record.build_id),
        })
    }

    fn target_lock(&self, target: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(target.to_string()).or_default())
    }

    /// Drop the registry entry once no other build holds or waits on it.
    fn release_target_lock(&self, target: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One count for the registry, one for `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(target);
        }
    }

    #[cfg(test)]
    fn tracked_targets(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for BundlePipeline {
    fn default() -> Self {
        Self::new(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn setup(template: &str) -> (tempfile::TempDir, FileList) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("blocks")).unwrap();
        std::fs::write(dir.path().join("blocks/block.bh.js"), template).unwrap();
        let files = FileList::load_from_dir(&dir.path().join("blocks")).unwrap();
        (dir, files)
    }

    #[test]
    fn first_build_misses_then_hits() {
        let (dir, files) = setup("module.exports = function (bh) {};");
        let pipeline = BundlePipeline::new(dir.path());
        let request = BuildRequest::new("bundle.bh.js", files, BuildConfig::default());

        let first = pipeline.build(&request).unwrap();
        assert_eq!(first.cache, CacheStatus::Rebuilt(RebuildReason::NoRecord));
        assert!(first.build_id.is_some());

        let second = pipeline.build(&request).unwrap();
        assert!(second.cache_hit());
        assert_eq!(first.bundle.text, second.bundle.text);
    }

    #[test]
    fn compile_error_keeps_previous_record() {
        let (dir, files) = setup("module.exports = function (bh) {};");
        let pipeline = BundlePipeline::new(dir.path());
        let request = BuildRequest::new("bundle.bh.js", files, BuildConfig::default());
        let good = pipeline.build(&request).unwrap();

        std::fs::write(dir.path().join("blocks/block.bh.js"), "module.exports = function (bh) {").unwrap();
        let mut broken = request.clone();
        broken.files = FileList::from_files(
            request
                .files
                .files()
                .iter()
                .map(|f| crate::files::TemplateFile::new(f.path.clone(), f.mtime + std::time::Duration::from_secs(5)))
                .collect(),
        );
        let err = pipeline.build(&broken).unwrap_err();
        assert!(matches!(err, BuildError::TemplateCompile { .. }));

        // The earlier inputs still hit the untouched record.
        let again = pipeline.build(&request).unwrap();
        assert!(again.cache_hit());
        assert_eq!(again.bundle, good.bundle);
    }

    #[test]
    fn missing_custom_core_is_an_error() {
        let (dir, files) = setup("module.exports = function (bh) {};");
        let pipeline = BundlePipeline::new(dir.path());
        let config = BuildConfig {
            bh_file: Some(Path::new("nope.js").to_path_buf()),
            ..BuildConfig::default()
        };
        let err = pipeline.build(&BuildRequest::new("t", files, config)).unwrap_err();
        assert!(matches!(err, BuildError::CoreNotFound { .. }));
    }

    #[test]
    fn target_locks_released_after_build() {
        let (dir, files) = setup("module.exports = function (bh) {};");
        let pipeline = BundlePipeline::new(dir.path());
        for target in ["a.bh.js", "b.bh.js", "c.bh.js"] {
            pipeline
                .build(&BuildRequest::new(target, files.clone(), BuildConfig::default()))
                .unwrap();
        }
        assert_eq!(pipeline.tracked_targets(), 0);

        let broken = BuildConfig { bh_file: Some(PathBuf::from("missing.js")), ..BuildConfig::default() };
        assert!(pipeline.build(&BuildRequest::new("d.bh.js", files, broken)).is_err());
        assert_eq!(pipeline.tracked_targets(), 0);
    }

    #[test]
    fn concurrent_builds_release_their_lock() {
        let (dir, files) = setup("module.exports = function (bh) {};");
        let pipeline = Arc::new(BundlePipeline::new(dir.path()));
        let request = BuildRequest::new("bundle.bh.js", files, BuildConfig::default());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let request = request.clone();
                std::thread::spawn(move || pipeline.build(&request).unwrap().cache_hit())
            })
            .collect();
        let hits: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(hits.iter().filter(|hit| !**hit).count(), 1);
        assert_eq!(pipeline.tracked_targets(), 0);
    }

    #[test]
    fn error_messages() {
        let err = BuildError::TemplateCompile {
            path: PathBuf::from("blocks/block.bh.js"),
            cause: "unclosed '{' from line 1".to_string(),
        };
        assert!(err.to_string().contains("blocks/block.bh.js"));
        assert!(BuildError::Assembly("x".into()).to_string().starts_with("Assembly error"));
    }
}
