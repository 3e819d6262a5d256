//! bhclient Core - incremental client bundle builder for BH templates
//!
//! Turns a list of template modules plus a template engine core into one
//! client-side script, and skips the work when nothing it depends on
//! changed since the last build of the same target.
//!
//! Change detection is keyed on identity tokens (mtimes), not content. A
//! file rewritten with the same mtime is not noticed.

pub mod files;
pub mod identity;
pub mod hashing;
pub mod config;
pub mod engine;
pub mod compiler;
pub mod aggregator;
pub mod cache;
pub mod sourcemap;
pub mod assembler;
pub mod pipeline;

pub use files::{FileList, FileSystem, OsFileSystem, TemplateFile};
pub use identity::Identity;
pub use config::{BuildConfig, JsAttrScheme, Mimic, SourceMapMode};
pub use engine::{CoreResolver, CoreSource, DefaultCore, EngineCore};
pub use compiler::{BhModuleCompiler, CompiledTemplate, TemplateCompiler};
pub use aggregator::{AggregatedTemplate, TemplateAggregator};
pub use cache::{CacheBackend, CacheRecord, CacheStore, DirBackend, MemoryBackend, RebuildReason};
pub use sourcemap::SourceMap;
pub use assembler::{Bundle, BundleAssembler};
pub use pipeline::{BuildError, BuildOutput, BuildRequest, BundlePipeline, CacheStatus};

pub const BUNDLER_VERSION: &str = env!("CARGO_PKG_VERSION");
