//! bhclient CLI - build client bundles from BH template directories
//!
//! Commands: build, inspect-cache
//! Outputs JSON to stdout (bundle text included without --out), logs to stderr
//! Returns 2 on build failure

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use bhclient_core::{
    BuildConfig, BuildRequest, BundlePipeline, CacheStatus, CacheStore, DirBackend, FileList,
    SourceMapMode,
};

#[derive(Parser)]
#[command(name = "bhclient-cli")]
#[command(about = "bhclient CLI - incremental BH client bundle builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding per-target cache records
    #[arg(short, long, default_value = ".bhclient-cache", global = true)]
    cache_dir: PathBuf,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or reuse) a bundle
    Build {
        /// Target name, e.g. bundle/bundle.bh.js
        #[arg(short, long)]
        target: String,

        /// Directory scanned for template sources
        #[arg(short, long, default_value = "blocks")]
        blocks: PathBuf,

        /// Build root; bhFile is resolved against it
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// JSON file with build options
        #[arg(long)]
        config: Option<PathBuf>,

        /// Inline JSON build options, applied over --config
        #[arg(long)]
        options: Option<String>,

        /// Where to write the bundle (and `<out>.map` for external maps)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show the cache record stored for a target
    InspectCache {
        #[arg(short, long)]
        target: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cache = CacheStore::new(Arc::new(DirBackend::new(&cli.cache_dir)));

    match cli.command {
        Commands::Build { target, blocks, root, config, options, out } => {
            let config = match load_config(config.as_deref(), options.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    println!("{}", serde_json::json!({ "success": false, "error": e }));
                    return ExitCode::FAILURE;
                }
            };

            let files = match FileList::load_from_dir(&root.join(&blocks)) {
                Ok(f) => f.relative_to(&root),
                Err(e) => {
                    let error = format!("Failed to list {}: {}", blocks.display(), e);
                    println!("{}", serde_json::json!({ "success": false, "error": error }));
                    return ExitCode::FAILURE;
                }
            };

            let sourcemap_mode = config.sourcemap_mode;
            let pipeline = BundlePipeline::new(root).with_cache(cache);
            let request = BuildRequest::new(target, files, config);

            let output = match pipeline.build(&request) {
                Ok(output) => output,
                Err(e) => {
                    let report = serde_json::json!({
                        "success": false,
                        "target": request.target,
                        "error": e.to_string(),
                    });
                    println!("{}", report);
                    return ExitCode::from(2);
                }
            };

            if let Some(out) = &out {
                if let Err(e) = write_outputs(out, &output.bundle, sourcemap_mode) {
                    println!("{}", serde_json::json!({ "success": false, "error": e }));
                    return ExitCode::FAILURE;
                }
            }

            let reason = match &output.cache {
                CacheStatus::Hit => None,
                CacheStatus::Rebuilt(reason) => Some(reason.to_string()),
            };
            let inline_bundle = out.is_none().then(|| output.bundle.text.as_str());
            let report = serde_json::json!({
                "success": true,
                "target": output.target,
                "cacheHit": output.cache_hit(),
                "reason": reason,
                "buildId": output.build_id,
                "bytes": output.bundle.text.len(),
                "sourceMap": output.bundle.source_map.is_some(),
                "out": out,
                "bundle": inline_bundle,
            });
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            ExitCode::SUCCESS
        }

        Commands::InspectCache { target } => match cache.load_record(&target) {
            Ok(Some(record)) => {
                let summary = serde_json::json!({
                    "target": record.target,
                    "buildId": record.build_id,
                    "builtAt": record.built_at,
                    "bundlerVersion": record.bundler_version,
                    "coreIdentity": record.core_identity,
                    "templates": record.template_identities,
                    "bytes": record.bundle.text.len(),
                    "compatible": record.is_compatible(),
                });
                println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
                ExitCode::SUCCESS
            }
            Ok(None) => {
                println!("{}", serde_json::json!({ "target": target, "record": null }));
                ExitCode::SUCCESS
            }
            Err(e) => {
                println!("{}", serde_json::json!({ "target": target, "error": e.to_string() }));
                ExitCode::from(2)
            }
        },
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `--config` file first, then `--options` keys layered on top.
fn load_config(path: Option<&Path>, inline: Option<&str>) -> Result<BuildConfig, String> {
    let mut value = match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
            serde_json::from_str::<serde_json::Value>(&content)
                .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?
        }
        None => serde_json::json!({}),
    };

    if let Some(inline) = inline {
        let overrides: serde_json::Value =
            serde_json::from_str(inline).map_err(|e| format!("Invalid options: {}", e))?;
        match (value.as_object_mut(), overrides) {
            (Some(base), serde_json::Value::Object(extra)) => base.extend(extra),
            _ => return Err("Config and options must be JSON objects".to_string()),
        }
    }

    serde_json::from_value(value).map_err(|e| format!("Invalid build options: {}", e))
}

fn write_outputs(
    out: &Path,
    bundle: &bhclient_core::Bundle,
    mode: SourceMapMode,
) -> Result<(), String> {
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    fs::write(out, &bundle.text).map_err(|e| format!("Failed to write {}: {}", out.display(), e))?;

    // The bundle's trailing comment names the map after the target, so the
    // map goes next to `out` under that name.
    if let (Some(map), SourceMapMode::External) = (&bundle.source_map, mode) {
        let map_path = out.with_file_name(map.map_file_name());
        let json = map.to_json().map_err(|e| e.to_string())?;
        fs::write(&map_path, json)
            .map_err(|e| format!("Failed to write {}: {}", map_path.display(), e))?;
    }
    Ok(())
}
