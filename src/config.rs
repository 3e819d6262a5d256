//! Build configuration - supplied fresh for every build, never persisted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::hashing::compute_fingerprint;

pub const DEFAULT_JS_ATTR_NAME: &str = "data-bem";
pub const DEFAULT_SOURCE_SUFFIX: &str = "bh.js";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Custom engine core, relative to the build root. Unset means the
    /// built-in core.
    #[serde(default)]
    pub bh_file: Option<PathBuf>,
    #[serde(default = "default_js_attr_name")]
    pub js_attr_name: String,
    #[serde(default)]
    pub js_attr_scheme: JsAttrScheme,
    #[serde(default)]
    pub mimic: Mimic,
    /// Identifier -> JS source expression, exposed to templates as `bh.lib.<id>`.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub sourcemap: bool,
    #[serde(default)]
    pub sourcemap_mode: SourceMapMode,
    #[serde(default = "default_source_suffixes")]
    pub source_suffixes: Vec<String>,
}

fn default_js_attr_name() -> String { DEFAULT_JS_ATTR_NAME.to_string() }

fn default_source_suffixes() -> Vec<String> { vec![DEFAULT_SOURCE_SUFFIX.to_string()] }

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            bh_file: None,
            js_attr_name: default_js_attr_name(),
            js_attr_scheme: JsAttrScheme::default(),
            mimic: Mimic::default(),
            dependencies: BTreeMap::new(),
            sourcemap: false,
            sourcemap_mode: SourceMapMode::default(),
            source_suffixes: default_source_suffixes(),
        }
    }
}

impl BuildConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Fingerprint of every option that shapes the bundle text.
    ///
    /// `bh_file` is left out: the core is tracked by its own identity.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let options = BuildConfig { bh_file: None, ..self.clone() };
        compute_fingerprint(&options)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("invalid config {path:?}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

/// Encoding of the per-element jsAttr value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsAttrScheme {
    /// `{"block":{}}`
    #[default]
    Json,
    /// `return {"block":{}}`
    Js,
}

impl JsAttrScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            JsAttrScheme::Json => "json",
            JsAttrScheme::Js => "js",
        }
    }
}

/// Extra global names for the compiled engine. Accepts a single string or
/// a list of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mimic {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl Mimic {
    pub fn names(&self) -> Vec<&str> {
        match self {
            Mimic::None => vec![],
            Mimic::One(name) => vec![name.as_str()],
            Mimic::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }
}

impl From<&str> for Mimic {
    fn from(name: &str) -> Self {
        Mimic::One(name.to_string())
    }
}

impl From<Vec<&str>> for Mimic {
    fn from(names: Vec<&str>) -> Self {
        Mimic::Many(names.into_iter().map(str::to_string).collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMapMode {
    /// Map embedded in the bundle as a base64 data URL.
    #[default]
    Inline,
    /// Bundle references `<target>.map`; the host writes the map next to it.
    External,
}
