//! Bundle Assembler - merges core, dependencies, templates, aliases and
//! initialization into one client script.
//!
//! Layout of the emitted script:
//!
//! ```text
//! (function (global) {
//! var module = { exports: {} }, exports = module.exports;
//! <engine core>
//! var BH = ...; var bh = new BH();
//! <dependencies as read-only bh.lib entries>
//! <template registration fragments, in input order>
//! <alias table: name -> bh>
//! <bh.setOptions(jsAttr options); expose aliases on global>
//! })(...);
//! //# sourceMappingURL=...
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::aggregator::AggregatedTemplate;
use crate::compiler::check_balanced;
use crate::config::{BuildConfig, SourceMapMode};
use crate::engine::EngineCore;
use crate::pipeline::BuildError;
use crate::sourcemap::{source_mapping_comment, SourceMap, SourceMapBuilder};

/// Global name every bundle exposes.
pub const CANONICAL_NAME: &str = "bh";

/// Globals an alias may not take over.
const RESERVED_GLOBALS: &[&str] = &["BH", "modules", "window", "global", "self", "globalThis"];

/// `bh.lib` keys a dependency may not use.
const RESERVED_LIB_KEYS: &[&str] = &["__proto__", "constructor", "prototype", "hasOwnProperty"];

/// The assembled client script, plus its source map when requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub text: String,
    #[serde(default)]
    pub source_map: Option<SourceMap>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BundleAssembler;

impl BundleAssembler {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip_all, fields(bundle = %target, templates = templates.len()))]
    pub fn assemble(
        &self,
        target: &str,
        core: &EngineCore,
        templates: &[AggregatedTemplate],
        config: &BuildConfig,
    ) -> Result<Bundle, BuildError> {
        let aliases = alias_table(config)?;
        check_dependencies(config)?;
        check_js_attr_name(&config.js_attr_name)?;

        let mut out = ScriptWriter::new(config.sourcemap);

        out.push("(function (global) {\n");
        out.push("var module = { exports: {} }, exports = module.exports;\n");
        let core_source = out.add_source(core.source_name(), &core.content);
        out.push_mapped(&core.content, core_source);
        out.push(";\n");
        out.push("var BH = typeof module.exports === 'function' ? module.exports : BH;\n");
        out.push("var bh = new BH();\n");

        if !config.dependencies.is_empty() {
            out.push("bh.lib = bh.lib || {};\n");
            for (id, expr) in &config.dependencies {
                out.push(&format!(
                    "Object.defineProperty(bh.lib, {}, {{ value: ({}), enumerable: true }});\n",
                    js_string(id)?,
                    expr.trim()
                ));
            }
        }

        for template in templates {
            let source = out.add_source(template.path.to_string_lossy(), &template.source);
            out.push_fragment(
                &template.compiled.code,
                source,
                template.compiled.source_offset,
                template.compiled.source_lines,
            );
        }

        let entries: Vec<String> = aliases
            .iter()
            .map(|name| Ok(format!("{}: bh", js_string(name)?)))
            .collect::<Result<_, BuildError>>()?;
        out.push(&format!("var exposed = {{ {} }};\n", entries.join(", ")));

        let options = serde_json::json!({
            "jsAttrName": config.js_attr_name,
            "jsAttrScheme": config.js_attr_scheme.as_str(),
        });
        out.push(&format!("bh.setOptions({});\n", serde_json::to_string(&options)?));
        out.push("for (var name in exposed) { global[name] = exposed[name]; }\n");
        out.push("if (typeof modules === 'object' && typeof modules.define === 'function') {\n");
        out.push("    modules.define('bh', [], function (provide) { provide(bh); });\n");
        out.push("}\n");
        out.push("})(typeof window !== 'undefined' ? window : typeof global !== 'undefined' ? global : this);\n");

        let bundle = out.finish(target, config.sourcemap_mode)?;
        debug!(bytes = bundle.text.len(), aliases = aliases.len(), "bundle assembled");
        Ok(bundle)
    }
}

/// Canonical name first, then mimic names in configured order, deduplicated.
fn alias_table(config: &BuildConfig) -> Result<Vec<String>, BuildError> {
    let mut seen = BTreeSet::new();
    let mut aliases = vec![CANONICAL_NAME.to_string()];
    seen.insert(CANONICAL_NAME);

    for name in config.mimic.names() {
        if !is_js_identifier(name) {
            return Err(BuildError::Assembly(format!(
                "mimic name {:?} is not a valid identifier",
                name
            )));
        }
        if RESERVED_GLOBALS.contains(&name) {
            return Err(BuildError::Assembly(format!(
                "mimic name {:?} collides with a reserved global",
                name
            )));
        }
        if seen.insert(name) {
            aliases.push(name.to_string());
        }
    }
    Ok(aliases)
}

fn check_dependencies(config: &BuildConfig) -> Result<(), BuildError> {
    for (id, expr) in &config.dependencies {
        if id.is_empty() || RESERVED_LIB_KEYS.contains(&id.as_str()) {
            return Err(BuildError::Assembly(format!(
                "dependency name {:?} is reserved",
                id
            )));
        }
        if expr.trim().is_empty() {
            return Err(BuildError::Assembly(format!(
                "dependency {:?} has an empty expression",
                id
            )));
        }
        check_balanced(expr).map_err(|cause| {
            BuildError::Assembly(format!("dependency {:?}: {}", id, cause))
        })?;
    }
    Ok(())
}

fn check_js_attr_name(name: &str) -> Result<(), BuildError> {
    let invalid = name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "\"'<>/=".contains(c));
    if invalid {
        return Err(BuildError::Assembly(format!(
            "jsAttrName {:?} is not a valid attribute name",
            name
        )));
    }
    Ok(())
}

fn is_js_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c == '$' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c == '$' || c.is_alphanumeric())
}

fn js_string(value: &str) -> Result<String, BuildError> {
    Ok(serde_json::to_string(value)?)
}

/// Accumulates script text and, when enabled, per-line provenance.
struct ScriptWriter {
    text: String,
    map: Option<SourceMapBuilder>,
}

impl ScriptWriter {
    fn new(sourcemap: bool) -> Self {
        Self {
            text: String::new(),
            map: sourcemap.then(SourceMapBuilder::new),
        }
    }

    fn add_source(&mut self, name: impl Into<String>, content: &str) -> usize {
        match &mut self.map {
            Some(map) => map.add_source(name, content),
            None => 0,
        }
    }

    /// Append generated text. Must end with a newline.
    fn push(&mut self, text: &str) {
        self.text.push_str(text);
        if let Some(map) = &mut self.map {
            map.add_unmapped_lines(text.matches('\n').count());
        }
    }

    /// Append a whole source file, one generated line per source line.
    fn push_mapped(&mut self, content: &str, source: usize) {
        let body = content.strip_suffix('\n').unwrap_or(content);
        self.text.push_str(body);
        self.text.push('\n');
        if let Some(map) = &mut self.map {
            map.add_mapped_lines(source, 0, body.matches('\n').count() + 1);
        }
    }

    /// Append a compiled fragment whose lines `offset..offset + count` carry
    /// the source's lines.
    fn push_fragment(&mut self, code: &str, source: usize, offset: usize, count: usize) {
        self.text.push_str(code);
        if !code.ends_with('\n') {
            self.text.push('\n');
        }
        if let Some(map) = &mut self.map {
            let total = code.matches('\n').count() + usize::from(!code.ends_with('\n'));
            let offset = offset.min(total);
            let count = count.min(total - offset);
            map.add_unmapped_lines(offset);
            map.add_mapped_lines(source, 0, count);
            map.add_unmapped_lines(total - offset - count);
        }
    }

    fn finish(self, target: &str, mode: SourceMapMode) -> Result<Bundle, BuildError> {
        let mut text = self.text;
        let source_map = match self.map {
            None => None,
            Some(builder) => {
                let file = Path::new(target)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| target.to_string());
                let map = builder.build(file);
                let url = match mode {
                    SourceMapMode::Inline => map.to_data_url()?,
                    SourceMapMode::External => map.map_file_name(),
                };
                text.push_str(&source_mapping_comment(&url));
                text.push('\n');
                Some(map)
            }
        };
        Ok(Bundle { text, source_map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{BhModuleCompiler, TemplateCompiler};
    use crate::config::{JsAttrScheme, Mimic};
    use crate::engine::{CoreSource, DEFAULT_CORE_SOURCE};
    use crate::identity::Identity;
    use std::path::PathBuf;

    fn default_core() -> EngineCore {
        EngineCore {
            source: CoreSource::Embedded,
            content: DEFAULT_CORE_SOURCE.to_string(),
            identity: Identity::from_content(DEFAULT_CORE_SOURCE.as_bytes()),
        }
    }

    fn template(path: &str, source: &str) -> AggregatedTemplate {
        AggregatedTemplate {
            path: PathBuf::from(path),
            source: source.to_string(),
            compiled: BhModuleCompiler.compile(Path::new(path), source).unwrap(),
            identity: Identity::Mtime(1),
        }
    }

    fn block_template() -> AggregatedTemplate {
        template(
            "blocks/block.bh.js",
            "module.exports = function(bh) {bh.match(\"block\", function(ctx) { ctx.tag(\"a\"); });};",
        )
    }

    fn assemble(config: &BuildConfig) -> Result<Bundle, BuildError> {
        BundleAssembler::new().assemble("bundle.bh.js", &default_core(), &[block_template()], config)
    }

    #[test]
    fn sections_in_fixed_order() {
        let config = BuildConfig {
            dependencies: [("test".to_string(), "\"^_^\"".to_string())].into(),
            mimic: Mimic::from("BEMHTML"),
            ..BuildConfig::default()
        };
        let text = assemble(&config).unwrap().text;

        let core = text.find("BH.prototype.apply").unwrap();
        let deps = text.find("Object.defineProperty(bh.lib, \"test\"").unwrap();
        let templates = text.find("bh.match(\"block\"").unwrap();
        let aliases = text.find("var exposed").unwrap();
        let init = text.find("bh.setOptions(").unwrap();
        assert!(core < deps && deps < templates && templates < aliases && aliases < init);
    }

    #[test]
    fn default_js_attr_options() {
        let text = assemble(&BuildConfig::default()).unwrap().text;
        assert!(text.contains(r#"bh.setOptions({"jsAttrName":"data-bem","jsAttrScheme":"json"});"#));
    }

    #[test]
    fn redefined_js_attr_options() {
        let config = BuildConfig {
            js_attr_name: "onclick".to_string(),
            js_attr_scheme: JsAttrScheme::Js,
            ..BuildConfig::default()
        };
        let text = assemble(&config).unwrap().text;
        assert!(text.contains(r#"bh.setOptions({"jsAttrName":"onclick","jsAttrScheme":"js"});"#));
    }

    #[test]
    fn aliases_share_one_instance() {
        let config = BuildConfig {
            mimic: Mimic::from(vec!["BEMHTML", "render", "BEMHTML", "bh"]),
            ..BuildConfig::default()
        };
        let text = assemble(&config).unwrap().text;
        assert!(text.contains(r#"var exposed = { "bh": bh, "BEMHTML": bh, "render": bh };"#));
        assert_eq!(text.matches("new BH()").count(), 1);
    }

    #[test]
    fn no_mimic_exposes_only_canonical_name() {
        let text = assemble(&BuildConfig::default()).unwrap().text;
        assert!(text.contains(r#"var exposed = { "bh": bh };"#));
    }

    #[test]
    fn dependency_is_read_only_lib_entry() {
        let config = BuildConfig {
            dependencies: [("test".to_string(), "\"^_^\"".to_string())].into(),
            ..BuildConfig::default()
        };
        let text = assemble(&config).unwrap().text;
        assert!(text.contains(
            r#"Object.defineProperty(bh.lib, "test", { value: ("^_^"), enumerable: true });"#
        ));
    }

    #[test]
    fn reserved_dependency_name_rejected() {
        let config = BuildConfig {
            dependencies: [("__proto__".to_string(), "{}".to_string())].into(),
            ..BuildConfig::default()
        };
        assert!(matches!(assemble(&config), Err(BuildError::Assembly(_))));
    }

    #[test]
    fn unbalanced_dependency_expression_rejected() {
        let config = BuildConfig {
            dependencies: [("x".to_string(), "foo(".to_string())].into(),
            ..BuildConfig::default()
        };
        let err = assemble(&config).unwrap_err();
        assert!(err.to_string().contains("dependency \"x\""));
    }

    #[test]
    fn reserved_or_invalid_mimic_rejected() {
        for bad in ["BH", "window", "not-an-id", "1abc"] {
            let config = BuildConfig { mimic: Mimic::from(bad), ..BuildConfig::default() };
            assert!(matches!(assemble(&config), Err(BuildError::Assembly(_))), "{}", bad);
        }
    }

    #[test]
    fn invalid_js_attr_name_rejected() {
        let config = BuildConfig { js_attr_name: "data bem".to_string(), ..BuildConfig::default() };
        assert!(matches!(assemble(&config), Err(BuildError::Assembly(_))));
    }

    #[test]
    fn no_sourcemap_by_default() {
        let bundle = assemble(&BuildConfig::default()).unwrap();
        assert!(bundle.source_map.is_none());
        assert!(!bundle.text.contains("sourceMappingURL"));
    }

    #[test]
    fn inline_sourcemap_maps_template_lines() {
        let config = BuildConfig { sourcemap: true, ..BuildConfig::default() };
        let bundle = assemble(&config).unwrap();
        let map = bundle.source_map.unwrap();

        assert!(bundle.text.trim_end().lines().last().unwrap()
            .starts_with("//# sourceMappingURL=data:application/json;charset=utf-8;base64,"));
        assert_eq!(map.file, "bundle.bh.js");
        assert_eq!(map.sources, vec!["bh.js", "blocks/block.bh.js"]);

        // The generated line carrying the template source maps to it.
        let lines: Vec<_> = bundle.text.lines().collect();
        let tpl_line = lines.iter().position(|l| l.starts_with("module.exports = function(bh)")).unwrap();
        let segments: Vec<_> = map.mappings.split(';').collect();
        assert!(!segments[tpl_line].is_empty());
        assert!(segments[tpl_line - 1].is_empty());
    }

    #[test]
    fn external_sourcemap_references_map_file() {
        let config = BuildConfig {
            sourcemap: true,
            sourcemap_mode: SourceMapMode::External,
            ..BuildConfig::default()
        };
        let bundle = assemble(&config).unwrap();
        assert!(bundle.text.ends_with("//# sourceMappingURL=bundle.bh.js.map\n"));
        assert_eq!(bundle.source_map.unwrap().map_file_name(), "bundle.bh.js.map");
    }

    #[test]
    fn deterministic_output() {
        let config = BuildConfig { sourcemap: true, ..BuildConfig::default() };
        assert_eq!(assemble(&config).unwrap(), assemble(&config).unwrap());
    }
}
