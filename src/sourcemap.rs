//! Source Map v3 generation for concatenated bundles.
//!
//! Fragments are concatenated line by line, so provenance is tracked per
//! generated line: each line either maps to column 0 of one source line or
//! is synthetic wrapper code with no mapping.

use base64::Engine;
use serde::{Deserialize, Serialize};

const BASE64_DIGITS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    pub file: String,
    pub sources: Vec<String>,
    pub sources_content: Vec<String>,
    pub names: Vec<String>,
    pub mappings: String,
}

impl SourceMap {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Name of the map file that sits next to the bundle in external mode.
    pub fn map_file_name(&self) -> String {
        format!("{}.map", self.file)
    }

    pub fn to_data_url(&self) -> Result<String, serde_json::Error> {
        let json = self.to_json()?;
        Ok(format!(
            "data:application/json;charset=utf-8;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(json)
        ))
    }
}

/// Trailing bundle comment pointing at `url`.
pub fn source_mapping_comment(url: &str) -> String {
    format!("//# sourceMappingURL={}", url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineOrigin {
    source: usize,
    line: usize,
}

#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    contents: Vec<String>,
    lines: Vec<Option<LineOrigin>>,
}

impl SourceMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, returning its index.
    pub fn add_source(&mut self, name: impl Into<String>, content: impl Into<String>) -> usize {
        self.sources.push(name.into());
        self.contents.push(content.into());
        self.sources.len() - 1
    }

    /// Append `count` generated lines with no origin.
    pub fn add_unmapped_lines(&mut self, count: usize) {
        self.lines.extend(std::iter::repeat(None).take(count));
    }

    /// Append `count` generated lines mapping to consecutive lines of
    /// `source`, starting at zero-based `first_line`.
    pub fn add_mapped_lines(&mut self, source: usize, first_line: usize, count: usize) {
        self.lines.extend((0..count).map(|i| {
            Some(LineOrigin {
                source,
                line: first_line + i,
            })
        }));
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn build(self, file: impl Into<String>) -> SourceMap {
        let mut mappings = String::new();
        let mut prev_source: i64 = 0;
        let mut prev_line: i64 = 0;

        for (i, origin) in self.lines.iter().enumerate() {
            if i > 0 {
                mappings.push(';');
            }
            if let Some(origin) = origin {
                let source = origin.source as i64;
                let line = origin.line as i64;
                encode_vlq(&mut mappings, 0);
                encode_vlq(&mut mappings, source - prev_source);
                encode_vlq(&mut mappings, line - prev_line);
                encode_vlq(&mut mappings, 0);
                prev_source = source;
                prev_line = line;
            }
        }

        SourceMap {
            version: 3,
            file: file.into(),
            sources: self.sources,
            sources_content: self.contents,
            names: vec![],
            mappings,
        }
    }
}

fn encode_vlq(out: &mut String, value: i64) {
    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    };
    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64_DIGITS[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlq(value: i64) -> String {
        let mut s = String::new();
        encode_vlq(&mut s, value);
        s
    }

    #[test]
    fn vlq_known_values() {
        assert_eq!(vlq(0), "A");
        assert_eq!(vlq(1), "C");
        assert_eq!(vlq(-1), "D");
        assert_eq!(vlq(16), "gB");
        assert_eq!(vlq(123), "2H");
    }

    #[test]
    fn mappings_use_relative_offsets() {
        let mut builder = SourceMapBuilder::new();
        let core = builder.add_source("bh.js", "a\nb");
        let tpl = builder.add_source("blocks/block.bh.js", "x");
        builder.add_unmapped_lines(1);
        builder.add_mapped_lines(core, 0, 2);
        builder.add_unmapped_lines(1);
        builder.add_mapped_lines(tpl, 0, 1);

        let map = builder.build("bundle.bh.js");
        // line 2 -> bh.js:0, line 3 -> bh.js:1, line 5 -> block:0
        assert_eq!(map.mappings, ";AAAA;AACA;;ACDA");
        assert_eq!(map.sources, vec!["bh.js", "blocks/block.bh.js"]);
        assert_eq!(map.version, 3);
    }

    #[test]
    fn json_uses_camel_case_field_names() {
        let map = SourceMapBuilder::new().build("out.js");
        let json = map.to_json().unwrap();
        assert!(json.contains("\"sourcesContent\":[]"));
        assert!(json.contains("\"file\":\"out.js\""));
    }

    #[test]
    fn map_file_name_follows_bundle_file() {
        let map = SourceMapBuilder::new().build("bundle.bh.js");
        assert_eq!(map.map_file_name(), "bundle.bh.js.map");
    }

    #[test]
    fn data_url_round_trips_through_base64() {
        let map = SourceMapBuilder::new().build("out.js");
        let url = map.to_data_url().unwrap();
        let encoded = url.strip_prefix("data:application/json;charset=utf-8;base64,").unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        let back: SourceMap = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(back, map);
    }
}
