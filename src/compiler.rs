//! Template compilation - the engine's "register compiled module" step.
//!
//! A template source is a CommonJS-style module exporting a function that
//! receives the shared `bh` instance:
//!
//! ```text
//! module.exports = function (bh) {
//!     bh.match('block', function (ctx) { ctx.tag('a'); });
//! };
//! ```

use std::path::Path;

/// Output of compiling one template source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTemplate {
    /// Script fragment that registers the template on `bh` when evaluated.
    pub code: String,
    /// Zero-based line of `code` holding the first source line. Source lines
    /// follow one per line from there.
    pub source_offset: usize,
    pub source_lines: usize,
}

/// The template engine collaborator.
///
/// Errors are returned as a plain cause string; the aggregator attaches
/// the file path.
pub trait TemplateCompiler: Send + Sync {
    fn compile(&self, path: &Path, source: &str) -> Result<CompiledTemplate, String>;
}

/// Wraps template modules into self-invoking registration fragments.
#[derive(Debug, Clone, Copy, Default)]
pub struct BhModuleCompiler;

const MODULE_PROLOGUE: &str = "(function () {\nvar module = { exports: {} }, exports = module.exports;\n";
const MODULE_PROLOGUE_LINES: usize = 2;
const MODULE_EPILOGUE: &str =
    ";\nif (typeof module.exports === 'function') { module.exports(bh); }\n})();\n";

impl TemplateCompiler for BhModuleCompiler {
    fn compile(&self, _path: &Path, source: &str) -> Result<CompiledTemplate, String> {
        if source.trim().is_empty() {
            return Err("template module is empty".to_string());
        }
        check_balanced(source)?;

        let body = source.strip_suffix('\n').unwrap_or(source);
        let mut code = String::with_capacity(source.len() + MODULE_PROLOGUE.len() + MODULE_EPILOGUE.len());
        code.push_str(MODULE_PROLOGUE);
        code.push_str(body);
        code.push('\n');
        code.push_str(MODULE_EPILOGUE);

        Ok(CompiledTemplate {
            code,
            source_offset: MODULE_PROLOGUE_LINES,
            source_lines: body.lines().count().max(1),
        })
    }
}

/// Lexical sanity check: brackets pair up and strings, template literals,
/// comments and regex literals are terminated.
pub fn check_balanced(source: &str) -> Result<(), String> {
    let chars: Vec<char> = source.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut last_significant: Option<char> = None;
    let mut after_keyword = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let start = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("unterminated comment starting on line {}", start)),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
                continue;
            }
            '/' if after_keyword || starts_regex(last_significant) => {
                let start = line;
                let mut in_class = false;
                i += 1;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => {
                            return Err(format!("unterminated regular expression on line {}", start))
                        }
                        Some('\\') => i += 1,
                        Some('[') => in_class = true,
                        Some(']') => in_class = false,
                        Some('/') if !in_class => break,
                        Some(_) => {}
                    }
                    i += 1;
                }
                last_significant = Some('/');
                after_keyword = false;
                i += 1;
                continue;
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let is_property = start > 0 && chars[start - 1] == '.';
                after_keyword = !is_property && REGEX_KEYWORDS.contains(&word.as_str());
                last_significant = Some(chars[i - 1]);
                continue;
            }
            '"' | '\'' | '`' => {
                let start = line;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("unterminated string starting on line {}", start)),
                        Some('\\') => i += 1,
                        Some('\n') if c != '`' => {
                            return Err(format!("unterminated string on line {}", start))
                        }
                        Some('\n') => line += 1,
                        Some(&q) if q == c => break,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "unexpected '{}' on line {} (unclosed '{}' from line {})",
                            c, line, open, open_line
                        ))
                    }
                    None => return Err(format!("unexpected '{}' on line {}", c, line)),
                }
            }
            _ => {}
        }
        if !c.is_whitespace() {
            last_significant = Some(c);
            after_keyword = false;
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, open_line)) => Err(format!("unclosed '{}' from line {}", open, open_line)),
        None => Ok(()),
    }
}

/// Keywords after which `/` opens a regex literal rather than dividing.
const REGEX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

fn is_word_char(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric()
}

fn starts_regex(prev: Option<char>) -> bool {
    match prev {
        None => true,
        Some(p) => "(,=:[!&|?{};+-*%<>~^".contains(p),
    }
}
