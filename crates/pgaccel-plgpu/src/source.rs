//! Source preprocessor for GPU-language procedure bodies.
//!
//! The body is a line stream carrying `#plgpu_*` directive lines between
//! plain device-code lines. `decl` and `begin` open the two code blocks,
//! `include` substitutes the text returned by a helper function from the
//! host catalog. Diagnostics accumulate instead of aborting, so one parse
//! reports as many problems as possible, each tagged with the originating
//! source name and line number.

use std::fmt;

use pgaccel_core::catalog::{ProcCatalog, ProcRecord};
use pgaccel_core::types::{HostType, Value};

use crate::error::PlGpuError;

pub const DIRECTIVE_PREFIX: &str = "#plgpu_";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceErrorKind {
    Parse,
    UnknownDirective,
    InfiniteInclusion,
    HelperNotFound,
    HelperWrongType,
    HelperAccessDenied,
}

/// Accumulated preprocessing diagnostics.
#[derive(Debug, Default)]
pub struct Diagnostics {
    messages: String,
    kinds: Vec<SourceErrorKind>,
}

impl Diagnostics {
    fn push(&mut self, kind: SourceErrorKind, source: &str, lineno: u32, message: String) {
        self.messages
            .push_str(&format!("\n{source}({lineno}) {message}"));
        self.kinds.push(kind);
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn kinds(&self) -> &[SourceErrorKind] {
        &self.kinds
    }

    pub fn contains(&self, kind: SourceErrorKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.messages)
    }
}

/// Result of expanding one procedure body.
#[derive(Debug, Default)]
pub struct ExpandedSource {
    pub decl: Option<String>,
    pub main: Option<String>,
    pub include_count: usize,
    pub diagnostics: Diagnostics,
}

impl ExpandedSource {
    pub fn into_result(self) -> Result<ExpandedSource, PlGpuError> {
        if self.diagnostics.is_empty() {
            Ok(self)
        } else {
            Err(PlGpuError::Source(self.diagnostics))
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Block {
    None,
    Decl,
    Main,
}

/// Expand a procedure body. With `args` set, helper inclusions are invoked
/// and substituted; without, they are only resolved and counted (validation
/// mode cannot know what a helper would emit at run time).
pub fn expand(
    proc: &ProcRecord,
    catalog: &dyn ProcCatalog,
    args: Option<&[Value]>,
) -> ExpandedSource {
    let mut expander = Expander {
        proc,
        catalog,
        args,
        out: ExpandedSource::default(),
        curr: Block::None,
        include_stack: Vec::new(),
        source_name: String::new(),
        lineno: 0,
    };
    let body = proc.source.clone();
    expander.expand_source(&body);
    expander.out
}

struct Expander<'a> {
    proc: &'a ProcRecord,
    catalog: &'a dyn ProcCatalog,
    args: Option<&'a [Value]>,
    out: ExpandedSource,
    curr: Block,
    include_stack: Vec<pgaccel_core::catalog::ProcId>,
    source_name: String,
    lineno: u32,
}

impl<'a> Expander<'a> {
    fn diag(&mut self, kind: SourceErrorKind, message: String) {
        self.out
            .diagnostics
            .push(kind, &self.source_name, self.lineno, message);
    }

    fn append_line(&mut self, line: &str) {
        let buffer = match self.curr {
            Block::Decl => self.out.decl.as_mut(),
            Block::Main => self.out.main.as_mut(),
            Block::None => {
                if !line.trim().is_empty() {
                    self.diag(
                        SourceErrorKind::Parse,
                        format!("code appears outside of any block: {line}"),
                    );
                }
                return;
            }
        };
        if let Some(buffer) = buffer {
            buffer.push_str(line);
            buffer.push('\n');
        }
    }

    fn expand_source(&mut self, source: &str) {
        for (index, raw_line) in source.split('\n').enumerate() {
            self.lineno = index as u32 + 1;
            let line = raw_line.trim_end();

            if !line.starts_with(DIRECTIVE_PREFIX) {
                self.append_line(line);
                continue;
            }

            let Some(tokens) = parse_cmd_options(line) else {
                self.diag(
                    SourceErrorKind::Parse,
                    format!("directive parse error:\n{line}"),
                );
                continue;
            };
            let (cmd, options) = match tokens.split_first() {
                Some((cmd, options)) => (cmd.clone(), options.to_vec()),
                None => continue,
            };

            match cmd.as_str() {
                "#plgpu_decl" => {
                    if self.out.decl.is_some() {
                        self.diag(SourceErrorKind::Parse, format!("{cmd} appeared twice"));
                    } else if !options.is_empty() {
                        self.diag(SourceErrorKind::Parse, format!("{cmd} cannot take options"));
                    } else {
                        self.out.decl = Some(String::new());
                        self.curr = Block::Decl;
                    }
                }
                "#plgpu_begin" => {
                    if self.out.main.is_some() {
                        self.diag(SourceErrorKind::Parse, format!("{cmd} appeared twice"));
                    } else if !options.is_empty() {
                        self.diag(SourceErrorKind::Parse, format!("{cmd} cannot take options"));
                    } else {
                        self.out.main = Some(String::new());
                        self.curr = Block::Main;
                    }
                }
                "#plgpu_end" => {
                    if self.curr == Block::None {
                        self.diag(
                            SourceErrorKind::Parse,
                            format!("{cmd} is used out of code block"),
                        );
                    } else {
                        self.curr = Block::None;
                    }
                }
                "#plgpu_include" => self.handle_include(&cmd, &options),
                _ => {
                    self.diag(SourceErrorKind::UnknownDirective, format!("unknown command: {cmd}"));
                }
            }
        }
    }

    fn handle_include(&mut self, cmd: &str, options: &[String]) {
        let path: Option<Vec<String>> = match options {
            [name] => Some(vec![name.clone()]),
            [namespace, dot, name] if dot.as_str() == "." => {
                Some(vec![namespace.clone(), name.clone()])
            }
            _ => None,
        };
        let Some(path) = path else {
            self.diag(
                SourceErrorKind::Parse,
                format!("{cmd} has invalid identifier: {}", options.join(" ")),
            );
            return;
        };
        let display = path.join(".");

        let helper = self.catalog.lookup(&path, &self.proc.arg_types);
        self.out.include_count += 1;

        let Some(helper) = helper else {
            self.diag(
                SourceErrorKind::HelperNotFound,
                format!("function {display} was not found"),
            );
            return;
        };
        if helper.ret_type != HostType::Text {
            self.diag(
                SourceErrorKind::HelperWrongType,
                format!(
                    "function {display} has unexpected result type: {}, instead of text",
                    helper.ret_type.name()
                ),
            );
            return;
        }
        if !self.catalog.owner_check(helper.id, self.proc.owner) {
            self.diag(
                SourceErrorKind::HelperAccessDenied,
                format!("permission denied on helper function {display}"),
            );
            return;
        }

        if let Some(args) = self.args {
            self.include_helper(&helper, &display, args.to_vec());
        }
    }

    fn include_helper(&mut self, helper: &ProcRecord, display: &str, args: Vec<Value>) {
        if self.include_stack.contains(&helper.id) {
            self.diag(
                SourceErrorKind::InfiniteInclusion,
                format!("\"{display}\" leads infinite inclusion"),
            );
            return;
        }

        let text = match self.catalog.invoke_text(helper.id, &args) {
            Ok(Some(text)) => text,
            Ok(None) => {
                self.diag(
                    SourceErrorKind::Parse,
                    format!("function {display} returned NULL"),
                );
                return;
            }
            Err(e) => {
                self.diag(
                    SourceErrorKind::Parse,
                    format!("failed to invoke helper function {display}: {e}"),
                );
                return;
            }
        };

        self.append_line(&format!("/* ------ BEGIN {display} ------ */"));
        self.include_stack.push(helper.id);
        let saved_source = std::mem::replace(&mut self.source_name, helper.name.clone());
        let saved_lineno = self.lineno;
        self.expand_source(&text);
        self.lineno = saved_lineno;
        self.source_name = saved_source;
        self.include_stack.pop();
        self.append_line(&format!("/* ------ END {display} ------ */"));
    }
}

/// Tokenize one directive line: whitespace-separated tokens, lowercased;
/// single or double quotes preserve case and whitespace; a backslash escapes
/// one character; a dot is a standalone token joining identifiers into a
/// dotted path. Returns None on a syntax error.
fn parse_cmd_options(line: &str) -> Option<Vec<String>> {
    let mut options = Vec::new();
    let mut token = String::new();
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            token.push(chars.next()?);
        } else if let Some(q) = quote {
            if c == q {
                options.push(std::mem::take(&mut token));
                quote = None;
            } else {
                token.push(c);
            }
        } else if c == '.' {
            if !token.is_empty() {
                options.push(std::mem::take(&mut token));
            }
            if options.is_empty() {
                return None;
            }
            options.push(".".to_string());
        } else if c == '"' || c == '\'' {
            if !token.is_empty() {
                options.push(std::mem::take(&mut token));
            }
            quote = Some(c);
        } else if c.is_whitespace() {
            if !token.is_empty() {
                options.push(std::mem::take(&mut token));
            }
        } else {
            token.extend(c.to_lowercase());
        }
    }

    if quote.is_some() {
        return None; // EOL inside quote
    }
    if !token.is_empty() {
        options.push(token);
    }
    Some(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgaccel_core::catalog::{MemCatalog, OwnerId, ProcId, ProcRecord};

    fn proc_record(id: u32, name: &str, source: &str) -> ProcRecord {
        ProcRecord {
            id: ProcId(id),
            name: name.to_string(),
            namespace: "public".to_string(),
            owner: OwnerId(10),
            arg_types: vec![HostType::Int4],
            ret_type: HostType::Int4,
            ret_set: false,
            source: source.to_string(),
        }
    }

    fn text_helper(id: u32, name: &str, owner: u32) -> ProcRecord {
        ProcRecord {
            id: ProcId(id),
            name: name.to_string(),
            namespace: "public".to_string(),
            owner: OwnerId(owner),
            arg_types: vec![HostType::Int4],
            ret_type: HostType::Text,
            ret_set: false,
            source: String::new(),
        }
    }

    #[test]
    fn tokenizer_lowercases_and_quotes() {
        let tokens = parse_cmd_options(r#"#plgpu_include "My Helper" Schema.Func"#).expect("parse");
        assert_eq!(
            tokens,
            vec!["#plgpu_include", "My Helper", "schema", ".", "func"]
        );
    }

    #[test]
    fn tokenizer_backslash_escapes_one_char() {
        let tokens = parse_cmd_options(r"#plgpu_include a\.b").expect("parse");
        assert_eq!(tokens, vec!["#plgpu_include", "a.b"]);
        // escape at end of line is a syntax error
        assert!(parse_cmd_options(r"#plgpu_include a\").is_none());
    }

    #[test]
    fn tokenizer_rejects_unterminated_quote_and_leading_dot() {
        assert!(parse_cmd_options(r#"#plgpu_include "oops"#).is_none());
        assert!(parse_cmd_options(".leading").is_none());
    }

    #[test]
    fn blocks_accumulate() {
        let catalog = MemCatalog::new();
        let proc = proc_record(
            1,
            "f",
            "#plgpu_decl\n__device__ int helper(int x) { return x; }\n#plgpu_end\n#plgpu_begin\nretval = helper(arg1);\n#plgpu_end\n",
        );
        let out = expand(&proc, &catalog, None);
        assert!(out.diagnostics.is_empty(), "{}", out.diagnostics);
        assert_eq!(
            out.decl.as_deref(),
            Some("__device__ int helper(int x) { return x; }\n")
        );
        assert_eq!(out.main.as_deref(), Some("retval = helper(arg1);\n"));
    }

    #[test]
    fn duplicate_blocks_and_unknown_directives_accumulate() {
        let catalog = MemCatalog::new();
        let proc = proc_record(
            1,
            "f",
            "#plgpu_begin\n#plgpu_end\n#plgpu_begin\n#plgpu_end\n#plgpu_frobnicate\n#plgpu_end\n",
        );
        let out = expand(&proc, &catalog, None);
        assert_eq!(out.diagnostics.kinds().len(), 3);
        assert!(out.diagnostics.contains(SourceErrorKind::Parse));
        assert!(out.diagnostics.contains(SourceErrorKind::UnknownDirective));
        let message = out.diagnostics.to_string();
        assert!(message.contains("appeared twice"));
        assert!(message.contains("unknown command"));
    }

    #[test]
    fn include_expands_with_markers() {
        let catalog = MemCatalog::new();
        catalog.insert_helper(text_helper(5, "snippet", 10), |_| {
            Some("int from_helper = 1;".to_string())
        });
        let proc = proc_record(1, "f", "#plgpu_begin\n#plgpu_include snippet\nretval = from_helper;\n#plgpu_end\n");
        let out = expand(&proc, &catalog, Some(&[Value::Int4(0)]));
        assert!(out.diagnostics.is_empty(), "{}", out.diagnostics);
        assert_eq!(out.include_count, 1);
        let main = out.main.expect("main block");
        assert!(main.contains("/* ------ BEGIN snippet ------ */"));
        assert!(main.contains("int from_helper = 1;"));
        assert!(main.contains("/* ------ END snippet ------ */"));
    }

    #[test]
    fn include_checks_type_and_owner() {
        let catalog = MemCatalog::new();
        // wrong return type
        let mut wrong = text_helper(6, "wrongtype", 10);
        wrong.ret_type = HostType::Int4;
        catalog.insert(wrong);
        // right type, wrong owner
        catalog.insert_helper(text_helper(7, "notmine", 99), |_| Some(String::new()));

        let proc = proc_record(
            1,
            "f",
            "#plgpu_begin\n#plgpu_include wrongtype\n#plgpu_include notmine\n#plgpu_include missing\n#plgpu_end\n",
        );
        let out = expand(&proc, &catalog, Some(&[Value::Int4(0)]));
        assert_eq!(out.include_count, 3);
        assert!(out.diagnostics.contains(SourceErrorKind::HelperWrongType));
        assert!(out.diagnostics.contains(SourceErrorKind::HelperAccessDenied));
        assert!(out.diagnostics.contains(SourceErrorKind::HelperNotFound));
    }

    #[test]
    fn inclusion_cycle_is_detected() {
        let catalog = MemCatalog::new();
        catalog.insert_helper(text_helper(21, "helper_a", 10), |_| {
            Some("#plgpu_include helper_b".to_string())
        });
        catalog.insert_helper(text_helper(22, "helper_b", 10), |_| {
            Some("#plgpu_include helper_a".to_string())
        });

        let proc = proc_record(1, "f", "#plgpu_begin\n#plgpu_include helper_a\n#plgpu_end\n");
        let out = expand(&proc, &catalog, Some(&[Value::Int4(0)]));
        assert!(out.diagnostics.contains(SourceErrorKind::InfiniteInclusion));
        // nothing from the cycling helper may appear in the output
        let main = out.main.expect("main block");
        let depth_a = main.matches("/* ------ BEGIN helper_a ------ */").count();
        assert_eq!(depth_a, 1, "helper_a must not be expanded twice");
        assert!(out
            .diagnostics
            .to_string()
            .contains("leads infinite inclusion"));
    }

    #[test]
    fn resolve_only_mode_does_not_invoke_helpers() {
        let catalog = MemCatalog::new();
        catalog.insert_helper(text_helper(31, "probe", 10), |_| {
            panic!("helper must not run without call arguments")
        });
        let proc = proc_record(1, "f", "#plgpu_begin\n#plgpu_include probe\n#plgpu_end\n");
        let out = expand(&proc, &catalog, None);
        assert!(out.diagnostics.is_empty(), "{}", out.diagnostics);
        assert_eq!(out.include_count, 1);
    }
}
