//! # Code Generator
//!
//! Lowers a [`ValidatedGraph`] to a self-contained Rust program and hands it
//! to a [`Backend`] for native compilation.
//!
//! Bind edges only point backwards, so one forward pass over the nodes is a
//! valid evaluation order. Each node `i` becomes a local `v<i>`; a running
//! table maps node ids to those locals. Sink nodes become statements.
//!
//! Value mapping: `num` is `f64`, `str` is `String`, `bool` is `bool`.

use crate::primitives::{MAX_REPEAT_BYTES, MAX_REPEAT_COUNT};
use crate::validator::ValidatedGraph;
use crate::{Literal, ToolsmithError, ValueType};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

// =============================================================================
// PROGRAM
// =============================================================================

/// A generated program, ready for a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub app: String,
    pub source: String,
}

/// Generate the Rust program for a validated graph.
#[must_use]
pub fn generate(graph: &ValidatedGraph) -> Program {
    Program {
        app: graph.app().to_string(),
        source: emit_rust(graph),
    }
}

/// Runtime helpers shared by every generated program.
const RUNTIME: &str = r#"
fn ts_arg(index: usize) -> String {
    match std::env::args().nth(index) {
        Some(value) => value,
        None => {
            eprintln!("error: missing argument {}", index);
            std::process::exit(1);
        }
    }
}

fn ts_num(n: f64) -> String {
    if n == 0.0 { "0".to_string() } else { format!("{}", n) }
}

fn ts_count(n: f64) -> usize {
    if n.is_finite() && n > 0.0 { n.floor() as usize } else { 0 }
}

fn ts_read_line(prompt: &str) -> String {
    use std::io::{BufRead, Write};
    if !prompt.is_empty() {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
    }
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    line.trim_end_matches(|c: char| c == '\n' || c == '\r').to_string()
}

fn ts_read_all() -> String {
    use std::io::Read;
    let mut text = String::new();
    let _ = std::io::stdin().read_to_string(&mut text);
    text
}

fn ts_write(path: &str, content: &str, append: bool) {
    use std::io::Write;
    let result = if append {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(content.as_bytes()))
    } else {
        std::fs::write(path, content)
    };
    if let Err(e) = result {
        eprintln!("error: cannot write {}: {}", path, e);
        std::process::exit(1);
    }
}

fn ts_repeat(text: &str, times: f64) -> String {
    let mut count = ts_count(times).min(MAX_REPEAT_COUNT);
    if !text.is_empty() {
        count = count.min(MAX_REPEAT_BYTES / text.len());
    }
    text.repeat(count)
}

fn ts_split_count(text: &str, delim: &str) -> f64 {
    if delim.is_empty() { 1.0 } else { text.split(delim).count() as f64 }
}

fn ts_split_nth(text: &str, delim: &str, index: f64) -> String {
    let i = ts_count(index);
    if delim.is_empty() {
        return if i == 0 { text.to_string() } else { String::new() };
    }
    text.split(delim).nth(i).unwrap_or("").to_string()
}

fn ts_replace(text: &str, pattern: &str, replacement: &str) -> String {
    if pattern.is_empty() { text.to_string() } else { text.replace(pattern, replacement) }
}

fn ts_http_get(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("https://") {
        return ts_https_get(url);
    }
    let Some(rest) = url.strip_prefix("http://") else {
        eprintln!("error: unsupported url scheme: {}", url);
        return String::new();
    };
    ts_plain_http_get(rest)
}

fn ts_https_get(url: &str) -> String {
    let output = std::process::Command::new("curl")
        .args(["-s", "-S", "-L", "--max-time", "10", "--proto", "=https,http", "--proto-redir", "=https,http", "--", url])
        .output();
    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).to_string(),
        Ok(o) => {
            eprintln!("error: GET {} failed: {}", url, String::from_utf8_lossy(&o.stderr).trim());
            String::new()
        }
        Err(e) => {
            eprintln!("error: https needs curl on the PATH: {}", e);
            String::new()
        }
    }
}

fn ts_plain_http_get(rest: &str) -> String {
    use std::io::{Read, Write};
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let address = if authority.contains(':') { authority.to_string() } else { format!("{}:80", authority) };
    let host = authority.split(':').next().unwrap_or(authority);
    let mut stream = match std::net::TcpStream::connect(&address) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("error: cannot connect to {}: {}", address, e);
            return String::new();
        }
    };
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(10)));
    let request = format!("GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\nUser-Agent: toolsmith\r\n\r\n", path, host);
    if stream.write_all(request.as_bytes()).is_err() {
        return String::new();
    }
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);
    let response = String::from_utf8_lossy(&response);
    match response.find("\r\n\r\n") {
        Some(i) => response[i + 4..].to_string(),
        None => String::new(),
    }
}
"#;

/// Emit the Rust source for a validated graph.
#[must_use]
pub fn emit_rust(graph: &ValidatedGraph) -> String {
    let mut out = String::with_capacity(8192);
    let _ = writeln!(out, "// generated by toolsmith");
    let _ = writeln!(out, "// app: {}", graph.app());
    let caps: Vec<&str> = graph
        .declared_capabilities()
        .iter()
        .map(|c| c.as_str())
        .collect();
    let _ = writeln!(out, "// capabilities: [{}]", caps.join(", "));
    let _ = writeln!(out, "#![allow(dead_code, unused_variables, unused_mut)]");
    let _ = writeln!(out, "const MAX_REPEAT_COUNT: usize = {MAX_REPEAT_COUNT};");
    let _ = writeln!(out, "const MAX_REPEAT_BYTES: usize = {MAX_REPEAT_BYTES};");
    out.push_str(RUNTIME);
    out.push_str("\nfn main() {\n    let mut ts_status: i32 = 0;\n");

    let mut vars: BTreeMap<&str, String> = BTreeMap::new();
    for (index, (node, sig)) in graph.nodes().enumerate() {
        let var = format!("v{index}");
        let _ = writeln!(out, "    // {:?} ({})", node.id, sig.name);

        // Validation guarantees every required bind and param is present.
        let b = |slot: &str| -> String {
            node.bind
                .get(slot)
                .and_then(|target| vars.get(target.as_str()))
                .cloned()
                .unwrap_or_default()
        };
        let p = |name: &str| -> String {
            match node.params.get(name) {
                Some(value) => rust_literal(value),
                None => "\"\"".to_string(),
            }
        };

        let expr = match sig.name {
            "const_num" | "const_bool" => p("value"),
            "const_str" => format!("String::from({})", p("value")),
            "arg_str" => format!("ts_arg({})", arg_index(node.params.get("index"))),
            "arg_num" => format!(
                "ts_arg({}).trim().parse::<f64>().unwrap_or_else(|_| {{ eprintln!(\"error: argument {} is not a number\"); std::process::exit(1) }})",
                arg_index(node.params.get("index")),
                arg_index(node.params.get("index"))
            ),
            "arg_count" => "(std::env::args().count().saturating_sub(1)) as f64".to_string(),

            "add" => format!("{} + {}", b("lhs"), b("rhs")),
            "sub" => format!("{} - {}", b("lhs"), b("rhs")),
            "mul" => format!("{} * {}", b("lhs"), b("rhs")),
            "div" => format!(
                "if {rhs} == 0.0 {{ 0.0 }} else {{ {lhs} / {rhs} }}",
                lhs = b("lhs"),
                rhs = b("rhs")
            ),
            "mod_num" => format!(
                "if {rhs} == 0.0 {{ 0.0 }} else {{ {lhs} % {rhs} }}",
                lhs = b("lhs"),
                rhs = b("rhs")
            ),
            "floor" => format!("{}.floor()", b("value")),
            "abs" => format!("{}.abs()", b("value")),

            "gt" => format!("{} > {}", b("lhs"), b("rhs")),
            "lt" => format!("{} < {}", b("lhs"), b("rhs")),
            "eq_num" => format!("{} == {}", b("lhs"), b("rhs")),
            "and_bool" => format!("{} && {}", b("lhs"), b("rhs")),
            "or_bool" => format!("{} || {}", b("lhs"), b("rhs")),
            "not_bool" => format!("!{}", b("value")),
            "select_num" => format!(
                "if {} {{ {} }} else {{ {} }}",
                b("cond"),
                b("then"),
                b("else")
            ),
            "select_str" => format!(
                "if {} {{ {}.clone() }} else {{ {}.clone() }}",
                b("cond"),
                b("then"),
                b("else")
            ),

            "to_string" => format!("ts_num({})", b("value")),
            "parse_num" => format!("{}.trim().parse::<f64>().unwrap_or(0.0)", b("text")),
            "concat" => format!("format!(\"{{}}{{}}\", {}, {})", b("left"), b("right")),
            "len_str" => format!("{}.chars().count() as f64", b("text")),
            "repeat_str" => format!("ts_repeat(&{}, {})", b("text"), b("times")),
            "upper_str" => format!("{}.to_uppercase()", b("text")),
            "lower_str" => format!("{}.to_lowercase()", b("text")),
            "trim_str" => format!("{}.trim().to_string()", b("text")),
            "substr" => format!(
                "{}.chars().skip(ts_count({})).take(ts_count({})).collect::<String>()",
                b("text"),
                b("start"),
                b("len")
            ),
            "contains_str" => format!("{}.contains({}.as_str())", b("text"), b("needle")),
            "replace_str" => format!(
                "ts_replace(&{}, &{}, &{})",
                b("text"),
                b("pattern"),
                b("replacement")
            ),
            "split_count" => format!("ts_split_count(&{}, &{})", b("text"), b("delim")),
            "split_nth" => format!(
                "ts_split_nth(&{}, &{}, {})",
                b("text"),
                b("delim"),
                b("index")
            ),
            "format_str" => {
                let second = if node.bind.contains_key("v2") {
                    format!("{}.as_str()", b("v2"))
                } else {
                    "\"\"".to_string()
                };
                format!(
                    "{}.replace(\"{{1}}\", {}.as_str()).replace(\"{{2}}\", {})",
                    p("template"),
                    b("v1"),
                    second
                )
            }
            "path_join" => format!(
                "std::path::Path::new(&{}).join(&{}).display().to_string()",
                b("left"),
                b("right")
            ),

            "cwd" => "std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default()"
                .to_string(),
            "env_str" => format!("std::env::var({}).unwrap_or_default()", p("name")),
            "env_str_dyn" => format!("std::env::var(&{}).unwrap_or_default()", b("name")),
            "read_stdin" => format!("ts_read_line({})", p("prompt")),
            "read_stdin_all" => "ts_read_all()".to_string(),
            "read_file" => format!("std::fs::read_to_string({}).unwrap_or_default()", p("path")),
            "read_file_dyn" => {
                format!("std::fs::read_to_string(&{}).unwrap_or_default()", b("path"))
            }
            "http_get" => format!("ts_http_get({})", p("url")),
            "http_get_dyn" => format!("ts_http_get(&{})", b("url")),

            "write_file" => format!("ts_write({}, &{}, false)", p("path"), b("content")),
            "write_file_dyn" => format!("ts_write(&{}, &{}, false)", b("path"), b("content")),
            "append_file" => format!("ts_write({}, &{}, true)", p("path"), b("content")),
            "print_num" => format!("println!(\"{{}}\", ts_num({}))", b("value")),
            "print_str" | "print_bool" => format!("println!(\"{{}}\", {})", b("value")),
            "exit_code" => format!("ts_status = {} as i32", b("code")),
            other => format!("compile_error!({:?})", format!("unsupported primitive {other}")),
        };

        match sig.provides {
            ValueType::Sink => {
                let _ = writeln!(out, "    {expr};");
            }
            ty => {
                let _ = writeln!(out, "    let {var}: {} = {expr};", rust_type(ty));
                vars.insert(node.id.as_str(), var);
            }
        }
    }

    out.push_str("    {\n        use std::io::Write;\n        let _ = std::io::stdout().flush();\n    }\n");
    out.push_str("    std::process::exit(ts_status);\n}\n");
    out
}

fn rust_type(ty: ValueType) -> &'static str {
    match ty {
        ValueType::Num => "f64",
        ValueType::Str => "String",
        ValueType::Bool => "bool",
        ValueType::Sink => "()",
    }
}

fn arg_index(value: Option<&Literal>) -> usize {
    match value {
        Some(Literal::Num(n)) if n.is_finite() && *n >= 0.0 => *n as usize,
        _ => 0,
    }
}

/// Rust source for a literal. Strings use `Debug`, which escapes into a
/// valid Rust string literal; numbers get an explicit `f64` suffix.
fn rust_literal(value: &Literal) -> String {
    match value {
        Literal::Bool(b) => b.to_string(),
        Literal::Num(n) => format!("({n:?}_f64)"),
        Literal::Str(s) => format!("{s:?}"),
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// Turns a generated program into a native executable at `out`.
///
/// Implementations must either produce a complete file at `out` or return
/// an error; the build cache takes care of atomic publication.
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Compile `program` to an executable written at `out`.
    fn compile(&self, program: &Program, out: &Path) -> Result<(), ToolsmithError>;
}

/// Backend that shells out to `rustc`.
#[derive(Debug, Clone)]
pub struct RustcBackend {
    rustc: PathBuf,
    opt_level: String,
}

impl RustcBackend {
    #[must_use]
    pub fn new(rustc: impl Into<PathBuf>, opt_level: impl Into<String>) -> Self {
        Self {
            rustc: rustc.into(),
            opt_level: opt_level.into(),
        }
    }
}

impl Default for RustcBackend {
    fn default() -> Self {
        Self::new("rustc", "2")
    }
}

impl Backend for RustcBackend {
    fn name(&self) -> &str {
        "rustc"
    }

    fn compile(&self, program: &Program, out: &Path) -> Result<(), ToolsmithError> {
        let source_path = out.with_extension("rs");
        std::fs::write(&source_path, &program.source).map_err(ToolsmithError::storage)?;

        debug!(app = %program.app, rustc = %self.rustc.display(), "invoking backend");
        let output = Command::new(&self.rustc)
            .arg("--edition")
            .arg("2021")
            .arg("-C")
            .arg(format!("opt-level={}", self.opt_level))
            .arg("-C")
            .arg("strip=symbols")
            .arg("-o")
            .arg(out)
            .arg(&source_path)
            .output();
        let _ = std::fs::remove_file(&source_path);

        let output = output.map_err(|e| ToolsmithError::Backend {
            detail: format!("cannot run {}: {e}", self.rustc.display()),
        })?;
        if !output.status.success() {
            return Err(ToolsmithError::Backend {
                detail: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        info!(app = %program.app, "backend compiled program");
        Ok(())
    }
}
