//! # Canonical Form and Content Hash
//!
//! The canonical form is compact JSON with sorted object keys:
//!
//! ```text
//! {"app":..,"capabilities":[..],"catalog":1,"nodes":[{"bind":{..},"id":..,"params":{..},"use":..},..]}
//! ```
//!
//! - capabilities are a set and serialize in canonical order
//! - nodes keep document order (evaluation order is meaningful)
//! - numbers use the shortest round-trip decimal, `-0` becomes `0`,
//!   so `1`, `1.0` and `1e0` agree
//!
//! The hash is BLAKE3 over [`HASH_DOMAIN`] followed by the canonical text.
//! It is the cache key and the permanent identity of a tool.

use crate::manifest::Manifest;
use crate::primitives::{CATALOG_VERSION, HASH_DOMAIN};
use crate::validator::ValidatedGraph;
use crate::{Literal, ToolHash, ValueType};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Canonical text and hash of a validated manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canonical {
    pub text: String,
    pub hash: ToolHash,
}

/// Canonicalize and hash a validated graph.
#[must_use]
pub fn canonicalize(graph: &ValidatedGraph) -> Canonical {
    let text = canonical_text(graph.manifest());
    let hash = hash_canonical(&text);
    Canonical { text, hash }
}

/// Hash an already-canonical text.
#[must_use]
pub fn hash_canonical(text: &str) -> ToolHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(HASH_DOMAIN.as_bytes());
    hasher.update(text.as_bytes());
    ToolHash::new(hasher.finalize().to_hex().to_string())
}

/// Render the canonical text of a manifest.
#[must_use]
pub fn canonical_text(manifest: &Manifest) -> String {
    let mut out = String::with_capacity(64 + manifest.nodes.len() * 64);
    out.push_str("{\"app\":");
    push_str_literal(&mut out, &manifest.app);
    out.push_str(",\"capabilities\":[");
    for (i, cap) in manifest.capabilities.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_str_literal(&mut out, cap.as_str());
    }
    let _ = write!(out, "],\"catalog\":{CATALOG_VERSION},\"nodes\":[");
    for (i, node) in manifest.nodes.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str("{\"bind\":{");
        for (j, (slot, target)) in node.bind.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            push_str_literal(&mut out, slot);
            out.push(':');
            push_str_literal(&mut out, target);
        }
        out.push_str("},\"id\":");
        push_str_literal(&mut out, &node.id);
        out.push_str(",\"params\":{");
        for (j, (name, value)) in node.params.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            push_str_literal(&mut out, name);
            out.push(':');
            push_literal(&mut out, value);
        }
        out.push_str("},\"use\":");
        push_str_literal(&mut out, &node.primitive);
        out.push('}');
    }
    out.push_str("]}");
    out
}

fn push_literal(out: &mut String, value: &Literal) {
    match value {
        Literal::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Literal::Num(n) => out.push_str(&format_number(*n)),
        Literal::Str(s) => push_str_literal(out, s),
    }
}

fn push_str_literal(out: &mut String, s: &str) {
    // serde_json escaping of a &str never fails
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

/// Shortest round-trip decimal for `n`, with `-0` folded into `0`.
#[must_use]
pub fn format_number(n: f64) -> String {
    if n == 0.0 {
        return "0".to_string();
    }
    format!("{n}")
}

// =============================================================================
// IO CONTRACT
// =============================================================================

/// One observable input or output of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoPort {
    /// Node that reads or writes.
    pub node: String,
    /// `arg<N>` (argv index), `stdin`, `stdout`, `file:<path>`, `file:*` or `exit`.
    pub channel: String,
    /// `num`, `str`, `bool`, `file` or `exit`.
    #[serde(rename = "type")]
    pub ty: String,
}

/// Inputs and outputs derived from the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoContract {
    pub inputs: Vec<IoPort>,
    pub outputs: Vec<IoPort>,
}

impl IoContract {
    /// Derive the contract of a validated graph.
    #[must_use]
    pub fn derive(graph: &ValidatedGraph) -> Self {
        let mut args: Vec<(u64, IoPort)> = Vec::new();
        let mut stdin = Vec::new();
        let mut outputs = Vec::new();

        for (node, sig) in graph.nodes() {
            let port = |channel: String, ty: &str| IoPort {
                node: node.id.clone(),
                channel,
                ty: ty.to_string(),
            };
            let str_param = |name: &str| match node.params.get(name) {
                Some(Literal::Str(s)) => s.clone(),
                _ => "*".to_string(),
            };
            match sig.name {
                "arg_num" | "arg_str" => {
                    let index = match node.params.get("index") {
                        Some(Literal::Num(n)) => *n as u64,
                        _ => 0,
                    };
                    args.push((index, port(format!("arg{index}"), sig.provides.as_str())));
                }
                "read_stdin" | "read_stdin_all" => {
                    stdin.push(port("stdin".to_string(), ValueType::Str.as_str()));
                }
                "print_num" | "print_str" | "print_bool" => {
                    let ty = sig.binds.first().map_or("str", |b| b.ty.as_str());
                    outputs.push(port("stdout".to_string(), ty));
                }
                "write_file" | "append_file" => {
                    outputs.push(port(format!("file:{}", str_param("path")), "file"));
                }
                "write_file_dyn" => outputs.push(port("file:*".to_string(), "file")),
                "exit_code" => outputs.push(port("exit".to_string(), "exit")),
                _ => {}
            }
        }

        args.sort_by_key(|(index, _)| *index);
        args.dedup_by_key(|(index, _)| *index);
        let mut inputs: Vec<IoPort> = args.into_iter().map(|(_, p)| p).collect();
        inputs.extend(stdin);
        Self { inputs, outputs }
    }

    /// Compact `"<inputs> -> <outputs>"` summary, e.g. `"num,num -> num"`.
    #[must_use]
    pub fn signature(&self) -> String {
        let side = |ports: &[IoPort]| {
            if ports.is_empty() {
                "()".to_string()
            } else {
                ports
                    .iter()
                    .map(|p| p.ty.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            }
        };
        format!("{} -> {}", side(&self.inputs), side(&self.outputs))
    }
}

/// Primitive names joined by `>` in node order.
#[must_use]
pub fn pattern(graph: &ValidatedGraph) -> String {
    graph
        .nodes()
        .map(|(_, sig)| sig.name)
        .collect::<Vec<_>>()
        .join(">")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::validator::validate;

    fn graph(source: &str) -> ValidatedGraph {
        validate(Manifest::parse(source).unwrap(), &Catalog::builtin()).unwrap()
    }

    #[test]
    fn numbers_normalize() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(-2.5), "-2.5");
    }

    #[test]
    fn canonical_text_shape() {
        let g = graph(
            r#"{"capabilities": ["io_write"], "app": "one", "nodes": [
                {"use": "const_num", "params": {"value": 1.0}, "id": "a"},
                {"id": "p", "bind": {"value": "a"}, "use": "print_num"}
            ]}"#,
        );
        assert_eq!(
            canonical_text(g.manifest()),
            r#"{"app":"one","capabilities":["io_write"],"catalog":1,"nodes":[{"bind":{},"id":"a","params":{"value":1},"use":"const_num"},{"bind":{"value":"a"},"id":"p","params":{},"use":"print_num"}]}"#
        );
    }

    #[test]
    fn formatting_does_not_change_hash() {
        let a = graph(
            r#"{"app":"x","capabilities":["io_write","io_read"],"nodes":[{"id":"s","use":"read_stdin"},{"id":"o","use":"print_str","bind":{"value":"s"}}]}"#,
        );
        let b = graph(
            r#"{
                "nodes": [
                    {"bind": {}, "use": "read_stdin", "id": "s", "params": {}},
                    {"use": "print_str", "id": "o", "bind": {"value": "s"}}
                ],
                "capabilities": ["io_read", "io_write", "io_read"],
                "app": "x"
            }"#,
        );
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn node_order_changes_hash() {
        let a = graph(
            r#"{"app":"x","capabilities":["io_write"],"nodes":[
                {"id":"a","use":"const_num","params":{"value":1}},
                {"id":"b","use":"const_num","params":{"value":2}},
                {"id":"o","use":"print_num","bind":{"value":"a"}}]}"#,
        );
        let b = graph(
            r#"{"app":"x","capabilities":["io_write"],"nodes":[
                {"id":"b","use":"const_num","params":{"value":2}},
                {"id":"a","use":"const_num","params":{"value":1}},
                {"id":"o","use":"print_num","bind":{"value":"a"}}]}"#,
        );
        assert_ne!(canonicalize(&a).hash, canonicalize(&b).hash);
    }

    #[test]
    fn hash_is_hex() {
        let h = hash_canonical("{}");
        assert!(ToolHash::is_well_formed(h.as_str()));
    }

    #[test]
    fn io_contract_of_adder() {
        let g = graph(
            r#"{"app":"adder","capabilities":["io_write"],"nodes":[
                {"id":"b","use":"arg_num","params":{"index":2}},
                {"id":"a","use":"arg_num","params":{"index":1}},
                {"id":"s","use":"add","bind":{"lhs":"a","rhs":"b"}},
                {"id":"o","use":"print_num","bind":{"value":"s"}}]}"#,
        );
        let io = IoContract::derive(&g);
        assert_eq!(io.signature(), "num,num -> num");
        assert_eq!(io.inputs[0].channel, "arg1");
        assert_eq!(pattern(&g), "arg_num>arg_num>add>print_num");
    }

    #[test]
    fn io_contract_with_files() {
        let g = graph(
            r#"{"app":"copy","capabilities":["fs_read","fs_write"],"nodes":[
                {"id":"r","use":"read_file","params":{"path":"in.txt"}},
                {"id":"w","use":"write_file","params":{"path":"out.txt"},"bind":{"content":"r"}}]}"#,
        );
        let io = IoContract::derive(&g);
        assert_eq!(io.signature(), "() -> file");
        assert_eq!(io.outputs[0].channel, "file:out.txt");
    }
}
