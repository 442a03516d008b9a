//! # Manifest Grammar
//!
//! A GBNF grammar (the llama.cpp constrained-decoding format) generated
//! from the catalog. A model sampling under it can only emit manifests
//! whose nodes name real primitives with the right param and bind keys.
//!
//! The grammar is structural. It cannot express that binds point at
//! earlier nodes, that types line up, or that the capability list covers
//! the effects; the validator still checks all of that.

use crate::catalog::{Catalog, PrimitiveSignature};
use crate::{Capability, LiteralKind};
use std::fmt::Write as _;

/// Render the grammar for every primitive in `catalog`.
#[must_use]
pub fn gbnf(catalog: &Catalog) -> String {
    let mut g = String::with_capacity(8 * 1024);
    let _ = writeln!(g, "# toolsmith manifest grammar (catalog v{})", catalog.version());
    let _ = writeln!(g);
    let _ = writeln!(
        g,
        r#"root ::= "{{" ws "\"app\"" ws ":" ws app-name ws "," ws "\"capabilities\"" ws ":" ws capabilities ws "," ws "\"nodes\"" ws ":" ws "[" ws node (ws "," ws node)* ws "]" ws "}}""#
    );
    let _ = writeln!(g, r#"app-name ::= "\"" [a-z0-9] [a-z0-9-]* "\"""#);
    let _ = writeln!(
        g,
        r#"capabilities ::= "[" ws (capability (ws "," ws capability)*)? ws "]""#
    );
    let caps: Vec<String> = Capability::ALL
        .iter()
        .map(|c| format!(r#""\"{}\"""#, c.as_str()))
        .collect();
    let _ = writeln!(g, "capability ::= {}", caps.join(" | "));

    let _ = writeln!(g);
    let rules: Vec<String> = catalog.iter().map(|sig| rule_name(sig.name)).collect();
    let _ = writeln!(g, "node ::= {}", rules.join(" | "));
    for sig in catalog.iter() {
        let _ = writeln!(g, "{}", primitive_rule(sig));
    }

    let _ = writeln!(g);
    let _ = writeln!(g, "# shared");
    let _ = writeln!(g, r#"node-id ::= "\"" [A-Za-z0-9_-]+ "\"""#);
    let _ = writeln!(
        g,
        r#"string ::= "\"" ([^"\\\x00-\x1f] | "\\" (["\\/bfnrt] | "u" hex hex hex hex))* "\"""#
    );
    let _ = writeln!(g, "hex ::= [0-9a-fA-F]");
    let _ = writeln!(
        g,
        r#"number ::= "-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [-+]? [0-9]+)?"#
    );
    let _ = writeln!(g, r#"integer ::= "0" | [1-9] [0-9]*"#);
    let _ = writeln!(g, r#"boolean ::= "true" | "false""#);
    let _ = writeln!(g, r"ws ::= [ \t\n]*");
    g
}

fn rule_name(primitive: &str) -> String {
    format!("use-{}", primitive.replace('_', "-"))
}

fn literal_rule(kind: LiteralKind) -> &'static str {
    match kind {
        LiteralKind::Num => "number",
        LiteralKind::Int => "integer",
        LiteralKind::Str => "string",
        LiteralKind::Bool => "boolean",
    }
}

fn primitive_rule(sig: &PrimitiveSignature) -> String {
    let params: Vec<(&str, &str, bool)> = sig
        .params
        .iter()
        .map(|p| (p.name, literal_rule(p.kind), p.required))
        .collect();
    let binds: Vec<(&str, &str, bool)> = sig
        .binds
        .iter()
        .map(|b| (b.name, "node-id", b.required))
        .collect();
    format!(
        r#"{} ::= "{{" ws "\"id\"" ws ":" ws node-id ws "," ws "\"use\"" ws ":" ws "\"{}\""{}{} ws "}}""#,
        rule_name(sig.name),
        sig.name,
        member("params", &params),
        member("bind", &binds),
    )
}

/// `, "key": {..}` with required slots first, then optional ones. The whole
/// member is optional when no slot is required.
fn member(key: &str, slots: &[(&str, &str, bool)]) -> String {
    if slots.is_empty() {
        return String::new();
    }
    let item = |(name, rule, _): &(&str, &str, bool)| format!(r#""\"{name}\"" ws ":" ws {rule}"#);
    let required: Vec<String> = slots.iter().filter(|s| s.2).map(item).collect();
    let optional: Vec<String> = slots.iter().filter(|s| !s.2).map(item).collect();

    let (mut body, rest, wrap) = if required.is_empty() {
        (optional[0].clone(), &optional[1..], true)
    } else {
        (required.join(r#" ws "," ws "#), &optional[..], false)
    };
    for extra in rest {
        let _ = write!(body, r#" (ws "," ws {extra})?"#);
    }
    let member = format!(r#"ws "," ws "\"{key}\"" ws ":" ws "{{" ws {body} ws "}}""#);
    if wrap {
        format!(" ({member})?")
    } else {
        format!(" {member}")
    }
}
