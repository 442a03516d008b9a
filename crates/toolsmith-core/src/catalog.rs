//! # Primitive Catalog
//!
//! The closed, versioned table of operations a manifest node may `use`.
//!
//! Each entry is a tagged signature record: parameter schema, bind slots with
//! their required types, the provided type, and the declared effect set.
//! Dispatch is by name lookup; there is no way to register primitives at
//! runtime.

use crate::primitives::CATALOG_VERSION;
use crate::{Capability, LiteralKind, ValueType};
use serde::Serialize;
use std::collections::BTreeMap;

// =============================================================================
// SIGNATURES
// =============================================================================

/// A literal parameter accepted by a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamSlot {
    pub name: &'static str,
    pub kind: LiteralKind,
    pub required: bool,
}

/// A dataflow input slot on a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BindSlot {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub ty: ValueType,
    pub required: bool,
}

/// Signature of one catalog primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrimitiveSignature {
    pub name: &'static str,
    pub params: &'static [ParamSlot],
    pub binds: &'static [BindSlot],
    pub provides: ValueType,
    pub effects: &'static [Capability],
    pub summary: &'static str,
}

impl PrimitiveSignature {
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&ParamSlot> {
        self.params.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn bind(&self, name: &str) -> Option<&BindSlot> {
        self.binds.iter().find(|b| b.name == name)
    }

    /// Human-readable list of accepted params and binds, for hints.
    #[must_use]
    pub fn describe_slots(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let opt = if p.required { "" } else { "?" };
                format!("{}{opt}:{}", p.name, p.kind)
            })
            .collect();
        let binds: Vec<String> = self
            .binds
            .iter()
            .map(|b| {
                let opt = if b.required { "" } else { "?" };
                format!("{}{opt}:{}", b.name, b.ty)
            })
            .collect();
        format!(
            "{} accepts params [{}] and binds [{}]",
            self.name,
            params.join(", "),
            binds.join(", ")
        )
    }
}

const fn param(name: &'static str, kind: LiteralKind) -> ParamSlot {
    ParamSlot {
        name,
        kind,
        required: true,
    }
}

const fn opt_param(name: &'static str, kind: LiteralKind) -> ParamSlot {
    ParamSlot {
        name,
        kind,
        required: false,
    }
}

const fn bind(name: &'static str, ty: ValueType) -> BindSlot {
    BindSlot {
        name,
        ty,
        required: true,
    }
}

const fn opt_bind(name: &'static str, ty: ValueType) -> BindSlot {
    BindSlot {
        name,
        ty,
        required: false,
    }
}

use crate::Capability::{EnvRead, FsRead, FsWrite, IoRead, IoWrite, NetRead};
use crate::LiteralKind as L;
use crate::ValueType::{Bool, Num, Sink, Str};

const NUM_PAIR: &[BindSlot] = &[bind("lhs", Num), bind("rhs", Num)];
const BOOL_PAIR: &[BindSlot] = &[bind("lhs", Bool), bind("rhs", Bool)];
const STR_PAIR: &[BindSlot] = &[bind("left", Str), bind("right", Str)];
const NUM_VALUE: &[BindSlot] = &[bind("value", Num)];
const TEXT: &[BindSlot] = &[bind("text", Str)];

macro_rules! sig {
    ($name:literal, $params:expr, $binds:expr, $provides:expr, $effects:expr, $summary:literal) => {
        PrimitiveSignature {
            name: $name,
            params: $params,
            binds: $binds,
            provides: $provides,
            effects: $effects,
            summary: $summary,
        }
    };
}

/// The builtin table, in display order.
static PRIMITIVES: &[PrimitiveSignature] = &[
    // constants and arguments
    sig!("const_num", &[param("value", L::Num)], &[], Num, &[], "numeric constant"),
    sig!("const_str", &[param("value", L::Str)], &[], Str, &[], "string constant"),
    sig!("const_bool", &[param("value", L::Bool)], &[], Bool, &[], "boolean constant"),
    sig!("arg_num", &[param("index", L::Int)], &[], Num, &[], "argv[index] as a number (1 is the first argument; exits 1 if absent)"),
    sig!("arg_str", &[param("index", L::Int)], &[], Str, &[], "argv[index] (1 is the first argument; exits 1 if absent)"),
    sig!("arg_count", &[], &[], Num, &[], "number of command-line arguments"),
    // arithmetic
    sig!("add", &[], NUM_PAIR, Num, &[], "lhs + rhs"),
    sig!("sub", &[], NUM_PAIR, Num, &[], "lhs - rhs"),
    sig!("mul", &[], NUM_PAIR, Num, &[], "lhs * rhs"),
    sig!("div", &[], NUM_PAIR, Num, &[], "lhs / rhs (0 when rhs is 0)"),
    sig!("mod_num", &[], NUM_PAIR, Num, &[], "lhs % rhs (0 when rhs is 0)"),
    sig!("floor", &[], NUM_VALUE, Num, &[], "round toward negative infinity"),
    sig!("abs", &[], NUM_VALUE, Num, &[], "absolute value"),
    // comparison and logic
    sig!("gt", &[], NUM_PAIR, Bool, &[], "lhs > rhs"),
    sig!("lt", &[], NUM_PAIR, Bool, &[], "lhs < rhs"),
    sig!("eq_num", &[], NUM_PAIR, Bool, &[], "lhs == rhs"),
    sig!("and_bool", &[], BOOL_PAIR, Bool, &[], "lhs && rhs"),
    sig!("or_bool", &[], BOOL_PAIR, Bool, &[], "lhs || rhs"),
    sig!("not_bool", &[], &[bind("value", Bool)], Bool, &[], "!value"),
    sig!("select_num", &[], &[bind("cond", Bool), bind("then", Num), bind("else", Num)], Num, &[], "cond ? then : else"),
    sig!("select_str", &[], &[bind("cond", Bool), bind("then", Str), bind("else", Str)], Str, &[], "cond ? then : else"),
    // conversions and strings
    sig!("to_string", &[], NUM_VALUE, Str, &[], "render a number"),
    sig!("parse_num", &[], TEXT, Num, &[], "parse a number (0 on failure)"),
    sig!("concat", &[], STR_PAIR, Str, &[], "left ++ right"),
    sig!("len_str", &[], TEXT, Num, &[], "length in characters"),
    sig!("repeat_str", &[], &[bind("text", Str), bind("times", Num)], Str, &[], "text repeated (clamped)"),
    sig!("upper_str", &[], TEXT, Str, &[], "uppercase"),
    sig!("lower_str", &[], TEXT, Str, &[], "lowercase"),
    sig!("trim_str", &[], TEXT, Str, &[], "strip surrounding whitespace"),
    sig!("substr", &[], &[bind("text", Str), bind("start", Num), bind("len", Num)], Str, &[], "character slice"),
    sig!("contains_str", &[], &[bind("text", Str), bind("needle", Str)], Bool, &[], "substring test"),
    sig!("replace_str", &[], &[bind("text", Str), bind("pattern", Str), bind("replacement", Str)], Str, &[], "replace all occurrences"),
    sig!("split_count", &[], &[bind("text", Str), bind("delim", Str)], Num, &[], "number of pieces after splitting"),
    sig!("split_nth", &[], &[bind("text", Str), bind("delim", Str), bind("index", Num)], Str, &[], "nth piece after splitting (empty if absent)"),
    sig!("format_str", &[param("template", L::Str)], &[bind("v1", Str), opt_bind("v2", Str)], Str, &[], "substitute {1} and {2} in template"),
    sig!("path_join", &[], STR_PAIR, Str, &[], "join two path components"),
    // environment
    sig!("cwd", &[], &[], Str, &[EnvRead], "current working directory"),
    sig!("env_str", &[param("name", L::Str)], &[], Str, &[EnvRead], "environment variable (empty if unset)"),
    sig!("env_str_dyn", &[], &[bind("name", Str)], Str, &[EnvRead], "environment variable by computed name"),
    // input
    sig!("read_stdin", &[opt_param("prompt", L::Str)], &[], Str, &[IoRead], "one line from stdin"),
    sig!("read_stdin_all", &[], &[], Str, &[IoRead], "all of stdin"),
    sig!("read_file", &[param("path", L::Str)], &[], Str, &[FsRead], "file contents (empty on failure)"),
    sig!("read_file_dyn", &[], &[bind("path", Str)], Str, &[FsRead], "file contents by computed path"),
    sig!("http_get", &[param("url", L::Str)], &[], Str, &[NetRead], "HTTP GET body (https through curl)"),
    sig!("http_get_dyn", &[], &[bind("url", Str)], Str, &[NetRead], "HTTP GET by computed url (https through curl)"),
    // output
    sig!("write_file", &[param("path", L::Str)], &[bind("content", Str)], Sink, &[FsWrite], "write content to path"),
    sig!("write_file_dyn", &[], &[bind("path", Str), bind("content", Str)], Sink, &[FsWrite], "write content to computed path"),
    sig!("append_file", &[param("path", L::Str)], &[bind("content", Str)], Sink, &[FsWrite], "append content to path"),
    sig!("print_num", &[], NUM_VALUE, Sink, &[IoWrite], "print a number and newline"),
    sig!("print_str", &[], &[bind("value", Str)], Sink, &[IoWrite], "print a string and newline"),
    sig!("print_bool", &[], &[bind("value", Bool)], Sink, &[IoWrite], "print true/false and newline"),
    sig!("exit_code", &[], &[bind("code", Num)], Sink, &[], "set the process exit status"),
];

// =============================================================================
// CATALOG
// =============================================================================

/// Name-indexed view over the builtin primitive table.
#[derive(Debug, Clone)]
pub struct Catalog {
    by_name: BTreeMap<&'static str, &'static PrimitiveSignature>,
}

impl Catalog {
    /// The builtin catalog, version [`CATALOG_VERSION`].
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            by_name: PRIMITIVES.iter().map(|p| (p.name, p)).collect(),
        }
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        CATALOG_VERSION
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'static PrimitiveSignature> {
        self.by_name.get(name).copied()
    }

    /// All primitives in display order.
    pub fn iter(&self) -> impl Iterator<Item = &'static PrimitiveSignature> {
        PRIMITIVES.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.len(), PRIMITIVES.len());
    }

    #[test]
    fn sinks_are_the_only_effectful_outputs() {
        let catalog = Catalog::builtin();
        for sig in catalog.iter() {
            let writes = sig
                .effects
                .iter()
                .any(|c| matches!(c, Capability::IoWrite | Capability::FsWrite));
            if writes {
                assert_eq!(sig.provides, ValueType::Sink, "{}", sig.name);
            }
        }
    }

    #[test]
    fn nothing_binds_a_sink() {
        for sig in Catalog::builtin().iter() {
            assert!(sig.binds.iter().all(|b| b.ty != ValueType::Sink), "{}", sig.name);
        }
    }

    #[test]
    fn lookup_by_name() {
        let catalog = Catalog::builtin();
        let add = catalog.get("add").unwrap();
        assert_eq!(add.provides, ValueType::Num);
        assert_eq!(add.bind("lhs").map(|b| b.ty), Some(ValueType::Num));
        assert!(catalog.get("launch_missiles").is_none());
        assert_eq!(
            catalog.get("http_get").unwrap().effects,
            &[Capability::NetRead]
        );
    }

    #[test]
    fn describe_marks_optional_slots() {
        let sig = Catalog::builtin().get("format_str").unwrap();
        let text = sig.describe_slots();
        assert!(text.contains("template:str"));
        assert!(text.contains("v2?:str"));
    }
}
