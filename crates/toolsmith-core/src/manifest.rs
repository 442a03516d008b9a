//! # Manifest Parser
//!
//! Turns a raw manifest document into a [`Manifest`], checking structural
//! well-formedness only. Bind references and types are left to the
//! validator.
//!
//! Checks, in order:
//! 1. The document is an object with `app`, `capabilities` and `nodes`.
//! 2. `app` is 1-64 bytes of `[a-z0-9-]`, starting with a letter or digit.
//! 3. Every capability is one of the six known names.
//! 4. `nodes` is non-empty; every node has a non-empty `id` and `use`.
//! 5. No two nodes share an `id`.

use crate::primitives::MAX_APP_NAME_LEN;
use crate::{Capability, Literal, ToolsmithError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// MANIFEST
// =============================================================================

/// One node of a manifest graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "use")]
    pub primitive: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Literal>,
    /// Slot name to the id of an earlier node.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub bind: BTreeMap<String, String>,
}

/// A parsed manifest.
///
/// `nodes` keeps document order: it is the only admissible evaluation order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub app: String,
    pub capabilities: BTreeSet<Capability>,
    pub nodes: Vec<NodeSpec>,
}

#[derive(Deserialize)]
struct RawManifest {
    app: String,
    capabilities: Vec<String>,
    nodes: Vec<RawNode>,
}

#[derive(Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "use")]
    primitive: String,
    #[serde(default)]
    params: BTreeMap<String, Literal>,
    #[serde(default)]
    bind: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse a manifest from JSON text.
    pub fn parse(source: &str) -> Result<Self, ToolsmithError> {
        let raw: RawManifest = serde_json::from_str(source).map_err(|e| ToolsmithError::Parse {
            detail: e.to_string(),
        })?;
        Self::from_raw(raw)
    }

    /// Parse a manifest from an already-decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ToolsmithError> {
        let raw: RawManifest =
            serde_json::from_value(value).map_err(|e| ToolsmithError::Parse {
                detail: e.to_string(),
            })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawManifest) -> Result<Self, ToolsmithError> {
        check_app_name(&raw.app)?;

        let capabilities = raw
            .capabilities
            .iter()
            .map(|c| c.parse::<Capability>())
            .collect::<Result<BTreeSet<_>, _>>()?;

        if raw.nodes.is_empty() {
            return Err(ToolsmithError::Parse {
                detail: "\"nodes\" must be a non-empty array".to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        let mut nodes = Vec::with_capacity(raw.nodes.len());
        for (index, node) in raw.nodes.into_iter().enumerate() {
            if node.id.is_empty() {
                return Err(ToolsmithError::Parse {
                    detail: format!("node #{index} has an empty \"id\""),
                });
            }
            if node.primitive.is_empty() {
                return Err(ToolsmithError::Parse {
                    detail: format!("node \"{}\" has an empty \"use\"", node.id),
                });
            }
            if !seen.insert(node.id.clone()) {
                return Err(ToolsmithError::DuplicateId { id: node.id });
            }
            nodes.push(NodeSpec {
                id: node.id,
                primitive: node.primitive,
                params: node.params,
                bind: node.bind,
            });
        }

        Ok(Self {
            app: raw.app,
            capabilities,
            nodes,
        })
    }
}

/// Check the `app` charset and length.
pub fn check_app_name(app: &str) -> Result<(), ToolsmithError> {
    let invalid = |reason: &str| ToolsmithError::AppNameInvalid {
        app: app.to_string(),
        reason: reason.to_string(),
    };
    if app.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if app.len() > MAX_APP_NAME_LEN {
        return Err(invalid("longer than 64 bytes"));
    }
    if !app
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("only lowercase letters, digits and '-' are allowed"));
    }
    if app.starts_with('-') {
        return Err(invalid("must start with a letter or digit"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    const SUM: &str = r#"{
        "app": "sum",
        "capabilities": ["io_write"],
        "nodes": [
            {"id": "a", "use": "const_num", "params": {"value": 13}},
            {"id": "b", "use": "const_num", "params": {"value": 29}},
            {"id": "s", "use": "add", "bind": {"lhs": "a", "rhs": "b"}},
            {"id": "out", "use": "print_num", "bind": {"value": "s"}}
        ]
    }"#;

    #[test]
    fn parses_example() {
        let m = Manifest::parse(SUM).unwrap();
        assert_eq!(m.app, "sum");
        assert_eq!(m.nodes.len(), 4);
        assert_eq!(m.nodes[2].bind.get("lhs").map(String::as_str), Some("a"));
        assert!(m.capabilities.contains(&Capability::IoWrite));
    }

    #[test]
    fn missing_field_is_parse_error() {
        let err = Manifest::parse(r#"{"app": "x", "nodes": []}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }

    #[test]
    fn empty_nodes_rejected() {
        let err = Manifest::parse(r#"{"app": "x", "capabilities": [], "nodes": []}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }

    #[test]
    fn unknown_capability_rejected() {
        let err = Manifest::parse(
            r#"{"app": "x", "capabilities": ["gpu"], "nodes": [{"id": "a", "use": "cwd"}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
        assert!(err.to_string().contains("gpu"));
    }

    #[test]
    fn app_name_rules() {
        assert!(check_app_name("word-count2").is_ok());
        assert!(check_app_name("2fast").is_ok());
        for bad in ["", "-lead", "Upper", "under_score", "sp ace"] {
            let err = check_app_name(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AppNameInvalid, "{bad:?}");
        }
        assert!(check_app_name(&"a".repeat(64)).is_ok());
        assert!(check_app_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn duplicate_id_detected() {
        let err = Manifest::parse(
            r#"{"app": "x", "capabilities": [], "nodes": [
                {"id": "a", "use": "const_num", "params": {"value": 1}},
                {"id": "a", "use": "no_such_primitive"}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ToolsmithError::DuplicateId { ref id } if id == "a"));
    }

    #[test]
    fn empty_use_rejected() {
        let err = Manifest::parse(
            r#"{"app": "x", "capabilities": [], "nodes": [{"id": "a", "use": ""}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }

    #[test]
    fn capabilities_are_a_set() {
        let m = Manifest::parse(
            r#"{"app": "x", "capabilities": ["io_write", "env_read", "io_write"],
                "nodes": [{"id": "a", "use": "cwd"}]}"#,
        )
        .unwrap();
        let caps: Vec<_> = m.capabilities.into_iter().collect();
        assert_eq!(caps, vec![Capability::EnvRead, Capability::IoWrite]);
    }
}
