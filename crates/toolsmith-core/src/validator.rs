//! # Graph Validator
//!
//! Resolves every node against the [`Catalog`], checks params and binds,
//! type-checks every edge and accumulates the capabilities the graph needs.
//!
//! Validation is fail-fast in node order. The symbol table only ever holds
//! ids of strictly earlier nodes, so a single lookup rejects forward
//! references, self references and cycles alike.

use crate::catalog::{Catalog, PrimitiveSignature};
use crate::manifest::{Manifest, NodeSpec};
use crate::{Capability, ToolsmithError, ValueType};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A manifest that passed validation, with every node resolved.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    manifest: Manifest,
    signatures: Vec<&'static PrimitiveSignature>,
    required: BTreeSet<Capability>,
}

impl ValidatedGraph {
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    #[must_use]
    pub fn app(&self) -> &str {
        &self.manifest.app
    }

    /// Nodes in evaluation order, paired with their resolved signature.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeSpec, &'static PrimitiveSignature)> {
        self.manifest
            .nodes
            .iter()
            .zip(self.signatures.iter().copied())
    }

    /// Provided type of the node called `id`.
    #[must_use]
    pub fn provided_type(&self, id: &str) -> Option<ValueType> {
        self.nodes()
            .find(|(node, _)| node.id == id)
            .map(|(_, sig)| sig.provides)
    }

    /// Union of the effects of every primitive used.
    #[must_use]
    pub fn required_capabilities(&self) -> &BTreeSet<Capability> {
        &self.required
    }

    /// Capabilities as declared by the manifest (a superset of the required set).
    #[must_use]
    pub fn declared_capabilities(&self) -> &BTreeSet<Capability> {
        &self.manifest.capabilities
    }
}

/// Validate `manifest` against `catalog`.
pub fn validate(manifest: Manifest, catalog: &Catalog) -> Result<ValidatedGraph, ToolsmithError> {
    let mut symbols: BTreeMap<&str, ValueType> = BTreeMap::new();
    let mut signatures = Vec::with_capacity(manifest.nodes.len());
    // capability -> (node, primitive) that first needed it
    let mut required: BTreeMap<Capability, (&str, &str)> = BTreeMap::new();
    let mut has_sink = false;

    for node in &manifest.nodes {
        let sig = catalog
            .get(&node.primitive)
            .ok_or_else(|| ToolsmithError::UnknownPrimitive {
                node: node.id.clone(),
                primitive: node.primitive.clone(),
            })?;

        check_params(node, sig)?;
        check_binds(node, sig, &symbols)?;

        symbols.insert(node.id.as_str(), sig.provides);
        for cap in sig.effects {
            required
                .entry(*cap)
                .or_insert((node.id.as_str(), sig.name));
        }
        has_sink |= sig.provides == ValueType::Sink;
        signatures.push(sig);
    }

    if let Some((cap, (node, primitive))) = required
        .iter()
        .find(|(cap, _)| !manifest.capabilities.contains(*cap))
    {
        return Err(ToolsmithError::MissingCapability {
            capability: *cap,
            node: (*node).to_string(),
            primitive: (*primitive).to_string(),
        });
    }

    if !has_sink {
        return Err(ToolsmithError::NoEffect);
    }

    let required: BTreeSet<Capability> = required.into_keys().collect();
    debug!(
        app = %manifest.app,
        nodes = signatures.len(),
        capabilities = required.len(),
        "manifest validated"
    );

    Ok(ValidatedGraph {
        manifest,
        signatures,
        required,
    })
}

fn invalid_param(node: &NodeSpec, sig: &PrimitiveSignature, slot: &str, detail: String) -> ToolsmithError {
    ToolsmithError::InvalidParam {
        node: node.id.clone(),
        primitive: sig.name.to_string(),
        slot: slot.to_string(),
        detail,
        accepted: sig.describe_slots(),
    }
}

fn check_params(node: &NodeSpec, sig: &PrimitiveSignature) -> Result<(), ToolsmithError> {
    for (name, value) in &node.params {
        let Some(slot) = sig.param(name) else {
            return Err(invalid_param(node, sig, name, format!("unknown param \"{name}\"")));
        };
        if !value.matches(slot.kind) {
            return Err(invalid_param(
                node,
                sig,
                name,
                format!(
                    "param \"{name}\" must be {}, got {}",
                    slot.kind,
                    value.describe()
                ),
            ));
        }
    }
    for slot in sig.params.iter().filter(|p| p.required) {
        if !node.params.contains_key(slot.name) {
            return Err(invalid_param(
                node,
                sig,
                slot.name,
                format!("missing required param \"{}\" ({})", slot.name, slot.kind),
            ));
        }
    }
    Ok(())
}

fn check_binds(
    node: &NodeSpec,
    sig: &PrimitiveSignature,
    symbols: &BTreeMap<&str, ValueType>,
) -> Result<(), ToolsmithError> {
    if let Some(name) = node.bind.keys().find(|name| sig.bind(name).is_none()) {
        return Err(invalid_param(node, sig, name, format!("unknown bind slot \"{name}\"")));
    }

    for slot in sig.binds {
        let Some(target) = node.bind.get(slot.name) else {
            if slot.required {
                return Err(ToolsmithError::UndefinedReference {
                    node: node.id.clone(),
                    slot: slot.name.to_string(),
                    target: String::new(),
                    expected: slot.ty,
                });
            }
            continue;
        };
        let found = symbols
            .get(target.as_str())
            .copied()
            .ok_or_else(|| ToolsmithError::UndefinedReference {
                node: node.id.clone(),
                slot: slot.name.to_string(),
                target: target.clone(),
                expected: slot.ty,
            })?;
        if found != slot.ty {
            return Err(ToolsmithError::TypeMismatch {
                node: node.id.clone(),
                slot: slot.name.to_string(),
                source_node: target.clone(),
                expected: slot.ty,
                found,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn check(source: &str) -> Result<ValidatedGraph, ToolsmithError> {
        validate(Manifest::parse(source)?, &Catalog::builtin())
    }

    #[test]
    fn accepts_sum() {
        let g = check(
            r#"{"app": "sum", "capabilities": ["io_write"], "nodes": [
                {"id": "a", "use": "const_num", "params": {"value": 13}},
                {"id": "b", "use": "const_num", "params": {"value": 29}},
                {"id": "s", "use": "add", "bind": {"lhs": "a", "rhs": "b"}},
                {"id": "out", "use": "print_num", "bind": {"value": "s"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(g.provided_type("s"), Some(ValueType::Num));
        assert_eq!(g.provided_type("out"), Some(ValueType::Sink));
        assert_eq!(
            g.required_capabilities().iter().copied().collect::<Vec<_>>(),
            vec![Capability::IoWrite]
        );
    }

    #[test]
    fn forward_reference_is_undefined() {
        let err = check(
            r#"{"app": "x", "capabilities": ["io_write"], "nodes": [
                {"id": "out", "use": "print_num", "bind": {"value": "a"}},
                {"id": "a", "use": "const_num", "params": {"value": 1}}
            ]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UndefinedReference);
    }

    #[test]
    fn self_reference_is_undefined() {
        let err = check(
            r#"{"app": "x", "capabilities": ["io_write"], "nodes": [
                {"id": "n", "use": "not_bool", "bind": {"value": "n"}},
                {"id": "out", "use": "print_bool", "bind": {"value": "n"}}
            ]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UndefinedReference);
    }

    #[test]
    fn type_mismatch_names_both_types() {
        let err = check(
            r#"{"app": "x", "capabilities": ["io_write"], "nodes": [
                {"id": "t", "use": "const_str", "params": {"value": "hi"}},
                {"id": "out", "use": "print_num", "bind": {"value": "t"}}
            ]}"#,
        )
        .unwrap_err();
        match err {
            ToolsmithError::TypeMismatch { expected, found, .. } => {
                assert_eq!(expected, ValueType::Num);
                assert_eq!(found, ValueType::Str);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_required_bind() {
        let err = check(
            r#"{"app": "x", "capabilities": ["io_write"], "nodes": [
                {"id": "out", "use": "print_num"}
            ]}"#,
        )
        .unwrap_err();
        match err {
            ToolsmithError::UndefinedReference { slot, target, .. } => {
                assert_eq!(slot, "value");
                assert!(target.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn param_errors_are_invalid_param() {
        let cases = [
            r#"{"id": "a", "use": "const_num", "params": {"value": "13"}}"#,
            r#"{"id": "a", "use": "const_num"}"#,
            r#"{"id": "a", "use": "const_num", "params": {"value": 1, "extra": 2}}"#,
            r#"{"id": "a", "use": "arg_num", "params": {"index": 1.5}}"#,
            r#"{"id": "a", "use": "const_num", "params": {"value": 1}, "bind": {"x": "y"}}"#,
        ];
        for node in cases {
            let src = format!(r#"{{"app": "x", "capabilities": [], "nodes": [{node}]}}"#);
            let err = check(&src).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParam, "{node}");
        }
    }

    #[test]
    fn optional_slots_may_be_omitted() {
        let g = check(
            r#"{"app": "greet", "capabilities": ["io_read", "io_write"], "nodes": [
                {"id": "name", "use": "read_stdin"},
                {"id": "msg", "use": "format_str", "params": {"template": "hello {1}"}, "bind": {"v1": "name"}},
                {"id": "out", "use": "print_str", "bind": {"value": "msg"}}
            ]}"#,
        );
        assert!(g.is_ok());
    }

    #[test]
    fn missing_capability_names_first_in_order() {
        let err = check(
            r#"{"app": "x", "capabilities": [], "nodes": [
                {"id": "body", "use": "http_get", "params": {"url": "http://example.com"}},
                {"id": "dir", "use": "cwd"},
                {"id": "out", "use": "print_str", "bind": {"value": "body"}}
            ]}"#,
        )
        .unwrap_err();
        match err {
            ToolsmithError::MissingCapability { capability, node, .. } => {
                assert_eq!(capability, Capability::EnvRead);
                assert_eq!(node, "dir");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn no_sink_is_no_effect() {
        let err = check(
            r#"{"app": "x", "capabilities": [], "nodes": [
                {"id": "a", "use": "const_num", "params": {"value": 1}}
            ]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoEffect);
    }

    #[test]
    fn exit_code_alone_is_an_effect() {
        assert!(check(
            r#"{"app": "x", "capabilities": [], "nodes": [
                {"id": "a", "use": "const_num", "params": {"value": 3}},
                {"id": "e", "use": "exit_code", "bind": {"code": "a"}}
            ]}"#,
        )
        .is_ok());
    }

    #[test]
    fn extra_declared_capabilities_are_allowed() {
        let g = check(
            r#"{"app": "x", "capabilities": ["io_write", "net_read"], "nodes": [
                {"id": "a", "use": "const_bool", "params": {"value": true}},
                {"id": "out", "use": "print_bool", "bind": {"value": "a"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(g.declared_capabilities().len(), 2);
        assert_eq!(g.required_capabilities().len(), 1);
    }
}
