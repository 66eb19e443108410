//! Tests for scoped variable resolution and substitution

use crate::resolver::Resolver;
use indexmap::IndexMap;
use std::sync::Arc;

fn scope(pairs: &[(&str, &str)]) -> Arc<IndexMap<String, String>> {
    Arc::new(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

#[test]
fn substitute_without_placeholders_is_identity() {
    let resolver = Resolver::new();
    assert_eq!(resolver.substitute("plain text"), "plain text");
    assert_eq!(resolver.substitute(""), "");
    assert_eq!(resolver.substitute("a } b $ c"), "a } b $ c");
}

#[test]
fn substitute_never_fails_on_missing_keys() {
    let resolver = Resolver::new();
    assert_eq!(resolver.substitute("${missing}"), "${missing}");
    assert_eq!(resolver.substitute("x ${a} y ${b} z"), "x ${a} y ${b} z");
}

#[test]
fn substitute_replaces_bound_keys() {
    let resolver = Resolver::with_scopes(vec![scope(&[("name", "n1"), ("port", "4061")])]);
    assert_eq!(
        resolver.substitute("tcp -h ${name} -p ${port}"),
        "tcp -h n1 -p 4061"
    );
}

#[test]
fn substitute_leaves_unterminated_placeholder_literal() {
    let resolver = Resolver::with_scopes(vec![scope(&[("a", "1")])]);
    assert_eq!(resolver.substitute("${a} ${open"), "1 ${open");
}

#[test]
fn substitution_is_recursive_through_values() {
    let resolver =
        Resolver::with_scopes(vec![scope(&[("outer", "${inner}/data"), ("inner", "/srv")])]);
    assert_eq!(resolver.substitute("${outer}"), "/srv/data");
}

#[test]
fn self_referential_value_terminates() {
    let resolver = Resolver::with_scopes(vec![scope(&[("loop", "${loop}")])]);
    // Depth-capped: terminates and leaves the placeholder literal.
    assert_eq!(resolver.substitute("${loop}"), "${loop}");
}

#[test]
fn scope_precedence_most_specific_wins() {
    let resolver = Resolver::with_scopes(vec![scope(&[("a", "2")]), scope(&[("a", "1")])]);
    assert_eq!(resolver.find("a"), Some("2"));
}

#[test]
fn put_overrides_scope_chain_and_reports_change() {
    let mut resolver = Resolver::with_scopes(vec![scope(&[("a", "1")])]);
    assert_eq!(resolver.find("a"), Some("1"));
    assert!(resolver.put("a", "2"));
    assert_eq!(resolver.find("a"), Some("2"));
    assert!(!resolver.put("a", "2"));
}

#[test]
fn computed_keys_shadow_everything() {
    let mut resolver = Resolver::with_scopes(vec![scope(&[("node", "fake")])]);
    resolver.set_computed("node", "n1");
    assert_eq!(resolver.find("node"), Some("n1"));
    // A put against a computed key does not change the effective value.
    assert!(!resolver.put("node", "other"));
    assert_eq!(resolver.find("node"), Some("n1"));
}

#[test]
fn set_computed_reports_change() {
    let mut resolver = Resolver::new();
    assert!(resolver.set_computed("node.os", "Linux"));
    assert!(!resolver.set_computed("node.os", "Linux"));
    assert!(resolver.set_computed("node.os", "Darwin"));
}

#[test]
fn derive_layers_extra_scopes_on_top() {
    let mut parent = Resolver::with_scopes(vec![scope(&[("a", "base"), ("b", "base")])]);
    parent.set_computed("node", "n1");
    parent.put("c", "local");

    let child = parent.derive(vec![scope(&[("a", "override")])]);
    assert_eq!(child.find("a"), Some("override"));
    assert_eq!(child.find("b"), Some("base"));
    // Parent locals stay visible downstream.
    assert_eq!(child.find("c"), Some("local"));
    // Computed keys carry over.
    assert_eq!(child.find("node"), Some("n1"));
}

#[test]
fn reset_rebuilds_the_chain_and_clears_locals() {
    let mut resolver = Resolver::with_scopes(vec![scope(&[("a", "old")])]);
    resolver.put("b", "local");
    resolver.reset(vec![scope(&[("a", "new")])], IndexMap::new());
    assert_eq!(resolver.find("a"), Some("new"));
    assert_eq!(resolver.find("b"), None);
}
