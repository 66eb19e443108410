//! Scoped variable lookup and `${name}` substitution
//!
//! A [`Resolver`] layers an ordered chain of immutable variable maps (most
//! specific first: instance parameters, template parameter defaults,
//! enclosing-scope variables) under a small mutable top scope and a set of
//! reserved computed keys (current node, current application, host facts).
//! Substitution is total: it never fails, and unresolved placeholders are
//! left literal in the output.

use indexmap::IndexMap;
use std::sync::Arc;

/// How deep substitution follows variables whose values themselves contain
/// `${}` placeholders before giving up and leaving the placeholder literal.
const MAX_SUBSTITUTION_DEPTH: usize = 16;

/// Scoped key/value resolver with override semantics.
///
/// Lookup precedence, highest first:
/// 1. computed keys (reserved, set by the system, never shadowed),
/// 2. the mutable top scope written by [`Resolver::put`],
/// 3. the immutable scope chain, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolver {
    computed: IndexMap<String, String>,
    locals: IndexMap<String, String>,
    scopes: Vec<Arc<IndexMap<String, String>>>,
}

impl Resolver {
    /// An empty resolver with no scopes bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver over the given immutable scope chain, most specific first.
    pub fn with_scopes(scopes: Vec<Arc<IndexMap<String, String>>>) -> Self {
        Self {
            scopes,
            ..Self::default()
        }
    }

    /// Derive a child resolver: `extra` scopes take precedence over this
    /// resolver's own chain, and computed keys are carried over.
    ///
    /// The parent's top scope, if non-empty, is frozen into the child's
    /// chain so values written with `put` remain visible downstream.
    pub fn derive(&self, extra: Vec<Arc<IndexMap<String, String>>>) -> Resolver {
        let mut scopes = extra;
        if !self.locals.is_empty() {
            scopes.push(Arc::new(self.locals.clone()));
        }
        scopes.extend(self.scopes.iter().cloned());
        Resolver {
            computed: self.computed.clone(),
            locals: IndexMap::new(),
            scopes,
        }
    }

    /// Look a key up across computed keys, the top scope, then the chain.
    pub fn find(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.computed.get(key) {
            return Some(value.as_str());
        }
        if let Some(value) = self.locals.get(key) {
            return Some(value.as_str());
        }
        self.scopes
            .iter()
            .find_map(|scope| scope.get(key))
            .map(String::as_str)
    }

    /// Insert or overwrite `key` in the top scope.
    ///
    /// Returns whether the *effective* value of the key changed; writing a
    /// value that a computed key already shadows reports `false`.
    pub fn put(&mut self, key: &str, value: &str) -> bool {
        let before = self.find(key).map(str::to_string);
        self.locals.insert(key.to_string(), value.to_string());
        self.find(key) != before.as_deref()
    }

    /// Set a reserved computed key, reporting whether its value changed.
    pub fn set_computed(&mut self, key: &str, value: &str) -> bool {
        let changed = self.computed.get(key).map(String::as_str) != Some(value);
        self.computed.insert(key.to_string(), value.to_string());
        changed
    }

    /// Remove a reserved computed key, reporting whether it was present.
    pub fn clear_computed(&mut self, key: &str) -> bool {
        self.computed.shift_remove(key).is_some()
    }

    /// Rebuild the scope chain in place, keeping entity identity.
    ///
    /// The top scope is cleared and computed keys are replaced. Every string
    /// previously derived from this resolver is invalid afterwards; callers
    /// must re-run substitution on all dependent fields.
    pub fn reset(
        &mut self,
        scopes: Vec<Arc<IndexMap<String, String>>>,
        computed: IndexMap<String, String>,
    ) {
        self.locals.clear();
        self.scopes = scopes;
        self.computed = computed;
    }

    /// Snapshot of the computed keys, used when deriving sibling resolvers.
    pub fn computed(&self) -> &IndexMap<String, String> {
        &self.computed
    }

    /// Replace every `${key}` occurrence in `template` with the bound value.
    ///
    /// Total: never fails. Unresolved keys are left literal, so a string
    /// without any `${}` occurrence is returned unchanged.
    pub fn substitute(&self, template: &str) -> String {
        self.substitute_at(template, 0)
    }

    fn substitute_at(&self, template: &str, depth: usize) -> String {
        if depth >= MAX_SUBSTITUTION_DEPTH || !template.contains("${") {
            return template.to_string();
        }
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    match self.find(key) {
                        Some(value) => {
                            // Bound values may themselves carry placeholders.
                            let expanded = self.substitute_at(value, depth + 1);
                            out.push_str(&expanded);
                        }
                        None => {
                            out.push_str("${");
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated placeholder stays literal.
                    out.push_str("${");
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}
