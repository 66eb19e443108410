//! Property-set flattening
//!
//! A [`PropertySet`](crate::descriptor::PropertySet) may reference other
//! named property sets, forming a tree of references. Expansion flattens it
//! into a single ordered key/value mapping: references are expanded
//! depth-first in listed order, later definitions of a key overwrite earlier
//! ones, and the set's own properties are applied last so local definitions
//! always win over referenced ones.

use crate::descriptor::PropertySet;
use crate::error::{Result, TopologyError};
use crate::resolver::Resolver;
use indexmap::IndexMap;

/// Scope-chained lookup for named property sets (node-local definitions
/// shadow application-level ones).
pub type PropertySetLookup<'a> = dyn Fn(&str) -> Option<&'a PropertySet> + 'a;

/// Flatten `set` into an ordered map, substituting every name and value
/// through `resolver`.
///
/// An absent named reference is a protocol violation
/// ([`TopologyError::PropertySetNotFound`]); a reference cycle is a
/// configuration error ([`TopologyError::PropertySetCycle`]) recorded on the
/// owning entity by the caller.
pub fn expand_property_set<'a>(
    set: &PropertySet,
    resolver: &Resolver,
    lookup: &PropertySetLookup<'a>,
) -> Result<IndexMap<String, String>> {
    let mut flattened = IndexMap::new();
    let mut visiting = Vec::new();
    expand_into(set, resolver, lookup, &mut flattened, &mut visiting)?;
    Ok(flattened)
}

fn expand_into<'a>(
    set: &PropertySet,
    resolver: &Resolver,
    lookup: &PropertySetLookup<'a>,
    flattened: &mut IndexMap<String, String>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    for reference in &set.references {
        let name = resolver.substitute(reference);
        if visiting.iter().any(|seen| *seen == name) {
            return Err(TopologyError::PropertySetCycle(name));
        }
        let referenced =
            lookup(&name).ok_or_else(|| TopologyError::PropertySetNotFound(name.clone()))?;
        visiting.push(name);
        expand_into(referenced, resolver, lookup, flattened, visiting)?;
        visiting.pop();
    }
    for property in &set.properties {
        flattened.insert(
            resolver.substitute(&property.name),
            resolver.substitute(&property.value),
        );
    }
    Ok(())
}
