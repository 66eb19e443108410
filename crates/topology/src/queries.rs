//! Derived queries over the mirrored tree
//!
//! Read-only lookups used by editors and remote-action dispatchers: effective
//! property maps, per-application load factors, and scope-chained named
//! property-set resolution (node-local definitions shadow application-level
//! ones).

use crate::descriptor::{ComponentSpec, NodeState, ProcessSpec, PropertySet};
use crate::entity::{EntityBody, EntityKey, Topology};
use crate::error::{Result, TopologyError};
use crate::properties::expand_property_set;
use indexmap::IndexMap;

impl Topology {
    /// Find a process child of `node` by id.
    pub fn find_process(&self, node: EntityKey, id: &str) -> Option<EntityKey> {
        let body = self.get(node)?.as_node().ok()?;
        body.processes
            .iter()
            .copied()
            .find(|key| self.get(*key).is_some_and(|e| e.id == id))
    }

    /// Find an endpoint group by id anywhere under `node` (directly under a
    /// process or under one of its hosted components).
    pub fn find_endpoint_group(&self, node: EntityKey, id: &str) -> Option<EntityKey> {
        let body = self.get(node)?.as_node().ok()?;
        for process_key in &body.processes {
            let Some(process) = self.get(*process_key) else {
                continue;
            };
            let Ok(process_body) = process.as_process() else {
                continue;
            };
            for group_key in &process_body.endpoint_groups {
                if self.get(*group_key).is_some_and(|e| e.id == id) {
                    return Some(*group_key);
                }
            }
            for component_key in &process_body.components {
                let Some(component) = self.get(*component_key) else {
                    continue;
                };
                let Ok(component_body) = component.as_component() else {
                    continue;
                };
                for group_key in &component_body.endpoint_groups {
                    if self.get(*group_key).is_some_and(|e| e.id == id) {
                        return Some(*group_key);
                    }
                }
            }
        }
        None
    }

    /// Scope-chained named property-set lookup: the node-local definition
    /// bound for `app` wins over the application-level one.
    pub fn find_named_property_set(
        &self,
        node: EntityKey,
        app: &str,
        name: &str,
    ) -> Option<&PropertySet> {
        let node_local = self
            .get(node)
            .and_then(|entity| entity.as_node().ok())
            .and_then(|body| body.bindings.get(app))
            .and_then(|binding| binding.deployment.property_sets.get(name));
        node_local.or_else(|| {
            self.application(app)
                .and_then(|scope| scope.property_sets.get(name))
        })
    }

    /// Effective property map of a process or hosted component: the entity's
    /// own property set expanded through its resolver, with the
    /// instance-level override (if templated) expanded on top, so instance
    /// properties win on key collision.
    pub fn get_properties(&self, key: EntityKey) -> Result<IndexMap<String, String>> {
        let entity = self
            .get(key)
            .ok_or_else(|| TopologyError::StaleEntity(key.to_string()))?;
        let (own_set, override_set, owner_key) = match &entity.body {
            EntityBody::Process(body) => {
                let override_set = match &body.source {
                    Some(ProcessSpec::FromTemplate(instance)) => {
                        Some(instance.property_set.clone())
                    }
                    _ => None,
                };
                (body.descriptor.property_set.clone(), override_set, key)
            }
            EntityBody::HostedComponent(body) => {
                let override_set = match &body.source {
                    Some(ComponentSpec::FromTemplate(instance)) => {
                        Some(instance.property_set.clone())
                    }
                    _ => None,
                };
                let owner = entity.parent.unwrap_or(key);
                (body.descriptor.property_set.clone(), override_set, owner)
            }
            _ => {
                return Err(TopologyError::WrongEntityKind(
                    entity.id.clone(),
                    "process or hosted component",
                ))
            }
        };

        let (app_name, node_key) = self.owning_scope(owner_key);
        let empty = Default::default();
        let app = app_name
            .as_deref()
            .and_then(|name| self.application(name))
            .cloned()
            .unwrap_or(empty);
        let lookup = |name: &str| match node_key {
            Some(node) => self.find_named_property_set(node, &app.name, name),
            None => app.property_sets.get(name),
        };

        let mut properties = expand_property_set(&own_set, &entity.resolver, &lookup)?;
        if let Some(override_set) = override_set {
            let overrides = expand_property_set(&override_set, &entity.resolver, &lookup)?;
            properties.extend(overrides);
        }
        Ok(properties)
    }

    /// Per-application load factors declared on `node`, substituted through
    /// each binding's resolver.
    pub fn get_load_factors(&self, node: EntityKey) -> IndexMap<String, String> {
        let mut factors = IndexMap::new();
        let Some(body) = self.get(node).and_then(|e| e.as_node().ok()) else {
            return factors;
        };
        for (app, binding) in &body.bindings {
            if let Some(load_factor) = &binding.deployment.load_factor {
                factors.insert(app.clone(), binding.resolver.substitute(load_factor));
            }
        }
        factors
    }

    /// Last load sample reported for `node`, if it is up and was polled.
    pub fn load_average(&self, node: EntityKey) -> Option<crate::descriptor::LoadSample> {
        self.get(node).and_then(|e| e.as_node().ok())?.load
    }

    /// Lifecycle state of `node`.
    pub fn node_state(&self, node: EntityKey) -> Option<NodeState> {
        Some(self.get(node)?.as_node().ok()?.state)
    }

    fn owning_scope(&self, key: EntityKey) -> (Option<String>, Option<EntityKey>) {
        let mut cursor = Some(key);
        let mut app = None;
        while let Some(k) = cursor {
            let Some(entity) = self.get(k) else { break };
            match &entity.body {
                EntityBody::Process(body) => app = body.application.clone(),
                EntityBody::Node(_) => return (app, Some(k)),
                _ => {}
            }
            cursor = entity.parent;
        }
        (app, None)
    }
}
