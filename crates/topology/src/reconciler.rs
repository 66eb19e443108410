//! Event reconciliation
//!
//! Applies inbound update notifications to the mirrored tree, computing
//! minimal structural deltas and triggering selective re-expansion of
//! dependent entities. Events arrive serialized off a single delivery
//! channel, so the reconciler needs no internal locking; the UI layer reads
//! its own copy of the tree and applies the emitted deltas.

use crate::descriptor::{
    ApplicationDescriptor, ApplicationUpdate, ComponentSpec, EndpointGroupDescriptor,
    EndpointGroupDynamicInfo, HostFacts, LoadSample, NodeDeployment, NodeDynamicInfo, NodeState,
    ProcessDescriptor, ProcessDynamicInfo, ProcessSpec, ProcessState, PropertySet,
};
use crate::entity::{
    ComponentBody, EndpointGroupBody, Entity, EntityBody, EntityKey, EntityPath, NodeBinding,
    NodeBody, ProcessBody, Topology,
};
use crate::error::{Result, TopologyError};
use crate::events::{InboundEvent, TreeDelta};
use crate::properties::expand_property_set;
use crate::resolver::Resolver;
use crate::template;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reserved computed key holding the current application name.
pub const APPLICATION_KEY: &str = "application";
/// Reserved computed key holding the current node name.
pub const NODE_KEY: &str = "node";

const FACT_HOSTNAME_KEY: &str = "node.hostname";
const FACT_OS_KEY: &str = "node.os";
const FACT_MACHINE_KEY: &str = "node.machine";
const FACT_CORES_KEY: &str = "node.cores";

/// Applies inbound events to the owned [`Topology`].
#[derive(Debug, Default)]
pub struct Reconciler {
    topology: Topology,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Apply one inbound event, returning the structural deltas it caused.
    ///
    /// Deltas are meaningful in emission order: each one addresses the tree
    /// as left by the deltas before it.
    pub fn apply(&mut self, event: InboundEvent) -> Result<Vec<TreeDelta>> {
        match event {
            InboundEvent::ApplicationAdded(descriptor) => self.application_added(descriptor),
            InboundEvent::ApplicationRemoved(name) => self.application_removed(&name),
            InboundEvent::ApplicationUpdated(update) => self.application_updated(update),
            InboundEvent::NodeUp(info) => self.node_up(info),
            InboundEvent::NodeDown(name) => self.node_down(&name),
            InboundEvent::ProcessStatusChanged { node, info } => {
                self.update_process_status(&node, info)
            }
            InboundEvent::EndpointGroupStatusChanged { node, info } => {
                self.update_endpoint_group_status(&node, info)
            }
            InboundEvent::NodeLoadSampled { target, load } => self.node_load_sampled(target, load),
        }
    }

    // --- application events ---------------------------------------------

    pub fn application_added(&mut self, descriptor: ApplicationDescriptor) -> Result<Vec<TreeDelta>> {
        info!(application = %descriptor.name, "application added");
        let app = descriptor.clone();
        self.topology.register_application(descriptor)?;
        let mut deltas = Vec::new();
        for (node_name, deployment) in &app.nodes {
            self.deploy_to_node(&app, node_name, deployment, &mut deltas)?;
        }
        Ok(deltas)
    }

    pub fn application_removed(&mut self, name: &str) -> Result<Vec<TreeDelta>> {
        info!(application = %name, "application removed");
        self.topology.unregister_application(name)?;
        let mut deltas = Vec::new();
        for node_key in self.topology.nodes().to_vec() {
            self.unbind_application_from_node(node_key, name, &mut deltas)?;
        }
        Ok(deltas)
    }

    pub fn application_updated(&mut self, update: ApplicationUpdate) -> Result<Vec<TreeDelta>> {
        info!(application = %update.name, "application updated");
        let app_name = update.name.clone();
        let mut app = self
            .topology
            .application(&app_name)
            .cloned()
            .ok_or_else(|| TopologyError::ApplicationNotFound(app_name.clone()))?;

        let variables_changed = update.changes_variables();
        let touched_templates: HashSet<String> = update
            .touched_templates()
            .into_iter()
            .map(str::to_string)
            .collect();

        // Merge the diff into the stored scope first, so applying the diff
        // converges to the same tree as registering the merged descriptor.
        for key in &update.remove_variables {
            app.variables.shift_remove(key);
        }
        app.variables.extend(update.variables.clone());
        for key in &update.remove_property_sets {
            app.property_sets.shift_remove(key);
        }
        app.property_sets.extend(update.property_sets.clone());
        for key in &update.remove_process_templates {
            app.process_templates.shift_remove(key);
        }
        app.process_templates.extend(update.process_templates.clone());
        for key in &update.remove_component_templates {
            app.component_templates.shift_remove(key);
        }
        app.component_templates
            .extend(update.component_templates.clone());
        for node_name in &update.remove_nodes {
            app.nodes.shift_remove(node_name);
        }

        let mut deltas = Vec::new();

        for node_name in &update.remove_nodes {
            if let Some(node_key) = self.topology.find_node(node_name) {
                self.unbind_application_from_node(node_key, &app_name, &mut deltas)?;
            }
        }

        // Per-node merge: variables, property sets, then process specs.
        // Removals are matched by the exact entity occupying the id so two
        // structurally-equal instances cannot be confused.
        let mut explicit: HashSet<EntityKey> = HashSet::new();
        let mut node_level_changed: HashSet<String> = HashSet::new();

        for (node_name, node_update) in &update.nodes {
            let deployment = app.nodes.entry(node_name.clone()).or_default();
            if !node_update.variables.is_empty()
                || !node_update.remove_variables.is_empty()
                || !node_update.property_sets.is_empty()
                || !node_update.remove_property_sets.is_empty()
            {
                node_level_changed.insert(node_name.clone());
            }
            for key in &node_update.remove_variables {
                deployment.variables.shift_remove(key);
            }
            deployment.variables.extend(node_update.variables.clone());
            for key in &node_update.remove_property_sets {
                deployment.property_sets.shift_remove(key);
            }
            deployment
                .property_sets
                .extend(node_update.property_sets.clone());
            if let Some(load_factor) = &node_update.load_factor {
                deployment.load_factor = load_factor.clone();
            }
        }

        // Drop removed specs from the merged scope, locating each through
        // the entity currently holding the id.
        for (node_name, node_update) in &update.nodes {
            for removed_id in &node_update.remove_processes {
                let source = self
                    .topology
                    .find_node(node_name)
                    .and_then(|node_key| self.topology.find_process(node_key, removed_id))
                    .and_then(|key| self.topology.get(key))
                    .and_then(|entity| entity.as_process().ok())
                    .and_then(|body| body.source.clone())
                    .ok_or_else(|| TopologyError::ProcessNotFound {
                        id: removed_id.clone(),
                        node: node_name.clone(),
                    })?;
                if let Some(deployment) = app.nodes.get_mut(node_name) {
                    let before = deployment.processes.len();
                    let mut dropped = false;
                    deployment.processes.retain(|spec| {
                        if dropped || *spec != source {
                            true
                        } else {
                            dropped = true;
                            false
                        }
                    });
                    if deployment.processes.len() == before {
                        return Err(TopologyError::ProcessNotFound {
                            id: removed_id.clone(),
                            node: node_name.clone(),
                        });
                    }
                }
            }
        }

        // Upsert added-or-updated specs into the merged scope, replacing the
        // spec producing the same concrete id.
        for (node_name, node_update) in &update.nodes {
            if node_update.processes.is_empty() {
                continue;
            }
            let mut deployment = app.nodes.get(node_name).cloned().unwrap_or_default();
            let facts = self
                .topology
                .find_node(node_name)
                .and_then(|key| self.topology.get(key))
                .and_then(|entity| entity.as_node().ok())
                .and_then(|body| body.facts.clone());
            let resolver = Self::binding_resolver(&app, node_name, &deployment, facts.as_ref());
            let mut existing_ids = Vec::with_capacity(deployment.processes.len());
            for spec in &deployment.processes {
                existing_ids.push(template::concrete_id(&app, &resolver, spec)?);
            }
            for spec in &node_update.processes {
                let id = template::concrete_id(&app, &resolver, spec)?;
                match existing_ids.iter().position(|existing| *existing == id) {
                    Some(position) => deployment.processes[position] = spec.clone(),
                    None => {
                        deployment.processes.push(spec.clone());
                        existing_ids.push(id);
                    }
                }
            }
            app.nodes.insert(node_name.clone(), deployment);
        }

        self.topology.replace_application(app.clone());

        // Entity phase: apply removals, then upserts (insert or in-place
        // rebuild), per node named in the diff.
        for (node_name, node_update) in &update.nodes {
            let node_key = self.find_or_create_node(node_name, &mut deltas);
            self.rebind(node_key, &app, node_name)?;

            if !node_update.remove_processes.is_empty() {
                let mut indices = Vec::new();
                let mut keys = Vec::new();
                for removed_id in &node_update.remove_processes {
                    let key = self
                        .topology
                        .find_process(node_key, removed_id)
                        .ok_or_else(|| TopologyError::ProcessNotFound {
                            id: removed_id.clone(),
                            node: node_name.clone(),
                        })?;
                    indices.push(self.topology.child_index(node_key, key).unwrap_or(0));
                    keys.push(key);
                }
                let parent = self.topology.entity_path(node_key);
                let mut removed = Vec::new();
                for key in keys {
                    if let Some((_, snapshot)) = self.topology.remove_subtree(key) {
                        removed.push(snapshot);
                    }
                }
                deltas.push(TreeDelta::EntitiesRemoved {
                    parent,
                    indices,
                    removed,
                });
            }

            let mut inserted = Vec::new();
            for spec in &node_update.processes {
                let caller = self.binding_of(node_key, &app_name)?.resolver.clone();
                let id = template::concrete_id(&app, &caller, spec)?;
                // A variable change in the same diff may have moved the
                // entity's concrete id; match by re-expanding stored sources
                // under the merged scope before concluding the spec is new.
                let existing = self.topology.find_process(node_key, &id).or_else(|| {
                    self.relocated_process(node_key, &app_name, &app, &caller, &id, &explicit)
                });
                match existing {
                    Some(existing) => {
                        explicit.insert(existing);
                        if let Some(delta) =
                            self.rebuild_process(node_key, existing, &app, Some(spec))?
                        {
                            deltas.push(delta);
                        }
                    }
                    None => {
                        let key = self.build_process_entity(node_key, &app, spec)?;
                        explicit.insert(key);
                        inserted.push(key);
                    }
                }
            }
            if !inserted.is_empty() {
                let parent = self.topology.entity_path(node_key);
                let mut indices: Vec<usize> = inserted
                    .iter()
                    .filter_map(|key| self.topology.child_index(node_key, *key))
                    .collect();
                indices.sort_unstable();
                deltas.push(TreeDelta::EntitiesInserted { parent, indices });
            }
        }

        // Cascade: variable, property-set and template changes flow through
        // the resolver scope chain to every dependent process, not just the
        // ones the diff names. Re-expansion is deterministic, so rebuilding
        // an unaffected process emits nothing.
        for node_key in self.topology.nodes().to_vec() {
            let (node_name, bound, candidates) = {
                let Some(entity) = self.topology.get(node_key) else {
                    continue;
                };
                let Ok(body) = entity.as_node() else { continue };
                (
                    entity.id.clone(),
                    body.bindings.contains_key(&app_name),
                    body.processes.clone(),
                )
            };
            if !bound {
                continue;
            }
            self.rebind(node_key, &app, &node_name)?;
            let node_changed = node_level_changed.contains(&node_name);
            for process_key in candidates {
                if explicit.contains(&process_key) {
                    continue;
                }
                let Some(process) = self.topology.get(process_key) else {
                    continue;
                };
                let Ok(process_body) = process.as_process() else {
                    continue;
                };
                if process_body.application.as_deref() != Some(app_name.as_str()) {
                    continue;
                }
                let template_touched = process_body
                    .source
                    .as_ref()
                    .is_some_and(|spec| Self::spec_uses_template(&app, spec, &touched_templates));
                if variables_changed || node_changed || template_touched {
                    if let Some(delta) = self.rebuild_process(node_key, process_key, &app, None)? {
                        deltas.push(delta);
                    }
                }
            }
        }

        Ok(deltas)
    }

    // --- node events ------------------------------------------------------

    pub fn node_up(&mut self, info: NodeDynamicInfo) -> Result<Vec<TreeDelta>> {
        info!(node = %info.name, "node up");
        let mut deltas = Vec::new();
        let node_key = self.find_or_create_node(&info.name, &mut deltas);
        let node_path = self.topology.entity_path(node_key);

        let mut facts_changed = false;
        let bound_apps: Vec<String>;
        {
            let Some(entity) = self.topology.get_mut(node_key) else {
                return Ok(deltas);
            };
            facts_changed |= apply_facts(&mut entity.resolver, &info.facts);
            let body = entity.as_node_mut()?;
            facts_changed |= body.facts.as_ref() != Some(&info.facts);
            body.state = NodeState::Up;
            body.since = Some(Utc::now());
            body.facts = Some(info.facts.clone());
            for binding in body.bindings.values_mut() {
                apply_facts(&mut binding.resolver, &info.facts);
            }
            bound_apps = body.bindings.keys().cloned().collect();
        }
        deltas.push(TreeDelta::EntityChanged {
            path: node_path.clone(),
        });

        // Host facts are computed keys; once they become known, deployed
        // descriptors referencing them must be re-expanded.
        if facts_changed {
            for app_name in bound_apps {
                let Some(app) = self.topology.application(&app_name).cloned() else {
                    continue;
                };
                let processes: Vec<EntityKey> = {
                    let Some(entity) = self.topology.get(node_key) else {
                        continue;
                    };
                    entity.as_node()?.processes.clone()
                };
                for process_key in processes {
                    let owned = self
                        .topology
                        .get(process_key)
                        .and_then(|e| e.as_process().ok())
                        .is_some_and(|body| body.application.as_deref() == Some(app_name.as_str()));
                    if owned {
                        if let Some(delta) =
                            self.rebuild_process(node_key, process_key, &app, None)?
                        {
                            deltas.push(delta);
                        }
                    }
                }
            }
        }

        // Overlay live process status; a reported process the tree does not
        // know becomes a dynamic-only entity.
        let mut inserted = Vec::new();
        for process_info in &info.processes {
            match self.topology.find_process(node_key, &process_info.id) {
                Some(process_key) => {
                    if self.overlay_process_status(process_key, process_info)? {
                        deltas.push(TreeDelta::EntityChanged {
                            path: self.topology.entity_path(process_key),
                        });
                    }
                }
                None => {
                    let key = self.insert_dynamic_process(node_key, process_info)?;
                    inserted.push(key);
                }
            }
        }
        if !inserted.is_empty() {
            let mut indices: Vec<usize> = inserted
                .iter()
                .filter_map(|key| self.topology.child_index(node_key, *key))
                .collect();
            indices.sort_unstable();
            deltas.push(TreeDelta::EntitiesInserted {
                parent: node_path,
                indices,
            });
        }

        for group_info in &info.endpoint_groups {
            match self.topology.find_endpoint_group(node_key, &group_info.id) {
                Some(group_key) => {
                    if self.overlay_endpoint_group_status(group_key, group_info)? {
                        deltas.push(TreeDelta::EntityChanged {
                            path: self.topology.entity_path(group_key),
                        });
                    }
                }
                None => {
                    warn!(node = %info.name, group = %group_info.id,
                        "node reported an endpoint group the mirror does not know");
                }
            }
        }

        Ok(deltas)
    }

    pub fn node_down(&mut self, name: &str) -> Result<Vec<TreeDelta>> {
        let Some(node_key) = self.topology.find_node(name) else {
            warn!(node = %name, "node down for a node the mirror does not know");
            return Ok(Vec::new());
        };
        info!(node = %name, "node down");
        let mut deltas = Vec::new();
        let node_path = self.topology.entity_path(node_key);

        // Dynamic-only processes exist purely because the node reported
        // them; they go away with the node's reachability.
        let dynamic: Vec<EntityKey> = {
            let Some(entity) = self.topology.get(node_key) else {
                return Ok(deltas);
            };
            let body = entity.as_node()?;
            body.processes
                .iter()
                .copied()
                .filter(|key| {
                    self.topology
                        .get(*key)
                        .and_then(|e| e.as_process().ok())
                        .is_some_and(|p| p.application.is_none())
                })
                .collect()
        };
        if !dynamic.is_empty() {
            let indices: Vec<usize> = dynamic
                .iter()
                .filter_map(|key| self.topology.child_index(node_key, *key))
                .collect();
            let mut removed = Vec::new();
            for key in dynamic {
                if let Some((_, snapshot)) = self.topology.remove_subtree(key) {
                    removed.push(snapshot);
                }
            }
            deltas.push(TreeDelta::EntitiesRemoved {
                parent: node_path.clone(),
                indices,
                removed,
            });
        }

        let survivors: Vec<EntityKey> = {
            let Some(entity) = self.topology.get_mut(node_key) else {
                return Ok(deltas);
            };
            entity.resolver.clear_computed(FACT_HOSTNAME_KEY);
            entity.resolver.clear_computed(FACT_OS_KEY);
            entity.resolver.clear_computed(FACT_MACHINE_KEY);
            entity.resolver.clear_computed(FACT_CORES_KEY);
            let body = entity.as_node_mut()?;
            body.state = NodeState::Down;
            body.facts = None;
            body.load = None;
            body.since = None;
            for binding in body.bindings.values_mut() {
                binding.resolver.clear_computed(FACT_HOSTNAME_KEY);
                binding.resolver.clear_computed(FACT_OS_KEY);
                binding.resolver.clear_computed(FACT_MACHINE_KEY);
                binding.resolver.clear_computed(FACT_CORES_KEY);
            }
            body.processes.clone()
        };

        for process_key in survivors {
            self.clear_dynamic_status(process_key)?;
            deltas.push(TreeDelta::EntityChanged {
                path: self.topology.entity_path(process_key),
            });
        }

        // Only a node with zero deployed processes is pruned on down; a node
        // that still hosts statically-deployed processes survives as a
        // structural placeholder.
        let empty = self
            .topology
            .get(node_key)
            .and_then(|e| e.as_node().ok())
            .is_some_and(|body| body.processes.is_empty());
        if empty {
            if let Some((index, snapshot)) = self.topology.remove_subtree(node_key) {
                deltas.push(TreeDelta::EntitiesRemoved {
                    parent: EntityPath::root(),
                    indices: vec![index],
                    removed: vec![snapshot],
                });
            }
        } else {
            deltas.push(TreeDelta::EntityChanged { path: node_path });
        }

        Ok(deltas)
    }

    // --- status overlays --------------------------------------------------

    pub fn update_process_status(
        &mut self,
        node: &str,
        info: ProcessDynamicInfo,
    ) -> Result<Vec<TreeDelta>> {
        let Some(node_key) = self.topology.find_node(node) else {
            warn!(node = %node, process = %info.id, "process status for unknown node");
            return Ok(Vec::new());
        };
        let Some(process_key) = self.topology.find_process(node_key, &info.id) else {
            warn!(node = %node, process = %info.id, "process status for unknown process");
            return Ok(Vec::new());
        };
        if self.overlay_process_status(process_key, &info)? {
            Ok(vec![TreeDelta::EntityChanged {
                path: self.topology.entity_path(process_key),
            }])
        } else {
            Ok(Vec::new())
        }
    }

    pub fn update_endpoint_group_status(
        &mut self,
        node: &str,
        info: EndpointGroupDynamicInfo,
    ) -> Result<Vec<TreeDelta>> {
        let Some(node_key) = self.topology.find_node(node) else {
            warn!(node = %node, group = %info.id, "endpoint group status for unknown node");
            return Ok(Vec::new());
        };
        let Some(group_key) = self.topology.find_endpoint_group(node_key, &info.id) else {
            warn!(node = %node, group = %info.id, "endpoint group status for unknown group");
            return Ok(Vec::new());
        };
        if self.overlay_endpoint_group_status(group_key, &info)? {
            Ok(vec![TreeDelta::EntityChanged {
                path: self.topology.entity_path(group_key),
            }])
        } else {
            Ok(Vec::new())
        }
    }

    /// Completion of an asynchronous load poll. The sample is dropped if
    /// the node was removed since the poll was issued; keys are never
    /// reused, so this check is by identity, not by id.
    pub fn node_load_sampled(&mut self, target: EntityKey, load: LoadSample) -> Result<Vec<TreeDelta>> {
        let Some(entity) = self.topology.get_mut(target) else {
            debug!(%target, "discarding load sample for a removed node");
            return Ok(Vec::new());
        };
        let body = entity.as_node_mut()?;
        if body.load == Some(load) {
            return Ok(Vec::new());
        }
        body.load = Some(load);
        Ok(vec![TreeDelta::EntityChanged {
            path: self.topology.entity_path(target),
        }])
    }

    // --- internals ---------------------------------------------------------

    fn find_or_create_node(&mut self, name: &str, deltas: &mut Vec<TreeDelta>) -> EntityKey {
        if let Some(key) = self.topology.find_node(name) {
            return key;
        }
        let mut resolver = Resolver::new();
        resolver.set_computed(NODE_KEY, name);
        let entity = Entity::new(name, resolver, EntityBody::Node(NodeBody::default()));
        let (key, index) = self.topology.insert_node(entity);
        deltas.push(TreeDelta::EntitiesInserted {
            parent: EntityPath::root(),
            indices: vec![index],
        });
        key
    }

    /// Whether re-expanding `spec` would read any of the `touched` templates:
    /// the process template it instantiates, or a component template
    /// instantiated by one of its hosted components.
    fn spec_uses_template(
        app: &ApplicationDescriptor,
        spec: &ProcessSpec,
        touched: &HashSet<String>,
    ) -> bool {
        if touched.is_empty() {
            return false;
        }
        match spec {
            ProcessSpec::Direct(descriptor) => {
                Self::components_use_template(&descriptor.components, touched)
            }
            ProcessSpec::FromTemplate(instance) => {
                touched.contains(&instance.template)
                    || app.process_templates.get(&instance.template).is_some_and(|template| {
                        Self::components_use_template(&template.descriptor.components, touched)
                    })
            }
        }
    }

    fn components_use_template(components: &[ComponentSpec], touched: &HashSet<String>) -> bool {
        components.iter().any(|spec| {
            matches!(spec, ComponentSpec::FromTemplate(instance) if touched.contains(&instance.template))
        })
    }

    fn binding_resolver(
        app: &ApplicationDescriptor,
        node_name: &str,
        deployment: &NodeDeployment,
        facts: Option<&HostFacts>,
    ) -> Resolver {
        let mut resolver = Resolver::with_scopes(vec![
            Arc::new(deployment.variables.clone()),
            Arc::new(app.variables.clone()),
        ]);
        resolver.set_computed(APPLICATION_KEY, &app.name);
        resolver.set_computed(NODE_KEY, node_name);
        if let Some(facts) = facts {
            apply_facts(&mut resolver, facts);
        }
        resolver
    }

    /// (Re)establish the (node × application) binding from the stored scope.
    fn rebind(&mut self, node_key: EntityKey, app: &ApplicationDescriptor, node_name: &str) -> Result<()> {
        let deployment = app.nodes.get(node_name).cloned().unwrap_or_default();
        let facts = self
            .topology
            .get(node_key)
            .and_then(|e| e.as_node().ok())
            .and_then(|body| body.facts.clone());
        let resolver = Self::binding_resolver(app, node_name, &deployment, facts.as_ref());
        let Some(entity) = self.topology.get_mut(node_key) else {
            return Ok(());
        };
        entity.as_node_mut()?.bindings.insert(
            app.name.clone(),
            NodeBinding {
                deployment,
                resolver,
            },
        );
        Ok(())
    }

    /// Deployed process of `app` on the node whose stored spec expands to
    /// `id` under the merged scope. Finds the entity an upsert refers to
    /// when a variable change in the same diff moved its concrete id.
    fn relocated_process(
        &self,
        node_key: EntityKey,
        app_name: &str,
        app: &ApplicationDescriptor,
        caller: &Resolver,
        id: &str,
        handled: &HashSet<EntityKey>,
    ) -> Option<EntityKey> {
        let body = self.topology.get(node_key)?.as_node().ok()?;
        body.processes.iter().copied().find(|key| {
            if handled.contains(key) {
                return false;
            }
            let Some(process) = self.topology.get(*key).and_then(|e| e.as_process().ok()) else {
                return false;
            };
            if process.application.as_deref() != Some(app_name) {
                return false;
            }
            let Some(source) = &process.source else {
                return false;
            };
            template::concrete_id(app, caller, source).ok().as_deref() == Some(id)
        })
    }

    fn binding_of(&self, node_key: EntityKey, app_name: &str) -> Result<&NodeBinding> {
        self.topology
            .get(node_key)
            .and_then(|entity| entity.as_node().ok())
            .and_then(|body| body.bindings.get(app_name))
            .ok_or_else(|| TopologyError::ApplicationNotFound(app_name.to_string()))
    }

    fn deploy_to_node(
        &mut self,
        app: &ApplicationDescriptor,
        node_name: &str,
        deployment: &NodeDeployment,
        deltas: &mut Vec<TreeDelta>,
    ) -> Result<()> {
        let node_key = self.find_or_create_node(node_name, deltas);
        self.rebind(node_key, app, node_name)?;
        let mut inserted = Vec::new();
        for spec in &deployment.processes {
            inserted.push(self.build_process_entity(node_key, app, spec)?);
        }
        if !inserted.is_empty() {
            let mut indices: Vec<usize> = inserted
                .iter()
                .filter_map(|key| self.topology.child_index(node_key, *key))
                .collect();
            indices.sort_unstable();
            deltas.push(TreeDelta::EntitiesInserted {
                parent: self.topology.entity_path(node_key),
                indices,
            });
        }
        Ok(())
    }

    fn unbind_application_from_node(
        &mut self,
        node_key: EntityKey,
        app_name: &str,
        deltas: &mut Vec<TreeDelta>,
    ) -> Result<()> {
        let Some(entity) = self.topology.get(node_key) else {
            return Ok(());
        };
        let body = entity.as_node()?;
        if !body.bindings.contains_key(app_name) {
            return Ok(());
        }
        let targets: Vec<EntityKey> = body
            .processes
            .iter()
            .copied()
            .filter(|key| {
                self.topology
                    .get(*key)
                    .and_then(|e| e.as_process().ok())
                    .is_some_and(|p| p.application.as_deref() == Some(app_name))
            })
            .collect();

        if !targets.is_empty() {
            let parent = self.topology.entity_path(node_key);
            let indices: Vec<usize> = targets
                .iter()
                .filter_map(|key| self.topology.child_index(node_key, *key))
                .collect();
            let mut removed = Vec::new();
            for key in targets {
                if let Some((_, snapshot)) = self.topology.remove_subtree(key) {
                    removed.push(snapshot);
                }
            }
            deltas.push(TreeDelta::EntitiesRemoved {
                parent,
                indices,
                removed,
            });
        }

        if let Some(entity) = self.topology.get_mut(node_key) {
            entity.as_node_mut()?.bindings.remove(app_name);
        }

        // A node that became childless stays only while it is Up.
        let prune = self
            .topology
            .get(node_key)
            .and_then(|e| e.as_node().ok())
            .is_some_and(|body| body.processes.is_empty() && body.state != NodeState::Up);
        if prune {
            if let Some((index, snapshot)) = self.topology.remove_subtree(node_key) {
                deltas.push(TreeDelta::EntitiesRemoved {
                    parent: EntityPath::root(),
                    indices: vec![index],
                    removed: vec![snapshot],
                });
            }
        }
        Ok(())
    }

    fn build_process_entity(
        &mut self,
        node_key: EntityKey,
        app: &ApplicationDescriptor,
        spec: &ProcessSpec,
    ) -> Result<EntityKey> {
        let binding = self.binding_of(node_key, &app.name)?;
        let caller = binding.resolver.clone();
        let deployment = binding.deployment.clone();
        let (descriptor, resolver) = template::build_process(app, &caller, spec)?;
        let expansion_error =
            self.validate_properties(app, &deployment, &descriptor.property_set, &resolver)?;
        let mut entity = Entity::new(
            descriptor.id.clone(),
            resolver,
            EntityBody::Process(ProcessBody {
                application: Some(app.name.clone()),
                descriptor: descriptor.clone(),
                source: Some(spec.clone()),
                state: ProcessState::Unknown,
                pid: None,
                enabled: true,
                components: Vec::new(),
                endpoint_groups: Vec::new(),
            }),
        );
        entity.expansion_error = expansion_error;
        let process_key = self.topology.attach(node_key, entity)?;
        self.populate_process_children(process_key, app, &deployment, &descriptor)?;
        Ok(process_key)
    }

    fn insert_dynamic_process(
        &mut self,
        node_key: EntityKey,
        info: &ProcessDynamicInfo,
    ) -> Result<EntityKey> {
        debug!(process = %info.id, "node reported a process with no static deployment");
        let resolver = self
            .topology
            .get(node_key)
            .map(|entity| entity.resolver.derive(Vec::new()))
            .unwrap_or_default();
        let descriptor = ProcessDescriptor {
            id: info.id.clone(),
            ..ProcessDescriptor::default()
        };
        let entity = Entity::new(
            &info.id,
            resolver,
            EntityBody::Process(ProcessBody {
                application: None,
                descriptor,
                source: None,
                state: info.state,
                pid: info.pid,
                enabled: info.enabled,
                components: Vec::new(),
                endpoint_groups: Vec::new(),
            }),
        );
        self.topology.attach(node_key, entity)
    }

    fn populate_process_children(
        &mut self,
        process_key: EntityKey,
        app: &ApplicationDescriptor,
        deployment: &NodeDeployment,
        descriptor: &ProcessDescriptor,
    ) -> Result<()> {
        let process_resolver = match self.topology.get(process_key) {
            Some(entity) => entity.resolver.clone(),
            None => return Ok(()),
        };
        for group in &descriptor.endpoint_groups {
            self.attach_endpoint_group(process_key, &process_resolver, group)?;
        }
        for spec in &descriptor.components {
            let (component, component_resolver) =
                template::build_component(app, &process_resolver, spec)?;
            let expansion_error = self.validate_properties(
                app,
                deployment,
                &component.property_set,
                &component_resolver,
            )?;
            let mut entity = Entity::new(
                component.name.clone(),
                component_resolver.clone(),
                EntityBody::HostedComponent(ComponentBody {
                    descriptor: component.clone(),
                    source: Some(spec.clone()),
                    endpoint_groups: Vec::new(),
                }),
            );
            entity.expansion_error = expansion_error;
            let component_key = self.topology.attach(process_key, entity)?;
            for group in &component.endpoint_groups {
                self.attach_endpoint_group(component_key, &component_resolver, group)?;
            }
        }
        Ok(())
    }

    fn attach_endpoint_group(
        &mut self,
        parent: EntityKey,
        parent_resolver: &Resolver,
        group: &EndpointGroupDescriptor,
    ) -> Result<EntityKey> {
        let entity = Entity::new(
            group.name.clone(),
            parent_resolver.derive(Vec::new()),
            EntityBody::EndpointGroup(EndpointGroupBody {
                descriptor: group.clone(),
                endpoints: None,
            }),
        );
        self.topology.attach(parent, entity)
    }

    /// Re-expand one deployed process in place: same entity identity, fresh
    /// resolver and descriptor, children re-parented by id rather than
    /// recreated. An update diff re-listing the process passes the new spec
    /// as `new_source`, which replaces the stored one; otherwise the stored
    /// spec is re-expanded. Returns `None` when re-expansion changed nothing.
    fn rebuild_process(
        &mut self,
        node_key: EntityKey,
        process_key: EntityKey,
        app: &ApplicationDescriptor,
        new_source: Option<&ProcessSpec>,
    ) -> Result<Option<TreeDelta>> {
        let (stored_source, old_descriptor, old_error, old_components) = {
            let Some(entity) = self.topology.get(process_key) else {
                return Ok(None);
            };
            let body = entity.as_process()?;
            let components: Vec<_> = body
                .components
                .iter()
                .filter_map(|key| {
                    self.topology
                        .get(*key)
                        .and_then(|e| e.as_component().ok())
                        .map(|c| c.descriptor.clone())
                })
                .collect();
            (
                body.source.clone(),
                body.descriptor.clone(),
                entity.expansion_error.clone(),
                components,
            )
        };
        let Some(spec) = new_source.cloned().or(stored_source) else {
            // Dynamic-only processes have nothing to re-expand.
            return Ok(None);
        };
        let binding = self.binding_of(node_key, &app.name)?;
        let caller = binding.resolver.clone();
        let deployment = binding.deployment.clone();
        let (descriptor, resolver) = template::build_process(app, &caller, &spec)?;
        let expansion_error =
            self.validate_properties(app, &deployment, &descriptor.property_set, &resolver)?;
        // A component-template change leaves the process descriptor itself
        // untouched; the expanded children have to be compared as well.
        let mut rebuilt_components = Vec::with_capacity(descriptor.components.len());
        for component_spec in &descriptor.components {
            let (component, _) = template::build_component(app, &resolver, component_spec)?;
            rebuilt_components.push(component);
        }
        rebuilt_components.sort_by(|a, b| a.name.cmp(&b.name));
        if descriptor == old_descriptor
            && expansion_error == old_error
            && rebuilt_components == old_components
        {
            // The diff may swap the backing spec without changing the
            // expanded outcome; remember it for the next re-expansion.
            if new_source.is_some() {
                if let Some(entity) = self.topology.get_mut(process_key) {
                    entity.as_process_mut()?.source = Some(spec);
                }
            }
            return Ok(None);
        }

        let id_changed;
        {
            let Some(entity) = self.topology.get_mut(process_key) else {
                return Ok(None);
            };
            id_changed = entity.id != descriptor.id;
            entity.id = descriptor.id.clone();
            entity.resolver = resolver;
            entity.expansion_error = expansion_error;
            let body = entity.as_process_mut()?;
            body.descriptor = descriptor.clone();
            body.source = Some(spec);
        }
        if id_changed {
            self.topology.resort_child(node_key, process_key)?;
        }
        self.reconcile_process_children(process_key, app, &deployment, &descriptor)?;
        Ok(Some(TreeDelta::StructureChanged {
            path: self.topology.entity_path(process_key),
        }))
    }

    /// Match a rebuilt descriptor's children against the existing ones by
    /// id, updating in place so UI selection/expansion state survives.
    fn reconcile_process_children(
        &mut self,
        process_key: EntityKey,
        app: &ApplicationDescriptor,
        deployment: &NodeDeployment,
        descriptor: &ProcessDescriptor,
    ) -> Result<()> {
        let (process_resolver, existing_groups, existing_components) = {
            let Some(entity) = self.topology.get(process_key) else {
                return Ok(());
            };
            let body = entity.as_process()?;
            (
                entity.resolver.clone(),
                body.endpoint_groups.clone(),
                body.components.clone(),
            )
        };

        self.reconcile_endpoint_groups(
            process_key,
            &process_resolver,
            existing_groups,
            &descriptor.endpoint_groups,
        )?;

        let mut stale: Vec<EntityKey> = existing_components.clone();
        for spec in &descriptor.components {
            let (component, component_resolver) =
                template::build_component(app, &process_resolver, spec)?;
            let expansion_error = self.validate_properties(
                app,
                deployment,
                &component.property_set,
                &component_resolver,
            )?;
            let matched = existing_components.iter().copied().find(|key| {
                self.topology
                    .get(*key)
                    .is_some_and(|e| e.id == component.name)
            });
            match matched {
                Some(component_key) => {
                    stale.retain(|k| *k != component_key);
                    let groups = {
                        let Some(entity) = self.topology.get_mut(component_key) else {
                            continue;
                        };
                        entity.resolver = component_resolver.clone();
                        entity.expansion_error = expansion_error;
                        let body = entity.as_component_mut()?;
                        body.descriptor = component.clone();
                        body.source = Some(spec.clone());
                        body.endpoint_groups.clone()
                    };
                    self.reconcile_endpoint_groups(
                        component_key,
                        &component_resolver,
                        groups,
                        &component.endpoint_groups,
                    )?;
                }
                None => {
                    let mut entity = Entity::new(
                        component.name.clone(),
                        component_resolver.clone(),
                        EntityBody::HostedComponent(ComponentBody {
                            descriptor: component.clone(),
                            source: Some(spec.clone()),
                            endpoint_groups: Vec::new(),
                        }),
                    );
                    entity.expansion_error = expansion_error;
                    let component_key = self.topology.attach(process_key, entity)?;
                    for group in &component.endpoint_groups {
                        self.attach_endpoint_group(component_key, &component_resolver, group)?;
                    }
                }
            }
        }
        for key in stale {
            self.topology.remove_subtree(key);
        }
        Ok(())
    }

    fn reconcile_endpoint_groups(
        &mut self,
        parent: EntityKey,
        parent_resolver: &Resolver,
        existing: Vec<EntityKey>,
        desired: &[EndpointGroupDescriptor],
    ) -> Result<()> {
        let mut stale: Vec<EntityKey> = existing.clone();
        for group in desired {
            let matched = existing.iter().copied().find(|key| {
                self.topology
                    .get(*key)
                    .is_some_and(|e| e.id == group.name)
            });
            match matched {
                Some(group_key) => {
                    stale.retain(|k| *k != group_key);
                    if let Some(entity) = self.topology.get_mut(group_key) {
                        // Published endpoints are dynamic state; keep them.
                        entity.as_endpoint_group_mut()?.descriptor = group.clone();
                    }
                }
                None => {
                    self.attach_endpoint_group(parent, parent_resolver, group)?;
                }
            }
        }
        for key in stale {
            self.topology.remove_subtree(key);
        }
        Ok(())
    }

    fn overlay_process_status(
        &mut self,
        process_key: EntityKey,
        info: &ProcessDynamicInfo,
    ) -> Result<bool> {
        let Some(entity) = self.topology.get_mut(process_key) else {
            return Ok(false);
        };
        let body = entity.as_process_mut()?;
        let changed =
            body.state != info.state || body.pid != info.pid || body.enabled != info.enabled;
        body.state = info.state;
        body.pid = info.pid;
        body.enabled = info.enabled;
        Ok(changed)
    }

    fn overlay_endpoint_group_status(
        &mut self,
        group_key: EntityKey,
        info: &EndpointGroupDynamicInfo,
    ) -> Result<bool> {
        let Some(entity) = self.topology.get_mut(group_key) else {
            return Ok(false);
        };
        let body = entity.as_endpoint_group_mut()?;
        let changed = body.endpoints != info.endpoints;
        body.endpoints = info.endpoints.clone();
        Ok(changed)
    }

    fn clear_dynamic_status(&mut self, process_key: EntityKey) -> Result<()> {
        let children: Vec<EntityKey> = self.topology.children(process_key);
        if let Some(entity) = self.topology.get_mut(process_key) {
            let body = entity.as_process_mut()?;
            body.state = ProcessState::Unknown;
            body.pid = None;
        }
        for child in children {
            let grandchildren = self.topology.children(child);
            if let Some(entity) = self.topology.get_mut(child) {
                if let EntityBody::EndpointGroup(body) = &mut entity.body {
                    body.endpoints = None;
                }
            }
            for grandchild in grandchildren {
                if let Some(entity) = self.topology.get_mut(grandchild) {
                    if let EntityBody::EndpointGroup(body) = &mut entity.body {
                        body.endpoints = None;
                    }
                }
            }
        }
        Ok(())
    }

    /// Expand a property set to surface configuration errors at build time.
    ///
    /// A reference cycle is recoverable: it is recorded on the entity and
    /// the reconciliation pass continues. An absent named set means the
    /// event source broke its contract and is propagated as fatal.
    fn validate_properties(
        &self,
        app: &ApplicationDescriptor,
        deployment: &NodeDeployment,
        set: &PropertySet,
        resolver: &Resolver,
    ) -> Result<Option<String>> {
        let lookup = |name: &str| {
            deployment
                .property_sets
                .get(name)
                .or_else(|| app.property_sets.get(name))
        };
        match expand_property_set(set, resolver, &lookup) {
            Ok(_) => Ok(None),
            Err(err @ TopologyError::PropertySetCycle(_)) => {
                warn!(application = %app.name, %err, "property set expansion failed");
                Ok(Some(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

fn apply_facts(resolver: &mut Resolver, facts: &HostFacts) -> bool {
    let mut changed = false;
    changed |= resolver.set_computed(FACT_HOSTNAME_KEY, &facts.hostname);
    changed |= resolver.set_computed(FACT_OS_KEY, &facts.os);
    changed |= resolver.set_computed(FACT_MACHINE_KEY, &facts.machine);
    changed |= resolver.set_computed(FACT_CORES_KEY, &facts.n_cores.to_string());
    changed
}
