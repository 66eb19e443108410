//! Entity arena and topology tree
//!
//! The mirrored tree is stored as an arena keyed by [`EntityKey`] identity
//! tokens. Parent→child is ownership (keys held in the parent's sorted child
//! vectors); child→parent is a non-owning back-key used only for upward
//! lookups, so the graph cannot form reference cycles. Keys are fresh UUIDs
//! and are never reused, which is what lets asynchronous completions detect
//! a stale target by identity rather than by (reusable) id string.

use crate::descriptor::{
    ApplicationDescriptor, ComponentSpec, EndpointGroupDescriptor, HostFacts,
    HostedComponentDescriptor, LoadSample, NodeDeployment, NodeState, ProcessDescriptor,
    ProcessSpec, ProcessState,
};
use crate::error::{Result, TopologyError};
use crate::resolver::Resolver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

/// Identity token of a mirrored entity. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey(Uuid);

impl EntityKey {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind tag used in snapshots and change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Node,
    Process,
    HostedComponent,
    EndpointGroup,
}

/// Path of entity ids from the tree root, addressing one entity for the
/// notification collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityPath(pub Vec<String>);

impl EntityPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, id: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(id.to_string());
        Self(segments)
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Minimal serializable view of a removed entity, carried in removal
/// notifications so a secondary tree copy can mirror the mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub key: EntityKey,
    pub id: String,
    pub kind: EntityKind,
}

/// One application's scope bound onto one node: the per-node deployment
/// descriptor and the resolver expanding it.
#[derive(Debug, Clone)]
pub struct NodeBinding {
    pub deployment: NodeDeployment,
    pub resolver: Resolver,
}

#[derive(Debug, Clone, Default)]
pub struct NodeBody {
    pub state: NodeState,
    pub since: Option<DateTime<Utc>>,
    pub facts: Option<HostFacts>,
    pub load: Option<LoadSample>,
    /// Per-application bindings; a node may host entities from many
    /// applications simultaneously.
    pub bindings: BTreeMap<String, NodeBinding>,
    pub processes: Vec<EntityKey>,
}

#[derive(Debug, Clone)]
pub struct ProcessBody {
    /// Owning application; `None` marks a dynamic-only process first
    /// reported by a node-up snapshot, with no static deployment behind it.
    pub application: Option<String>,
    pub descriptor: ProcessDescriptor,
    /// The spec this process was expanded from, kept for re-expansion.
    pub source: Option<ProcessSpec>,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub enabled: bool,
    pub components: Vec<EntityKey>,
    pub endpoint_groups: Vec<EntityKey>,
}

#[derive(Debug, Clone)]
pub struct ComponentBody {
    pub descriptor: HostedComponentDescriptor,
    /// The spec this component was expanded from, kept for re-expansion.
    pub source: Option<ComponentSpec>,
    pub endpoint_groups: Vec<EntityKey>,
}

#[derive(Debug, Clone)]
pub struct EndpointGroupBody {
    pub descriptor: EndpointGroupDescriptor,
    /// Currently published endpoints; `None` while unpublished.
    pub endpoints: Option<String>,
}

/// Kind-specific payload behind the shared entity envelope.
#[derive(Debug, Clone)]
pub enum EntityBody {
    Node(NodeBody),
    Process(ProcessBody),
    HostedComponent(ComponentBody),
    EndpointGroup(EndpointGroupBody),
}

/// Shared envelope of every mirrored entity.
#[derive(Debug, Clone)]
pub struct Entity {
    pub key: EntityKey,
    /// Display id, unique within a sibling set.
    pub id: String,
    pub parent: Option<EntityKey>,
    pub resolver: Resolver,
    /// Configuration error recorded during expansion (e.g. a property-set
    /// reference cycle); the entity stays in the tree with this attached.
    pub expansion_error: Option<String>,
    pub body: EntityBody,
}

impl Entity {
    pub fn new(id: impl Into<String>, resolver: Resolver, body: EntityBody) -> Self {
        Self {
            key: EntityKey::new(),
            id: id.into(),
            parent: None,
            resolver,
            expansion_error: None,
            body,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match &self.body {
            EntityBody::Node(_) => EntityKind::Node,
            EntityBody::Process(_) => EntityKind::Process,
            EntityBody::HostedComponent(_) => EntityKind::HostedComponent,
            EntityBody::EndpointGroup(_) => EntityKind::EndpointGroup,
        }
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            key: self.key,
            id: self.id.clone(),
            kind: self.kind(),
        }
    }

    pub fn as_node(&self) -> Result<&NodeBody> {
        match &self.body {
            EntityBody::Node(body) => Ok(body),
            _ => Err(TopologyError::WrongEntityKind(self.id.clone(), "node")),
        }
    }

    pub fn as_node_mut(&mut self) -> Result<&mut NodeBody> {
        match &mut self.body {
            EntityBody::Node(body) => Ok(body),
            _ => Err(TopologyError::WrongEntityKind(self.id.clone(), "node")),
        }
    }

    pub fn as_process(&self) -> Result<&ProcessBody> {
        match &self.body {
            EntityBody::Process(body) => Ok(body),
            _ => Err(TopologyError::WrongEntityKind(self.id.clone(), "process")),
        }
    }

    pub fn as_process_mut(&mut self) -> Result<&mut ProcessBody> {
        match &mut self.body {
            EntityBody::Process(body) => Ok(body),
            _ => Err(TopologyError::WrongEntityKind(self.id.clone(), "process")),
        }
    }

    pub fn as_component(&self) -> Result<&ComponentBody> {
        match &self.body {
            EntityBody::HostedComponent(body) => Ok(body),
            _ => Err(TopologyError::WrongEntityKind(
                self.id.clone(),
                "hosted component",
            )),
        }
    }

    pub fn as_component_mut(&mut self) -> Result<&mut ComponentBody> {
        match &mut self.body {
            EntityBody::HostedComponent(body) => Ok(body),
            _ => Err(TopologyError::WrongEntityKind(
                self.id.clone(),
                "hosted component",
            )),
        }
    }

    pub fn as_endpoint_group(&self) -> Result<&EndpointGroupBody> {
        match &self.body {
            EntityBody::EndpointGroup(body) => Ok(body),
            _ => Err(TopologyError::WrongEntityKind(
                self.id.clone(),
                "endpoint group",
            )),
        }
    }

    pub fn as_endpoint_group_mut(&mut self) -> Result<&mut EndpointGroupBody> {
        match &mut self.body {
            EntityBody::EndpointGroup(body) => Ok(body),
            _ => Err(TopologyError::WrongEntityKind(
                self.id.clone(),
                "endpoint group",
            )),
        }
    }
}

/// The mirrored topology tree: an entity arena, the sorted list of node
/// keys and the registered application scopes.
#[derive(Debug, Default)]
pub struct Topology {
    entities: HashMap<EntityKey, Entity>,
    nodes: Vec<EntityKey>,
    applications: BTreeMap<String, ApplicationDescriptor>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: EntityKey) -> bool {
        self.entities.contains_key(&key)
    }

    pub fn get(&self, key: EntityKey) -> Option<&Entity> {
        self.entities.get(&key)
    }

    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut Entity> {
        self.entities.get_mut(&key)
    }

    /// Node keys, sorted by node id.
    pub fn nodes(&self) -> &[EntityKey] {
        &self.nodes
    }

    pub fn applications(&self) -> &BTreeMap<String, ApplicationDescriptor> {
        &self.applications
    }

    pub fn application(&self, name: &str) -> Option<&ApplicationDescriptor> {
        self.applications.get(name)
    }

    pub fn register_application(&mut self, descriptor: ApplicationDescriptor) -> Result<()> {
        if self.applications.contains_key(&descriptor.name) {
            return Err(TopologyError::ApplicationExists(descriptor.name));
        }
        self.applications.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn replace_application(&mut self, descriptor: ApplicationDescriptor) {
        self.applications.insert(descriptor.name.clone(), descriptor);
    }

    pub fn unregister_application(&mut self, name: &str) -> Result<ApplicationDescriptor> {
        self.applications
            .remove(name)
            .ok_or_else(|| TopologyError::ApplicationNotFound(name.to_string()))
    }

    pub fn find_node(&self, name: &str) -> Option<EntityKey> {
        self.nodes
            .iter()
            .copied()
            .find(|key| self.entities.get(key).is_some_and(|e| e.id == name))
    }

    /// Insert a node entity, keeping the node list sorted by id.
    /// Returns the key and the insertion index.
    pub fn insert_node(&mut self, entity: Entity) -> (EntityKey, usize) {
        let key = entity.key;
        let index = self.insertion_index(&self.nodes, &entity.id);
        self.entities.insert(key, entity);
        self.nodes.insert(index, key);
        (key, index)
    }

    /// Attach a child entity under `parent`, keeping the matching partition
    /// sorted by id. Returns the child's key.
    pub fn attach(&mut self, parent: EntityKey, mut entity: Entity) -> Result<EntityKey> {
        entity.parent = Some(parent);
        let key = entity.key;
        let id = entity.id.clone();
        let kind = entity.kind();
        self.entities.insert(key, entity);
        let partition = self.partition(parent, kind)?.to_vec();
        let index = self.insertion_index(&partition, &id);
        self.partition_mut(parent, kind)?.insert(index, key);
        Ok(key)
    }

    /// Detach `key` from its parent (or the node list) and drop it and all
    /// of its descendants from the arena. Returns the index the entity
    /// occupied in its parent's concatenated child list and its snapshot.
    pub fn remove_subtree(&mut self, key: EntityKey) -> Option<(usize, EntitySnapshot)> {
        let entity = self.entities.get(&key)?;
        let snapshot = entity.snapshot();
        let parent = entity.parent;
        let index = match parent {
            Some(parent_key) => self.child_index(parent_key, key)?,
            None => self.nodes.iter().position(|k| *k == key)?,
        };
        match parent {
            Some(parent_key) => {
                let kind = snapshot.kind;
                if let Ok(partition) = self.partition_mut(parent_key, kind) {
                    partition.retain(|k| *k != key);
                }
            }
            None => self.nodes.retain(|k| *k != key),
        }
        self.drop_recursive(key);
        Some((index, snapshot))
    }

    fn drop_recursive(&mut self, key: EntityKey) {
        if let Some(entity) = self.entities.remove(&key) {
            for child in Self::owned_children(&entity) {
                self.drop_recursive(child);
            }
        }
    }

    fn owned_children(entity: &Entity) -> Vec<EntityKey> {
        match &entity.body {
            EntityBody::Node(body) => body.processes.clone(),
            EntityBody::Process(body) => body
                .components
                .iter()
                .chain(body.endpoint_groups.iter())
                .copied()
                .collect(),
            EntityBody::HostedComponent(body) => body.endpoint_groups.clone(),
            EntityBody::EndpointGroup(_) => Vec::new(),
        }
    }

    /// Concatenated child list of `key`: for a process, hosted components
    /// come first, then endpoint groups; each partition is sorted by id.
    pub fn children(&self, key: EntityKey) -> Vec<EntityKey> {
        self.entities
            .get(&key)
            .map(Self::owned_children)
            .unwrap_or_default()
    }

    /// Index of `child` within `parent`'s concatenated child list.
    pub fn child_index(&self, parent: EntityKey, child: EntityKey) -> Option<usize> {
        self.children(parent).iter().position(|k| *k == child)
    }

    /// Id path from the root down to `key`.
    pub fn entity_path(&self, key: EntityKey) -> EntityPath {
        let mut segments = Vec::new();
        let mut cursor = Some(key);
        while let Some(k) = cursor {
            match self.entities.get(&k) {
                Some(entity) => {
                    segments.push(entity.id.clone());
                    cursor = entity.parent;
                }
                None => break,
            }
        }
        segments.reverse();
        EntityPath(segments)
    }

    /// Re-sort the partition holding `child` after its id changed in place.
    pub fn resort_child(&mut self, parent: EntityKey, child: EntityKey) -> Result<()> {
        let kind = match self.entities.get(&child) {
            Some(entity) => entity.kind(),
            None => return Ok(()),
        };
        let ids: HashMap<EntityKey, String> = self
            .partition(parent, kind)?
            .iter()
            .filter_map(|k| self.entities.get(k).map(|e| (*k, e.id.clone())))
            .collect();
        let partition = self.partition_mut(parent, kind)?;
        partition.sort_by(|a, b| ids.get(a).cmp(&ids.get(b)));
        Ok(())
    }

    fn insertion_index(&self, children: &[EntityKey], id: &str) -> usize {
        children.partition_point(|key| {
            self.entities
                .get(key)
                .map(|entity| entity.id.as_str() < id)
                .unwrap_or(false)
        })
    }

    fn partition(&self, parent: EntityKey, kind: EntityKind) -> Result<&[EntityKey]> {
        let entity = self
            .entities
            .get(&parent)
            .ok_or_else(|| TopologyError::WrongEntityKind(parent.to_string(), "parent"))?;
        match (&entity.body, kind) {
            (EntityBody::Node(body), EntityKind::Process) => Ok(&body.processes),
            (EntityBody::Process(body), EntityKind::HostedComponent) => Ok(&body.components),
            (EntityBody::Process(body), EntityKind::EndpointGroup) => Ok(&body.endpoint_groups),
            (EntityBody::HostedComponent(body), EntityKind::EndpointGroup) => {
                Ok(&body.endpoint_groups)
            }
            _ => Err(TopologyError::WrongEntityKind(
                entity.id.clone(),
                "parent of this child kind",
            )),
        }
    }

    fn partition_mut(&mut self, parent: EntityKey, kind: EntityKind) -> Result<&mut Vec<EntityKey>> {
        let entity = self
            .entities
            .get_mut(&parent)
            .ok_or_else(|| TopologyError::WrongEntityKind(parent.to_string(), "parent"))?;
        let id = entity.id.clone();
        match (&mut entity.body, kind) {
            (EntityBody::Node(body), EntityKind::Process) => Ok(&mut body.processes),
            (EntityBody::Process(body), EntityKind::HostedComponent) => Ok(&mut body.components),
            (EntityBody::Process(body), EntityKind::EndpointGroup) => Ok(&mut body.endpoint_groups),
            (EntityBody::HostedComponent(body), EntityKind::EndpointGroup) => {
                Ok(&mut body.endpoint_groups)
            }
            _ => Err(TopologyError::WrongEntityKind(
                id,
                "parent of this child kind",
            )),
        }
    }
}
