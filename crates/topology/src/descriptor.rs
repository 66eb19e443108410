//! Descriptor and dynamic-status data model
//!
//! Descriptors are the static half of the mirror: what an application
//! declares it deploys. Dynamic infos are the live half: what a node
//! currently reports. Both arrive from the transport collaborator and are
//! plain serde values; a concrete entity's *effective* descriptor is a
//! descriptor plus the outcome of resolver substitution, and is never
//! mutated in place once published.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A single name/value property; both sides may contain `${}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub value: String,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A property set: its own ordered properties plus ordered references to
/// named property sets, expanded depth-first so local properties win.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default)]
    pub properties: Vec<PropertyDescriptor>,
    /// Names of named property sets to expand before `properties`.
    #[serde(default)]
    pub references: Vec<String>,
}

impl PropertySet {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.references.is_empty()
    }
}

/// A published communication endpoint group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointGroupDescriptor {
    /// Group name, unique within the owning process or component.
    pub name: String,
    /// Declared endpoint expression (host/port template).
    #[serde(default)]
    pub endpoints: String,
    /// Optional replica-group membership.
    #[serde(default)]
    pub replica_group: Option<String>,
}

/// A sub-component hosted inside a container process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostedComponentDescriptor {
    pub name: String,
    /// Entry point loaded by the container process.
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub property_set: PropertySet,
    #[serde(default)]
    pub endpoint_groups: Vec<EndpointGroupDescriptor>,
}

/// Instantiation of a named hosted-component template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInstance {
    pub template: String,
    #[serde(default)]
    pub parameter_values: IndexMap<String, String>,
    /// Instance-level property override, applied over the expanded set.
    #[serde(default)]
    pub property_set: PropertySet,
}

/// Either a directly-declared component or a template instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentSpec {
    Direct(HostedComponentDescriptor),
    FromTemplate(ComponentInstance),
}

/// A deployable process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub id: String,
    /// Executable or entry point.
    #[serde(default)]
    pub exe: String,
    #[serde(default)]
    pub property_set: PropertySet,
    #[serde(default)]
    pub endpoint_groups: Vec<EndpointGroupDescriptor>,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
}

/// Instantiation of a named process template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub template: String,
    #[serde(default)]
    pub parameter_values: IndexMap<String, String>,
    /// Instance-level property override, applied over the expanded set.
    #[serde(default)]
    pub property_set: PropertySet,
}

/// Either a directly-declared process or a template instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessSpec {
    Direct(ProcessDescriptor),
    FromTemplate(ProcessInstance),
}

/// A parameterized descriptor plus default parameter values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDescriptor<D> {
    pub descriptor: D,
    #[serde(default)]
    pub parameter_defaults: IndexMap<String, String>,
}

/// One application's bindings onto one node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeDeployment {
    /// Node-scope variables, shadowing application-level ones.
    #[serde(default)]
    pub variables: IndexMap<String, String>,
    /// Node-local named property sets, shadowing application-level ones.
    #[serde(default)]
    pub property_sets: IndexMap<String, PropertySet>,
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
    /// Load-factor expression for schedulers, resolved per binding.
    #[serde(default)]
    pub load_factor: Option<String>,
}

/// Everything one deployed application declares, shared across all nodes it
/// is deployed to: variables, named property sets, templates and per-node
/// descriptor bindings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationDescriptor {
    pub name: String,
    #[serde(default)]
    pub variables: IndexMap<String, String>,
    #[serde(default)]
    pub property_sets: IndexMap<String, PropertySet>,
    #[serde(default)]
    pub process_templates: IndexMap<String, TemplateDescriptor<ProcessDescriptor>>,
    #[serde(default)]
    pub component_templates: IndexMap<String, TemplateDescriptor<HostedComponentDescriptor>>,
    #[serde(default)]
    pub nodes: IndexMap<String, NodeDeployment>,
}

/// Per-node slice of an [`ApplicationUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeDeploymentUpdate {
    #[serde(default)]
    pub variables: IndexMap<String, String>,
    #[serde(default)]
    pub remove_variables: Vec<String>,
    #[serde(default)]
    pub property_sets: IndexMap<String, PropertySet>,
    #[serde(default)]
    pub remove_property_sets: Vec<String>,
    /// Added-or-updated process specs; an updated spec replaces the one
    /// producing the same concrete id.
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
    /// Concrete ids of processes to remove.
    #[serde(default)]
    pub remove_processes: Vec<String>,
    /// `Some(new)` replaces the load factor, `None` leaves it alone.
    #[serde(default)]
    pub load_factor: Option<Option<String>>,
}

/// A diff against a registered application: added/removed/changed variables,
/// property sets, templates and per-node process instances.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationUpdate {
    pub name: String,
    #[serde(default)]
    pub variables: IndexMap<String, String>,
    #[serde(default)]
    pub remove_variables: Vec<String>,
    #[serde(default)]
    pub property_sets: IndexMap<String, PropertySet>,
    #[serde(default)]
    pub remove_property_sets: Vec<String>,
    #[serde(default)]
    pub process_templates: IndexMap<String, TemplateDescriptor<ProcessDescriptor>>,
    #[serde(default)]
    pub remove_process_templates: Vec<String>,
    #[serde(default)]
    pub component_templates: IndexMap<String, TemplateDescriptor<HostedComponentDescriptor>>,
    #[serde(default)]
    pub remove_component_templates: Vec<String>,
    #[serde(default)]
    pub nodes: IndexMap<String, NodeDeploymentUpdate>,
    /// Node deployments to drop entirely.
    #[serde(default)]
    pub remove_nodes: Vec<String>,
}

impl ApplicationUpdate {
    /// Whether the diff touches application- or node-scope variables or
    /// named property sets. Such changes cascade through the resolver scope
    /// chain to every process of the application, not only the ones the
    /// diff names explicitly.
    pub fn changes_variables(&self) -> bool {
        !self.variables.is_empty()
            || !self.remove_variables.is_empty()
            || !self.property_sets.is_empty()
            || !self.remove_property_sets.is_empty()
    }

    /// Names of templates this diff adds, replaces or removes.
    pub fn touched_templates(&self) -> Vec<&str> {
        self.process_templates
            .keys()
            .chain(self.remove_process_templates.iter())
            .chain(self.component_templates.keys())
            .chain(self.remove_component_templates.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Node lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// The node is deployed to but has never been observed.
    #[default]
    Unknown,
    Up,
    Down,
}

/// Process lifecycle state, mirrored verbatim from the remote system.
/// `Unknown` means the owning node is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessState {
    #[default]
    Unknown,
    Inactive,
    Activating,
    ActivationTimedOut,
    Active,
    Deactivating,
    Destroying,
    Destroyed,
}

/// Host facts a node reports when it comes up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostFacts {
    pub hostname: String,
    pub os: String,
    pub machine: String,
    #[serde(default)]
    pub n_cores: u32,
}

/// Load averages sampled from a live node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadSample {
    pub avg1: f32,
    pub avg5: f32,
    pub avg15: f32,
}

/// Live status of one process, as reported by its node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDynamicInfo {
    pub id: String,
    pub state: ProcessState,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Live status of one endpoint group; `endpoints: None` means unpublished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointGroupDynamicInfo {
    pub id: String,
    #[serde(default)]
    pub endpoints: Option<String>,
}

/// Full dynamic snapshot carried by a node-up event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDynamicInfo {
    pub name: String,
    #[serde(default)]
    pub facts: HostFacts,
    #[serde(default)]
    pub processes: Vec<ProcessDynamicInfo>,
    #[serde(default)]
    pub endpoint_groups: Vec<EndpointGroupDynamicInfo>,
}
