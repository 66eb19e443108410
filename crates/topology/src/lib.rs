//! # gridmirror topology
//!
//! This crate maintains a consistent, queryable in-memory mirror of a remote
//! cluster's deployment topology (applications, nodes, processes, hosted
//! components, published endpoint groups) as a stream of partial,
//! out-of-order and possibly redundant update notifications arrives, while
//! resolving each entity's effective configuration from a layered
//! template/variable system.
//!
//! - [`Resolver`]: scoped variable lookup and `${name}` substitution
//! - [`properties`]: flattening of property sets that reference other sets
//! - [`template`]: deterministic expansion of parameterized descriptors
//! - [`Topology`]: the mirrored entity tree
//! - [`Reconciler`]: applies inbound events, emitting structural deltas
//! - [`TopologyService`]: single-mutator task wiring it to tokio channels
//!
//! The transport producing inbound events and the UI consuming deltas are
//! external collaborators; this crate only defines their boundary types.

pub mod descriptor;
pub mod entity;
pub mod error;
pub mod events;
pub mod properties;
pub mod queries;
pub mod reconciler;
pub mod resolver;
pub mod service;
pub mod template;

// Re-export main types
pub use descriptor::{
    ApplicationDescriptor, ApplicationUpdate, ComponentInstance, ComponentSpec,
    EndpointGroupDescriptor, EndpointGroupDynamicInfo, HostFacts, HostedComponentDescriptor,
    LoadSample, NodeDeployment, NodeDeploymentUpdate, NodeDynamicInfo, NodeState,
    ProcessDescriptor, ProcessDynamicInfo, ProcessInstance, ProcessSpec, ProcessState,
    PropertyDescriptor, PropertySet, TemplateDescriptor,
};
pub use entity::{
    Entity, EntityBody, EntityKey, EntityKind, EntityPath, EntitySnapshot, NodeBinding, Topology,
};
pub use error::{Result, TopologyError};
pub use events::{InboundEvent, TreeDelta};
pub use properties::expand_property_set;
pub use reconciler::Reconciler;
pub use resolver::Resolver;
pub use service::{ServiceConfig, TopologyHandle, TopologyService};

#[cfg(test)]
mod reconciler_tests;
#[cfg(test)]
mod resolver_tests;
#[cfg(test)]
mod template_tests;
