//! Boundary event types
//!
//! Inbound events are produced by the transport/observer collaborator and
//! delivered serialized, one at a time. Outbound deltas are produced for the
//! UI/notification collaborator; each carries enough information to apply an
//! equivalent mutation to a secondary copy of the tree.

use crate::descriptor::{
    ApplicationDescriptor, ApplicationUpdate, EndpointGroupDynamicInfo, LoadSample,
    NodeDynamicInfo, ProcessDynamicInfo,
};
use crate::entity::{EntityKey, EntityPath, EntitySnapshot};
use serde::{Deserialize, Serialize};

/// An inbound update notification from the remote cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InboundEvent {
    ApplicationAdded(ApplicationDescriptor),
    ApplicationRemoved(String),
    ApplicationUpdated(ApplicationUpdate),
    NodeUp(NodeDynamicInfo),
    NodeDown(String),
    ProcessStatusChanged {
        node: String,
        info: ProcessDynamicInfo,
    },
    EndpointGroupStatusChanged {
        node: String,
        info: EndpointGroupDynamicInfo,
    },
    /// Completion of an asynchronous load poll against one node. Guarded by
    /// identity: if the target entity has been removed since the poll was
    /// issued, the sample is discarded.
    NodeLoadSampled {
        target: EntityKey,
        load: LoadSample,
    },
}

/// A structural change notification for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeDelta {
    /// Children appeared under `parent`; indices address the parent's final
    /// concatenated child list.
    EntitiesInserted {
        parent: EntityPath,
        indices: Vec<usize>,
    },
    /// Children disappeared from `parent`; indices address the child list
    /// as it was before removal, and snapshots describe what was removed.
    EntitiesRemoved {
        parent: EntityPath,
        indices: Vec<usize>,
        removed: Vec<EntitySnapshot>,
    },
    /// An entity's own fields changed without structural impact.
    EntityChanged { path: EntityPath },
    /// The subtree under `path` was rebuilt in bulk; incremental indices
    /// would be too costly to compute, re-read the subtree instead.
    StructureChanged { path: EntityPath },
}
