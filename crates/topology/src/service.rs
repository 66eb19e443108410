//! Single-mutator topology service
//!
//! All tree mutation happens on one designated task: inbound events are
//! queued over an mpsc channel and applied in order, and the resulting
//! structural deltas are fanned out over a broadcast channel to UI
//! subscribers, which apply them to their own copy of the tree. The core
//! never blocks waiting for a subscriber, and subscribers never touch the
//! tree directly.
//!
//! Asynchronous auxiliary operations (load polling, on-demand property
//! fetches) complete by enqueueing an event or a query; completions against
//! an entity that has since been removed are discarded by identity inside
//! the reconciler.

use crate::descriptor::NodeState;
use crate::entity::EntityKey;
use crate::error::{Result, TopologyError};
use crate::events::{InboundEvent, TreeDelta};
use crate::reconciler::Reconciler;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default buffer size for the inbound event queue.
const EVENT_BUFFER_SIZE: usize = 1000;

/// Default buffer size for the delta broadcast channel.
const DELTA_BUFFER_SIZE: usize = 1000;

/// Tunables for the mutator service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub event_buffer: usize,
    pub delta_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            event_buffer: EVENT_BUFFER_SIZE,
            delta_buffer: DELTA_BUFFER_SIZE,
        }
    }
}

enum Command {
    Event(InboundEvent),
    GetProperties {
        target: EntityKey,
        respond: oneshot::Sender<Result<IndexMap<String, String>>>,
    },
    GetLoadFactors {
        node: EntityKey,
        respond: oneshot::Sender<IndexMap<String, String>>,
    },
    FindNode {
        name: String,
        respond: oneshot::Sender<Option<EntityKey>>,
    },
    FindProcess {
        node: String,
        id: String,
        respond: oneshot::Sender<Option<EntityKey>>,
    },
    NodeState {
        node: EntityKey,
        respond: oneshot::Sender<Option<NodeState>>,
    },
    NodeNames {
        respond: oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable handle for submitting events and querying the mirror.
#[derive(Clone)]
pub struct TopologyHandle {
    commands: mpsc::Sender<Command>,
    deltas: broadcast::Sender<TreeDelta>,
}

impl TopologyHandle {
    /// Queue one inbound event for the mutator task.
    pub async fn submit(&self, event: InboundEvent) -> Result<()> {
        self.commands
            .send(Command::Event(event))
            .await
            .map_err(|_| TopologyError::ChannelClosed("event queue".to_string()))
    }

    /// Subscribe to structural change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TreeDelta> {
        self.deltas.subscribe()
    }

    /// Effective property map of a process or hosted component.
    pub async fn get_properties(&self, target: EntityKey) -> Result<IndexMap<String, String>> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::GetProperties { target, respond })
            .await
            .map_err(|_| TopologyError::ChannelClosed("event queue".to_string()))?;
        rx.await
            .map_err(|_| TopologyError::ChannelClosed("query response".to_string()))?
    }

    /// Per-application load factors declared on a node.
    pub async fn get_load_factors(&self, node: EntityKey) -> Result<IndexMap<String, String>> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::GetLoadFactors { node, respond })
            .await
            .map_err(|_| TopologyError::ChannelClosed("event queue".to_string()))?;
        rx.await
            .map_err(|_| TopologyError::ChannelClosed("query response".to_string()))
    }

    pub async fn find_node(&self, name: &str) -> Result<Option<EntityKey>> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::FindNode {
                name: name.to_string(),
                respond,
            })
            .await
            .map_err(|_| TopologyError::ChannelClosed("event queue".to_string()))?;
        rx.await
            .map_err(|_| TopologyError::ChannelClosed("query response".to_string()))
    }

    pub async fn find_process(&self, node: &str, id: &str) -> Result<Option<EntityKey>> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::FindProcess {
                node: node.to_string(),
                id: id.to_string(),
                respond,
            })
            .await
            .map_err(|_| TopologyError::ChannelClosed("event queue".to_string()))?;
        rx.await
            .map_err(|_| TopologyError::ChannelClosed("query response".to_string()))
    }

    pub async fn node_state(&self, node: EntityKey) -> Result<Option<NodeState>> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::NodeState { node, respond })
            .await
            .map_err(|_| TopologyError::ChannelClosed("event queue".to_string()))?;
        rx.await
            .map_err(|_| TopologyError::ChannelClosed("query response".to_string()))
    }

    /// Ids of all mirrored nodes, in display order.
    pub async fn node_names(&self) -> Result<Vec<String>> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::NodeNames { respond })
            .await
            .map_err(|_| TopologyError::ChannelClosed("event queue".to_string()))?;
        rx.await
            .map_err(|_| TopologyError::ChannelClosed("query response".to_string()))
    }
}

/// Owns the mutator task. Dropping the service (or calling
/// [`TopologyService::shutdown`]) closes the event queue and stops the loop.
pub struct TopologyService {
    commands: mpsc::Sender<Command>,
    deltas: broadcast::Sender<TreeDelta>,
    task: JoinHandle<()>,
}

impl TopologyService {
    /// Spawn the mutator task with the given configuration.
    pub fn spawn(config: ServiceConfig) -> Self {
        let (commands, mut rx) = mpsc::channel(config.event_buffer.max(1));
        let (deltas, _) = broadcast::channel(config.delta_buffer.max(1));
        let delta_tx = deltas.clone();
        let task = tokio::spawn(async move {
            let mut reconciler = Reconciler::new();
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Event(event) => match reconciler.apply(event) {
                        Ok(batch) => {
                            for delta in batch {
                                // No subscribers is fine; send only fails then.
                                let _ = delta_tx.send(delta);
                            }
                        }
                        Err(err) if err.is_protocol_violation() => {
                            error!(%err, "protocol invariant violated; mirror is no longer consistent, stopping");
                            break;
                        }
                        Err(err) => {
                            warn!(%err, "event rejected");
                        }
                    },
                    Command::GetProperties { target, respond } => {
                        let _ = respond.send(reconciler.topology().get_properties(target));
                    }
                    Command::GetLoadFactors { node, respond } => {
                        let _ = respond.send(reconciler.topology().get_load_factors(node));
                    }
                    Command::FindNode { name, respond } => {
                        let _ = respond.send(reconciler.topology().find_node(&name));
                    }
                    Command::FindProcess { node, id, respond } => {
                        let found = reconciler
                            .topology()
                            .find_node(&node)
                            .and_then(|key| reconciler.topology().find_process(key, &id));
                        let _ = respond.send(found);
                    }
                    Command::NodeState { node, respond } => {
                        let _ = respond.send(reconciler.topology().node_state(node));
                    }
                    Command::NodeNames { respond } => {
                        let topology = reconciler.topology();
                        let names = topology
                            .nodes()
                            .iter()
                            .filter_map(|key| topology.get(*key).map(|e| e.id.clone()))
                            .collect();
                        let _ = respond.send(names);
                    }
                }
            }
            debug!("topology mutator loop stopped");
        });
        Self {
            commands,
            deltas,
            task,
        }
    }

    /// A cloneable handle onto the running service.
    pub fn handle(&self) -> TopologyHandle {
        TopologyHandle {
            commands: self.commands.clone(),
            deltas: self.deltas.clone(),
        }
    }

    /// Close the event queue and wait for the mutator task to drain.
    pub async fn shutdown(self) {
        drop(self.commands);
        let _ = self.task.await;
    }
}
