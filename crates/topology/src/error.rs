//! Error types for topology mirroring

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("application '{0}' is already registered")]
    ApplicationExists(String),

    #[error("application '{0}' not found")]
    ApplicationNotFound(String),

    #[error("template '{template}' not found in application '{application}'")]
    TemplateNotFound {
        template: String,
        application: String,
    },

    #[error("named property set '{0}' not found")]
    PropertySetNotFound(String),

    #[error("process '{id}' not found on node '{node}'")]
    ProcessNotFound { id: String, node: String },

    #[error("property set reference cycle through '{0}'")]
    PropertySetCycle(String),

    #[error("entity {0} is not a {1}")]
    WrongEntityKind(String, &'static str),

    #[error("entity {0} no longer exists")]
    StaleEntity(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl TopologyError {
    /// Whether this error means the event source broke its contract and the
    /// mirror can no longer be trusted to be consistent.
    ///
    /// Configuration errors (e.g. a property-set reference cycle) and status
    /// failures are recoverable and scoped to a single entity; protocol
    /// violations are not.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TopologyError::ApplicationExists(_)
                | TopologyError::ApplicationNotFound(_)
                | TopologyError::TemplateNotFound { .. }
                | TopologyError::PropertySetNotFound(_)
                | TopologyError::ProcessNotFound { .. }
                | TopologyError::WrongEntityKind(..)
        )
    }
}
