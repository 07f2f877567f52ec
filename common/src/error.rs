use crate::messaging::{ConnectError, MessagingError};
use crate::network::NetworkError;

/// Errors surfaced by the orchestrator.
///
/// Only [`Error::TransportAuth`], [`Error::Credentials`] and [`Error::Provisioning`]
/// are terminal. Everything else is handled inside the loop by skipping the tick or
/// retrying on the next one. Sensor faults never get here: they only skip a tick.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("network unavailable after {attempts} attempts: {source}")]
    NetworkUnavailable {
        attempts: u32,
        #[source]
        source: NetworkError,
    },

    #[error("broker unreachable after {attempts} attempts: {source}")]
    BrokerUnreachable {
        attempts: u32,
        #[source]
        source: ConnectError,
    },

    #[error("broker rejected the device credentials {failures} times in a row")]
    TransportAuth { failures: u32 },

    #[error("publish failed: {0}")]
    Publish(#[source] MessagingError),

    #[error("subscribe failed: {0}")]
    Subscribe(#[source] MessagingError),

    #[error("transport refused the credentials: {0}")]
    Credentials(#[source] MessagingError),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("provisioning: {0}")]
    Provisioning(#[from] ProvisioningError),
}

impl Error {
    /// Whether the loop has to stop. Terminal errors mean retrying cannot help
    /// without new provisioning material.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::TransportAuth { .. } | Error::Credentials(_) | Error::Provisioning(_)
        )
    }
}

/// Missing or malformed build-time provisioning material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("{0} is empty")]
    Missing(&'static str),

    #[error("{0} is not PEM encoded")]
    NotPem(&'static str),
}

#[test]
fn test_terminal_errors() {
    assert!(Error::TransportAuth { failures: 3 }.is_terminal());
    assert!(Error::Provisioning(ProvisioningError::Missing("endpoint")).is_terminal());
    assert!(!Error::Subscribe(MessagingError::NotConnected).is_terminal());
    assert!(!Error::Publish(MessagingError::NotConnected).is_terminal());
}
