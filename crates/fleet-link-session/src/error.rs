//! Terminal errors of a connection attempt and their classification.

use fleet_link_core::{TransportError, traits::DiscoveryError};
use thiserror::Error;

/// Error text prefix the control service uses for deregistered instances.
pub const INACTIVE_INSTANCE_EXCEPTION_PREFIX: &str = "InactiveInstanceException:";

/// Why a single connection attempt ended.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Serve task failed: {0}")]
    ServeTask(String),
    #[error("Session cancelled")]
    Cancelled,
}

/// Recovery class of an attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Remote side closed normally; reconnect at once.
    Clean,
    /// Instance no longer registered upstream; wait the long fixed delay.
    InactiveInstance,
    /// Anything else; back off.
    Failure,
}

impl Disconnect {
    #[must_use]
    pub fn classify(result: &Result<(), AttemptError>) -> Self {
        match result {
            Ok(()) | Err(AttemptError::Transport(TransportError::EndOfStream)) => Self::Clean,
            Err(e) if e.to_string().starts_with(INACTIVE_INSTANCE_EXCEPTION_PREFIX) => {
                Self::InactiveInstance
            }
            Err(_) => Self::Failure,
        }
    }
}
