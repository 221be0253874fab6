// Error types for experiment orchestration and the transport seam.

use std::path::PathBuf;

use crate::pt_discovery::PeerLink;
use crate::pt_interface::{DiscoveryPhase, EndpointId};

/// Orchestration-level failures, surfaced synchronously to the caller of
/// `configure` / `run` / `write_report`.
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    /// Invalid experiment configuration, detected before discovery starts.
    #[error("configuration error: {message}")]
    Configuration {
        /// What was wrong with the configuration.
        message: String,
    },

    /// The expected peer graph was not fully matched in time.
    #[error("discovery timed out in {phase} phase, {} link(s) never matched", missing.len())]
    DiscoveryTimeout {
        /// Phase whose max wait elapsed.
        phase: DiscoveryPhase,
        /// Links that were still invisible at the last poll.
        missing: Vec<PeerLink>,
    },

    /// The report destination could not be written. In-memory stats are unaffected.
    #[error("failed to write report to {}: {source}", path.display())]
    Reporting {
        /// Destination that failed.
        path: PathBuf,
        /// Underlying I/O or encoding error.
        #[source]
        source: std::io::Error,
    },

    /// Operation called in the wrong lifecycle state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Current lifecycle state.
        state: &'static str,
        /// Attempted operation.
        operation: &'static str,
    },
}

impl ExperimentError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ExperimentError::Configuration {
            message: message.into(),
        }
    }
}

/// Participant-level send failures. Counted and logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Nothing on the other side has matched this endpoint yet.
    #[error("no matched peer for {channel}")]
    NoMatchedPeer {
        /// Service, topic or endpoint that had no match.
        channel: String,
    },

    /// The sending endpoint was never created on the transport.
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),

    /// Transport is shut down.
    #[error("transport closed")]
    TransportClosed,
}
