//! Error types for strata-overlay.

use crate::types::{JoinId, NodeId, TierLevel};
use thiserror::Error;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while allocating or confirming placements.
#[derive(Debug, Error)]
pub enum Error {
    /// The tier the caller referred to does not exist on this node.
    #[error("{} not found", .0.title())]
    TierNotFound(TierLevel),

    /// The node handling the request is not the main node of the tier.
    #[error("node_id does not match {0} main node")]
    NotMainNode(TierLevel),

    /// The call carried no acting node identity.
    #[error("no current user/node set")]
    NoLocalNode,

    /// The joiner is not reachable through the peer directory.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// A peer answered with `success: false`.
    #[error("rejected by peer: {0}")]
    Rejected(String),

    /// RPC timeout or connection failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A confirmation arrived for a level deeper than the one awaited.
    #[error("out-of-order confirmation: expected {expected}, received {received}")]
    OutOfOrderConfirmation {
        expected: TierLevel,
        received: TierLevel,
    },

    /// A confirmation did not name this node as its target.
    #[error("confirmation addressed to {0}, not this node")]
    MisaddressedConfirmation(NodeId),

    /// No join with this id is tracked.
    #[error("join not found: {0}")]
    JoinNotFound(JoinId),

    /// A request was missing a field required at its level.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Node Store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for transient failures that the escalator should retry.
    ///
    /// Configuration errors mean the chosen peer is the wrong target and
    /// are never retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
