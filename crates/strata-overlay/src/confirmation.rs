//! Confirmation State Machine.
//!
//! One [`JoinProgress`] per pending join moves through
//! `Requested(domain) → AwaitingConfirmation(domain) → Confirmed(domain) →
//! Requested(cluster) → … → Confirmed(channel)`.
//!
//! `Requested` means the registration is scheduled but no main node has
//! acknowledged it yet; `AwaitingConfirmation` means it was accepted and the
//! asynchronous confirmation is outstanding. Each send is tagged with an
//! attempt number so a registration scheduled before the level moved on is
//! never delivered.
//!
//! Confirmations are applied strictly in level order. A confirmation for a
//! level already passed is a duplicate and is ignored; one for a deeper
//! level than the one awaited is rejected and leaves the state untouched.

use crate::error::{Error, Result};
use crate::rpc::RegisterConfirmed;
use crate::types::{
    now_millis, ChannelId, ChannelNode, ClusterId, DomainId, JoinId, NodeContext, NodeId,
    TierLevel,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Where a join currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "level", rename_all = "snake_case")]
pub enum JoinPhase {
    /// Registration scheduled, not yet acknowledged by the main node.
    Requested(TierLevel),
    /// Registration accepted; the confirmation is outstanding.
    AwaitingConfirmation(TierLevel),
    Confirmed(TierLevel),
    /// Given up: a peer rejected the registration, or the domain level ran
    /// out of retries.
    Abandoned { level: TierLevel, reason: String },
}

impl JoinPhase {
    /// The level whose confirmation is outstanding, if any.
    pub fn pending_level(&self) -> Option<TierLevel> {
        match self {
            Self::Requested(level) | Self::AwaitingConfirmation(level) => Some(*level),
            _ => None,
        }
    }

    /// True once the join can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Confirmed(TierLevel::Channel) | Self::Abandoned { .. }
        )
    }

    /// True once the joiner is a channel member.
    pub fn is_placed(&self) -> bool {
        matches!(self, Self::Confirmed(TierLevel::Channel))
    }
}

impl fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested(level) => write!(f, "requested({})", level),
            Self::AwaitingConfirmation(level) => write!(f, "awaiting_confirmation({})", level),
            Self::Confirmed(level) => write!(f, "confirmed({})", level),
            Self::Abandoned { level, reason } => write!(f, "abandoned({}): {}", level, reason),
        }
    }
}

/// Why a confirmation was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The level was already confirmed.
    Duplicate,
    /// The join already finished.
    Finished,
}

/// Result of applying a confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStep {
    /// `confirmed` is done; register at `next` with its main node.
    Advance {
        confirmed: TierLevel,
        next: TierLevel,
        next_main: NodeId,
    },
    /// Channel confirmed; the join is complete.
    Completed(ChannelNode),
    Ignored(IgnoreReason),
}

/// State of one join attempt on the joining node.
#[derive(Debug, Clone)]
pub struct JoinProgress {
    pub join_id: JoinId,
    pub ctx: NodeContext,
    pub phase: JoinPhase,
    /// Same-level retries since the current level was first requested.
    pub retry_count: u32,
    /// Bumped on every scheduled registration; tags in-flight sends.
    pub attempt: u64,
    pub domain_id: DomainId,
    pub cluster_id: Option<ClusterId>,
    pub channel_id: Option<ChannelId>,
    /// Main node to register with at each level.
    targets: HashMap<TierLevel, NodeId>,
    pub started_at: u64,
}

impl JoinProgress {
    /// A join that is about to register with `domain_main`.
    pub fn new(join_id: JoinId, ctx: NodeContext, domain_id: DomainId, domain_main: NodeId) -> Self {
        let mut targets = HashMap::new();
        targets.insert(TierLevel::Domain, domain_main);
        Self {
            join_id,
            ctx,
            phase: JoinPhase::Requested(TierLevel::Domain),
            retry_count: 0,
            attempt: 0,
            domain_id,
            cluster_id: None,
            channel_id: None,
            targets,
            started_at: now_millis(),
        }
    }

    /// Main node to contact for `level`.
    pub fn target(&self, level: TierLevel) -> Option<&NodeId> {
        self.targets.get(&level)
    }

    /// Schedule a fresh registration for `level`, returning its attempt.
    pub fn request_level(&mut self, level: TierLevel) -> u64 {
        self.attempt += 1;
        self.phase = JoinPhase::Requested(level);
        self.attempt
    }

    /// Re-schedule the outstanding level's registration.
    pub fn retry(&mut self, level: TierLevel) -> u64 {
        self.retry_count += 1;
        self.request_level(level)
    }

    /// True while `attempt` is the latest registration scheduled for `level`
    /// and that level is still unconfirmed.
    pub fn is_current(&self, level: TierLevel, attempt: u64) -> bool {
        self.attempt == attempt && self.phase.pending_level() == Some(level)
    }

    /// The main node acknowledged `attempt`. Returns true if the phase moved
    /// to `AwaitingConfirmation`.
    pub fn accepted(&mut self, level: TierLevel, attempt: u64) -> bool {
        if self.attempt != attempt || self.phase != JoinPhase::Requested(level) {
            return false;
        }
        self.phase = JoinPhase::AwaitingConfirmation(level);
        true
    }

    /// Apply a confirmation received from a main node.
    pub fn apply(&mut self, confirmation: &RegisterConfirmed) -> Result<ConfirmationStep> {
        let received = confirmation.confirmed_by;
        let expected = match self.phase.pending_level() {
            Some(level) => level,
            None if self.phase.is_terminal() => {
                return Ok(ConfirmationStep::Ignored(IgnoreReason::Finished))
            }
            // Confirmed(level) below channel: the next request is being set up.
            None => match &self.phase {
                JoinPhase::Confirmed(level) => match level.child() {
                    Some(child) => child,
                    None => return Ok(ConfirmationStep::Ignored(IgnoreReason::Finished)),
                },
                _ => return Ok(ConfirmationStep::Ignored(IgnoreReason::Finished)),
            },
        };

        if received < expected {
            return Ok(ConfirmationStep::Ignored(IgnoreReason::Duplicate));
        }
        if received > expected {
            return Err(Error::OutOfOrderConfirmation { expected, received });
        }
        if confirmation.domain_id != self.domain_id {
            return Err(Error::InvalidRequest(format!(
                "confirmation for domain {} does not match join domain {}",
                confirmation.domain_id, self.domain_id
            )));
        }

        match received {
            TierLevel::Domain => {
                let cluster_id = require(&confirmation.cluster_id, "cluster_id")?;
                let next_main = require(&confirmation.next_main_node_id, "next_main_node_id")?;
                self.cluster_id = Some(cluster_id.clone());
                self.channel_id = None;
                self.targets.insert(TierLevel::Domain, confirmation.node_id.clone());
                self.targets.insert(TierLevel::Cluster, next_main.clone());
                self.confirmed(received);
                Ok(ConfirmationStep::Advance {
                    confirmed: received,
                    next: TierLevel::Cluster,
                    next_main: next_main.clone(),
                })
            }
            TierLevel::Cluster => {
                self.check_cluster(confirmation)?;
                let channel_id = require(&confirmation.channel_id, "channel_id")?;
                let next_main = require(&confirmation.next_main_node_id, "next_main_node_id")?;
                self.channel_id = Some(channel_id.clone());
                self.targets.insert(TierLevel::Cluster, confirmation.node_id.clone());
                self.targets.insert(TierLevel::Channel, next_main.clone());
                self.confirmed(received);
                Ok(ConfirmationStep::Advance {
                    confirmed: received,
                    next: TierLevel::Channel,
                    next_main: next_main.clone(),
                })
            }
            TierLevel::Channel => {
                let cluster_id = self.check_cluster(confirmation)?;
                let channel_id = require(&confirmation.channel_id, "channel_id")?;
                if self.channel_id.as_ref() != Some(channel_id) {
                    return Err(Error::InvalidRequest(format!(
                        "confirmation for channel {} does not match assigned channel",
                        channel_id
                    )));
                }
                self.targets.insert(TierLevel::Channel, confirmation.node_id.clone());
                self.confirmed(received);
                Ok(ConfirmationStep::Completed(ChannelNode {
                    node_id: self.ctx.node_id.clone(),
                    domain_id: self.domain_id.clone(),
                    cluster_id,
                    channel_id: channel_id.clone(),
                    last_seen: now_millis(),
                }))
            }
        }
    }

    /// Go back to `upper` for a fresh allocation, dropping the assignments
    /// below it and resetting the retry count. Returns the new attempt.
    pub fn escalate_to(&mut self, upper: TierLevel) -> u64 {
        if upper == TierLevel::Domain {
            self.cluster_id = None;
            self.targets.remove(&TierLevel::Cluster);
        }
        if upper <= TierLevel::Cluster {
            self.channel_id = None;
            self.targets.remove(&TierLevel::Channel);
        }
        self.retry_count = 0;
        self.request_level(upper)
    }

    pub fn abandon(&mut self, level: TierLevel, reason: impl Into<String>) {
        self.phase = JoinPhase::Abandoned {
            level,
            reason: reason.into(),
        };
    }

    /// Serializable view for status queries.
    pub fn snapshot(&self) -> JoinSnapshot {
        JoinSnapshot {
            join_id: self.join_id.clone(),
            node_id: self.ctx.node_id.clone(),
            phase: self.phase.clone(),
            retry_count: self.retry_count,
            domain_id: self.domain_id.clone(),
            cluster_id: self.cluster_id.clone(),
            channel_id: self.channel_id.clone(),
            started_at: self.started_at,
        }
    }

    fn confirmed(&mut self, level: TierLevel) {
        self.phase = JoinPhase::Confirmed(level);
        self.retry_count = 0;
    }

    fn check_cluster(&self, confirmation: &RegisterConfirmed) -> Result<ClusterId> {
        let cluster_id = require(&confirmation.cluster_id, "cluster_id")?;
        if self.cluster_id.as_ref() != Some(cluster_id) {
            return Err(Error::InvalidRequest(format!(
                "confirmation for cluster {} does not match assigned cluster",
                cluster_id
            )));
        }
        Ok(cluster_id.clone())
    }
}

fn require<'a, T>(field: &'a Option<T>, name: &str) -> Result<&'a T> {
    field
        .as_ref()
        .ok_or_else(|| Error::InvalidRequest(format!("confirmation is missing {}", name)))
}

/// Point-in-time view of a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinSnapshot {
    pub join_id: JoinId,
    pub node_id: NodeId,
    pub phase: JoinPhase,
    pub retry_count: u32,
    pub domain_id: DomainId,
    pub cluster_id: Option<ClusterId>,
    pub channel_id: Option<ChannelId>,
    pub started_at: u64,
}
