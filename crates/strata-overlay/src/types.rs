//! Identifiers, tier levels, and the rows kept by a Node Store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier text.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True if the identifier is the empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque node identifier, stable for the lifetime of a running instance.
    NodeId
);
string_id!(
    /// Domain identifier.
    DomainId
);
string_id!(
    /// Cluster identifier, unique across domains.
    ClusterId
);
string_id!(
    /// Channel identifier, unique across clusters.
    ChannelId
);
string_id!(
    /// Identifier of one in-flight join attempt.
    JoinId
);

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh identifier for a tier instance created by `creator`.
///
/// The id is a truncated BLAKE3 hash over the creator, the tier level, the
/// wall clock, and a process-wide counter, prefixed with the tier initial.
pub fn generate_tier_id(level: TierLevel, creator: &NodeId) -> String {
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = blake3::Hasher::new();
    hasher.update(creator.as_str().as_bytes());
    hasher.update(level.as_str().as_bytes());
    hasher.update(&now_millis().to_be_bytes());
    hasher.update(&seq.to_be_bytes());
    let hash = hasher.finalize();
    format!("{}-{}", level.prefix(), hex::encode(&hash.as_bytes()[..12]))
}

impl JoinId {
    /// Generate a fresh join identifier for `node`.
    pub fn generate(node: &NodeId) -> Self {
        let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"join");
        hasher.update(node.as_str().as_bytes());
        hasher.update(&now_millis().to_be_bytes());
        hasher.update(&seq.to_be_bytes());
        Self(format!("j-{}", hex::encode(&hasher.finalize().as_bytes()[..12])))
    }
}

/// One level of the three-tier hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierLevel {
    Domain,
    Cluster,
    Channel,
}

impl TierLevel {
    /// All levels, top to bottom.
    pub const ALL: [TierLevel; 3] = [TierLevel::Domain, TierLevel::Cluster, TierLevel::Channel];

    /// The level below this one, if any.
    pub const fn child(self) -> Option<TierLevel> {
        match self {
            Self::Domain => Some(Self::Cluster),
            Self::Cluster => Some(Self::Channel),
            Self::Channel => None,
        }
    }

    /// The level above this one, if any.
    pub const fn parent(self) -> Option<TierLevel> {
        match self {
            Self::Domain => None,
            Self::Cluster => Some(Self::Domain),
            Self::Channel => Some(Self::Cluster),
        }
    }

    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Cluster => "cluster",
            Self::Channel => "channel",
        }
    }

    /// Capitalized display name used in error messages.
    pub const fn title(self) -> &'static str {
        match self {
            Self::Domain => "Domain",
            Self::Cluster => "Cluster",
            Self::Channel => "Channel",
        }
    }

    const fn prefix(self) -> &'static str {
        match self {
            Self::Domain => "d",
            Self::Cluster => "c",
            Self::Channel => "h",
        }
    }
}

impl fmt::Display for TierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The node currently admitting members into a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMainNode {
    pub node_id: NodeId,
    pub domain_id: DomainId,
    pub last_seen: u64,
}

/// The node admitting members into one cluster of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMainNode {
    pub node_id: NodeId,
    pub domain_id: DomainId,
    pub cluster_id: ClusterId,
    /// Nodes admitted into this cluster, the creator included.
    pub member_count: u32,
    pub created_at: u64,
    pub last_seen: u64,
}

/// The node admitting members into one channel of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMainNode {
    pub node_id: NodeId,
    pub domain_id: DomainId,
    pub cluster_id: ClusterId,
    pub channel_id: ChannelId,
    /// Channel members, the creator included.
    pub member_count: u32,
    pub created_at: u64,
    pub last_seen: u64,
}

/// A leaf member of a channel: the terminal placement of a joining node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelNode {
    pub node_id: NodeId,
    pub domain_id: DomainId,
    pub cluster_id: ClusterId,
    pub channel_id: ChannelId,
    pub last_seen: u64,
}

impl DomainMainNode {
    pub fn new(node_id: NodeId, domain_id: DomainId) -> Self {
        Self {
            node_id,
            domain_id,
            last_seen: now_millis(),
        }
    }
}

impl ClusterMainNode {
    pub fn new(node_id: NodeId, domain_id: DomainId, cluster_id: ClusterId) -> Self {
        let now = now_millis();
        Self {
            node_id,
            domain_id,
            cluster_id,
            member_count: 0,
            created_at: now,
            last_seen: now,
        }
    }
}

impl ChannelMainNode {
    pub fn new(
        node_id: NodeId,
        domain_id: DomainId,
        cluster_id: ClusterId,
        channel_id: ChannelId,
    ) -> Self {
        let now = now_millis();
        Self {
            node_id,
            domain_id,
            cluster_id,
            channel_id,
            member_count: 0,
            created_at: now,
            last_seen: now,
        }
    }

    /// The member row for this channel's own main node.
    pub fn creator_member(&self) -> ChannelNode {
        ChannelNode {
            node_id: self.node_id.clone(),
            domain_id: self.domain_id.clone(),
            cluster_id: self.cluster_id.clone(),
            channel_id: self.channel_id.clone(),
            last_seen: now_millis(),
        }
    }
}

/// A locally cached main-node record for one level.
///
/// A process keeps at most one of these per level; a fresh confirmation
/// replaces the previous record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum MainNodeRecord {
    Domain(DomainMainNode),
    Cluster(ClusterMainNode),
    Channel(ChannelMainNode),
}

impl MainNodeRecord {
    pub fn level(&self) -> TierLevel {
        match self {
            Self::Domain(_) => TierLevel::Domain,
            Self::Cluster(_) => TierLevel::Cluster,
            Self::Channel(_) => TierLevel::Channel,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::Domain(row) => &row.node_id,
            Self::Cluster(row) => &row.node_id,
            Self::Channel(row) => &row.node_id,
        }
    }

    pub fn touch(&mut self, now: u64) {
        match self {
            Self::Domain(row) => row.last_seen = now,
            Self::Cluster(row) => row.last_seen = now,
            Self::Channel(row) => row.last_seen = now,
        }
    }
}

/// A tier instance selected by the Allocation Engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierRef {
    Cluster(ClusterMainNode),
    Channel(ChannelMainNode),
}

impl TierRef {
    pub fn level(&self) -> TierLevel {
        match self {
            Self::Cluster(_) => TierLevel::Cluster,
            Self::Channel(_) => TierLevel::Channel,
        }
    }

    /// Main node of the referenced tier.
    pub fn main_node_id(&self) -> &NodeId {
        match self {
            Self::Cluster(row) => &row.node_id,
            Self::Channel(row) => &row.node_id,
        }
    }

    pub fn member_count(&self) -> u32 {
        match self {
            Self::Cluster(row) => row.member_count,
            Self::Channel(row) => row.member_count,
        }
    }
}

/// The parent under which the Allocation Engine searches for a child tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierParent {
    /// Search clusters of a domain.
    Domain(DomainId),
    /// Search channels of a cluster.
    Cluster(ClusterId),
}

impl TierParent {
    /// Level of the children searched under this parent.
    pub fn child_level(&self) -> TierLevel {
        match self {
            Self::Domain(_) => TierLevel::Cluster,
            Self::Cluster(_) => TierLevel::Channel,
        }
    }
}

/// Address of a peer's RPC endpoint (for the HTTP carrier, a base URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddr(pub String);

impl PeerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer known by id and reachable at an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTarget {
    pub node_id: NodeId,
    pub addr: PeerAddr,
}

impl PeerTarget {
    pub fn new(node_id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            addr: PeerAddr::new(addr),
        }
    }

    /// Parse the `node_id@addr` form used in configuration.
    pub fn parse(spec: &str) -> Option<Self> {
        let (node_id, addr) = spec.trim().split_once('@')?;
        if node_id.is_empty() || addr.is_empty() {
            return None;
        }
        Some(Self::new(node_id, addr))
    }
}

/// The identity a Node Manager call acts as.
///
/// Passed explicitly into every call so concurrent joins never share a
/// mutable notion of "the current node".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContext {
    pub node_id: NodeId,
    /// Address other peers use to reach this node.
    pub addr: Option<PeerAddr>,
}

impl NodeContext {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            addr: None,
        }
    }

    #[must_use]
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(PeerAddr::new(addr));
        self
    }

    /// The acting node id, or `NoLocalNode` if none is set.
    pub fn require_node(&self) -> crate::Result<&NodeId> {
        if self.node_id.is_empty() {
            Err(crate::Error::NoLocalNode)
        } else {
            Ok(&self.node_id)
        }
    }
}
