//! Daemon configuration from `STRATA_*` environment variables.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use strata_overlay::{DomainId, OverlayConfig, PeerAddr, PeerTarget, RetryPolicy};

/// Domain to join at startup and the main node to ask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    pub domain_id: DomainId,
    pub domain_main: PeerTarget,
}

/// Configuration for a Strata node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for storage
    pub data_dir: PathBuf,

    /// HTTP listen address
    pub api_addr: SocketAddr,

    /// Base URL peers use to reach this node
    pub advertise_addr: PeerAddr,

    /// Join an existing domain instead of bootstrapping one
    pub join: Option<JoinTarget>,

    /// Seed entries for the peer directory
    pub peers: Vec<PeerTarget>,

    /// Per-call timeout for peer RPCs
    pub rpc_timeout: Duration,

    /// Interval between `last_seen` refreshes
    pub heartbeat_interval: Duration,

    /// Protocol settings
    pub overlay: OverlayConfig,
}

impl NodeConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`, applying defaults for unset names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let data_dir = PathBuf::from(var("STRATA_DATA_DIR", "./strata-data"));
        let api_addr = parse("STRATA_API_ADDR", &var("STRATA_API_ADDR", "0.0.0.0:7400"))?;
        let advertise_addr = PeerAddr::new(
            var("STRATA_ADVERTISE_ADDR", "http://127.0.0.1:7400")
                .trim_end_matches('/')
                .to_string(),
        );

        let join = match (lookup("STRATA_JOIN_DOMAIN"), lookup("STRATA_JOIN_PEER")) {
            (Some(domain_id), Some(peer)) => Some(JoinTarget {
                domain_id: DomainId::new(domain_id),
                domain_main: parse_peer("STRATA_JOIN_PEER", &peer)?,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config {
                    name: "STRATA_JOIN_DOMAIN",
                    reason: "STRATA_JOIN_DOMAIN and STRATA_JOIN_PEER must be set together"
                        .to_string(),
                })
            }
        };

        let peers = lookup("STRATA_PEERS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| parse_peer("STRATA_PEERS", p))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let rpc_timeout = Duration::from_secs(parse(
            "STRATA_RPC_TIMEOUT_SECS",
            &var("STRATA_RPC_TIMEOUT_SECS", "10"),
        )?);
        let confirmation_timeout = Duration::from_secs(parse(
            "STRATA_CONFIRMATION_TIMEOUT_SECS",
            &var("STRATA_CONFIRMATION_TIMEOUT_SECS", "60"),
        )?);
        let max_retries = parse("STRATA_MAX_RETRIES", &var("STRATA_MAX_RETRIES", "3"))?;
        let tier_capacity: u32 =
            parse("STRATA_TIER_CAPACITY", &var("STRATA_TIER_CAPACITY", "1000"))?;
        if tier_capacity == 0 {
            return Err(Error::Config {
                name: "STRATA_TIER_CAPACITY",
                reason: "must be at least 1".to_string(),
            });
        }
        let heartbeat_interval = Duration::from_secs(parse(
            "STRATA_HEARTBEAT_SECS",
            &var("STRATA_HEARTBEAT_SECS", "30"),
        )?);
        let bootstrap_on_exhaustion = parse(
            "STRATA_BOOTSTRAP_ON_EXHAUSTION",
            &var("STRATA_BOOTSTRAP_ON_EXHAUSTION", "false"),
        )?;

        let overlay = OverlayConfig::default()
            .with_retry(
                RetryPolicy::default()
                    .with_timeout(confirmation_timeout)
                    .with_max_retries(max_retries),
            )
            .with_tier_capacity(tier_capacity)
            .with_bootstrap_on_exhaustion(bootstrap_on_exhaustion);

        Ok(Self {
            data_dir,
            api_addr,
            advertise_addr,
            join,
            peers,
            rpc_timeout,
            heartbeat_interval,
            overlay,
        })
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::Config {
        name,
        reason: format!("{:?}: {}", value, e),
    })
}

fn parse_peer(name: &'static str, value: &str) -> Result<PeerTarget> {
    PeerTarget::parse(value).ok_or_else(|| Error::Config {
        name,
        reason: format!("{:?} is not node_id@url", value),
    })
}
