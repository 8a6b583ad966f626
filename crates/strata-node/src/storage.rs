//! Persistent Node Store using RocksDB.
//!
//! Keys:
//!
//! | key                               | value              |
//! |-----------------------------------|--------------------|
//! | `domain:{domain_id}`              | `DomainMainNode`   |
//! | `cluster:{cluster_id}`            | `ClusterMainNode`  |
//! | `channel:{channel_id}`            | `ChannelMainNode`  |
//! | `member:{channel_id}:{node_id}`   | `ChannelNode`      |
//! | `local:{level}`                   | `MainNodeRecord`   |
//! | `node:signing_key`                | raw ed25519 seed   |

use crate::error::{Error, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use rocksdb::{Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use strata_overlay::{
    ChannelId, ChannelMainNode, ChannelNode, ClusterId, ClusterMainNode, DomainId,
    DomainMainNode, MainNodeRecord, NodeId, NodeStore, TierLevel,
};

const SIGNING_KEY: &[u8] = b"node:signing_key";

/// RocksDB-backed storage for a Strata node.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_vec(value)?;
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let prefix = prefix.as_bytes();
        let mut rows = Vec::new();

        for item in self.db.prefix_iterator(prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push(serde_json::from_slice(&value)?);
        }

        Ok(rows)
    }

    /// Rewrite every row under `prefix` with `last_seen = now`.
    fn touch_prefix<T, F>(&self, prefix: &str, key_of: impl Fn(&T) -> String, touch: F) -> Result<usize>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&mut T),
    {
        let mut rows: Vec<T> = self.scan(prefix)?;
        for row in rows.iter_mut() {
            touch(row);
        }
        for row in &rows {
            self.put_json(&key_of(row), row)?;
        }
        Ok(rows.len())
    }

    // --- Node Identity ---

    /// Get or create the node's signing key (persistent identity).
    pub fn get_or_create_node_key(&self) -> Result<SigningKey> {
        if let Some(data) = self.db.get(SIGNING_KEY)? {
            let bytes: [u8; 32] = data
                .as_slice()
                .try_into()
                .map_err(|_| Error::Storage("Invalid stored key".into()))?;
            Ok(SigningKey::from_bytes(&bytes))
        } else {
            let mut seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            let signing_key = SigningKey::from_bytes(&seed);
            self.db.put(SIGNING_KEY, signing_key.as_bytes())?;
            Ok(signing_key)
        }
    }
}

/// Node id for a public key: `b3b3/<hex(blake3(blake3(pubkey)))>`.
pub fn compute_node_id(pubkey: &VerifyingKey) -> NodeId {
    let hash1 = blake3::hash(pubkey.as_bytes());
    let hash2 = blake3::hash(hash1.as_bytes());
    NodeId::new(format!("b3b3/{}", hex::encode(hash2.as_bytes())))
}

impl NodeStore for RocksStore {
    fn put_domain_main(&self, row: &DomainMainNode) -> strata_overlay::Result<()> {
        Ok(self.put_json(&format!("domain:{}", row.domain_id), row)?)
    }

    fn get_domain_main(&self, domain_id: &DomainId) -> strata_overlay::Result<Option<DomainMainNode>> {
        Ok(self.get_json(&format!("domain:{}", domain_id))?)
    }

    fn list_domain_mains(&self) -> strata_overlay::Result<Vec<DomainMainNode>> {
        Ok(self.scan("domain:")?)
    }

    fn put_cluster_main(&self, row: &ClusterMainNode) -> strata_overlay::Result<()> {
        Ok(self.put_json(&format!("cluster:{}", row.cluster_id), row)?)
    }

    fn get_cluster_main(&self, cluster_id: &ClusterId) -> strata_overlay::Result<Option<ClusterMainNode>> {
        Ok(self.get_json(&format!("cluster:{}", cluster_id))?)
    }

    fn list_cluster_mains(&self, domain_id: &DomainId) -> strata_overlay::Result<Vec<ClusterMainNode>> {
        let rows: Vec<ClusterMainNode> = self.scan("cluster:")?;
        Ok(rows.into_iter().filter(|r| &r.domain_id == domain_id).collect())
    }

    fn put_channel_main(&self, row: &ChannelMainNode) -> strata_overlay::Result<()> {
        Ok(self.put_json(&format!("channel:{}", row.channel_id), row)?)
    }

    fn get_channel_main(&self, channel_id: &ChannelId) -> strata_overlay::Result<Option<ChannelMainNode>> {
        Ok(self.get_json(&format!("channel:{}", channel_id))?)
    }

    fn list_channel_mains(&self, cluster_id: &ClusterId) -> strata_overlay::Result<Vec<ChannelMainNode>> {
        let rows: Vec<ChannelMainNode> = self.scan("channel:")?;
        Ok(rows.into_iter().filter(|r| &r.cluster_id == cluster_id).collect())
    }

    fn put_channel_node(&self, row: &ChannelNode) -> strata_overlay::Result<()> {
        Ok(self.put_json(&format!("member:{}:{}", row.channel_id, row.node_id), row)?)
    }

    fn list_channel_nodes(&self, channel_id: &ChannelId) -> strata_overlay::Result<Vec<ChannelNode>> {
        Ok(self.scan(&format!("member:{}:", channel_id))?)
    }

    fn local_main(&self, level: TierLevel) -> strata_overlay::Result<Option<MainNodeRecord>> {
        Ok(self.get_json(&format!("local:{}", level))?)
    }

    fn replace_local_main(&self, record: &MainNodeRecord) -> strata_overlay::Result<()> {
        Ok(self.put_json(&format!("local:{}", record.level()), record)?)
    }

    fn touch_all(&self, now: u64) -> strata_overlay::Result<usize> {
        let mut touched = 0;
        touched += self.touch_prefix(
            "domain:",
            |r: &DomainMainNode| format!("domain:{}", r.domain_id),
            |r| r.last_seen = now,
        )?;
        touched += self.touch_prefix(
            "cluster:",
            |r: &ClusterMainNode| format!("cluster:{}", r.cluster_id),
            |r| r.last_seen = now,
        )?;
        touched += self.touch_prefix(
            "channel:",
            |r: &ChannelMainNode| format!("channel:{}", r.channel_id),
            |r| r.last_seen = now,
        )?;
        touched += self.touch_prefix(
            "member:",
            |r: &ChannelNode| format!("member:{}:{}", r.channel_id, r.node_id),
            |r| r.last_seen = now,
        )?;
        touched += self.touch_prefix(
            "local:",
            |r: &MainNodeRecord| format!("local:{}", r.level()),
            |r| r.touch(now),
        )?;
        Ok(touched)
    }
}
