// Copyright 2020 Joyent, Inc.

use crc32c::crc32c;
use sha1::Sha1;

use crate::error::Error;

// Standard ketama density: 40 hash iterations per server, 4 ring points per
// digest.
const KETAMA_ITERATIONS: usize = 40;
const KETAMA_POINTS_PER_HASH: usize = 4;

/// How keys are distributed across the servers of a bucket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BucketType {
    /// Cluster-level configuration with no bucket attached (GCCCP).
    /// Requests route to the first server.
    None,
    /// Vbucket-mapped bucket.
    Couchbase,
    /// Ketama-hashed bucket. No replicas, keys required.
    Memcached,
}

/// An immutable topology snapshot delivered by an external configuration
/// source (CCCP/GCCCP polling or the HTTP streaming endpoint; both are
/// outside the core).
#[derive(Clone, Debug)]
pub struct RouteConfig {
    /// Revision of this snapshot. `-1` when the source could not supply
    /// one; such configs are always applied.
    pub rev_id: i64,
    pub uuid: String,
    pub bkt_type: BucketType,
    /// `host:port` of every data node, in config order. Pipeline indices
    /// align with this list.
    pub kv_server_list: Vec<String>,
    pub vb_map: Option<VbucketMap>,
    pub ketama_map: Option<KetamaMap>,
    /// Ancillary service endpoints carried along for the embedding layer.
    pub mgmt_ep_list: Vec<String>,
    pub capi_ep_list: Vec<String>,
    pub n1ql_ep_list: Vec<String>,
    pub fts_ep_list: Vec<String>,
}

impl RouteConfig {
    /// A config is usable iff its network view yields at least one KV
    /// server and the partition maps are consistent with the bucket type.
    pub fn is_valid(&self) -> bool {
        if self.kv_server_list.is_empty() {
            return false;
        }
        match self.bkt_type {
            BucketType::Couchbase => self.vb_map.as_ref().map_or(false, VbucketMap::is_valid),
            BucketType::Memcached => self.ketama_map.as_ref().map_or(false, |m| !m.is_empty()),
            BucketType::None => true,
        }
    }

    pub fn is_gcccp(&self) -> bool {
        self.bkt_type == BucketType::None
    }
}

/// The vbucket table of a couchbase bucket: `entries[vbucket][replica]`
/// holds a server index, or `-1` where no server currently owns that copy.
#[derive(Clone, Debug)]
pub struct VbucketMap {
    entries: Vec<Vec<i32>>,
    num_replicas: usize,
}

impl VbucketMap {
    pub fn new(entries: Vec<Vec<i32>>, num_replicas: usize) -> Self {
        VbucketMap {
            entries,
            num_replicas,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.entries.is_empty()
            && self
                .entries
                .iter()
                .all(|row| row.len() == self.num_replicas + 1)
    }

    pub fn num_vbuckets(&self) -> usize {
        self.entries.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Hash a key to its vbucket.
    pub fn vbucket_by_key(&self, key: &[u8]) -> u16 {
        if self.entries.is_empty() {
            return 0;
        }
        let crc = crc32c(key);
        (((crc >> 16) & 0x7fff) as usize % self.entries.len()) as u16
    }

    /// Look up the server index holding the given copy of a vbucket. A `-1`
    /// result means the copy currently has no owner; callers route such
    /// requests to the dead pipeline.
    pub fn node_by_vbucket(&self, vbucket: u16, replica_idx: u32) -> Result<i32, Error> {
        let row = self
            .entries
            .get(usize::from(vbucket))
            .ok_or(Error::InvalidVbucket)?;
        if replica_idx as usize > self.num_replicas {
            return Err(Error::InvalidReplica);
        }
        Ok(row.get(replica_idx as usize).copied().unwrap_or(-1))
    }

    pub fn node_by_key(&self, key: &[u8], replica_idx: u32) -> Result<i32, Error> {
        self.node_by_vbucket(self.vbucket_by_key(key), replica_idx)
    }

    /// The vbuckets whose active copy lives on the given server.
    pub fn vbuckets_on_server(&self, server_idx: usize) -> Vec<u16> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, row)| row.first().copied() == Some(server_idx as i32))
            .map(|(vbucket, _)| vbucket as u16)
            .collect()
    }
}

/// The consistent-hash ring of a memcached bucket. Each server contributes
/// 160 points derived from its address, so servers joining or leaving move
/// only a proportional share of the keyspace.
#[derive(Clone, Debug)]
pub struct KetamaMap {
    ring: Vec<(u32, usize)>,
}

impl KetamaMap {
    pub fn from_servers(servers: &[String]) -> Self {
        let mut ring = Vec::with_capacity(servers.len() * KETAMA_ITERATIONS * KETAMA_POINTS_PER_HASH);
        for (server_idx, server) in servers.iter().enumerate() {
            for iteration in 0..KETAMA_ITERATIONS {
                let mut sha = Sha1::new();
                sha.update(format!("{}-{}", server, iteration).as_bytes());
                let digest = sha.digest().bytes();
                for point in 0..KETAMA_POINTS_PER_HASH {
                    let hash = u32::from_le_bytes([
                        digest[point * 4],
                        digest[point * 4 + 1],
                        digest[point * 4 + 2],
                        digest[point * 4 + 3],
                    ]);
                    ring.push((hash, server_idx));
                }
            }
        }
        ring.sort_unstable();
        KetamaMap { ring }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Map a key to the server owning the first ring point at or after the
    /// key's hash, wrapping at the top of the ring.
    pub fn node_by_key(&self, key: &[u8]) -> Result<i32, Error> {
        if self.ring.is_empty() {
            return Err(Error::Internal(String::from("ketama ring has no entries")));
        }
        let hash = Self::hash_key(key);
        let pos = self.ring.partition_point(|&(point, _)| point < hash);
        let (_, server_idx) = self.ring[pos % self.ring.len()];
        Ok(server_idx as i32)
    }

    fn hash_key(key: &[u8]) -> u32 {
        let mut sha = Sha1::new();
        sha.update(key);
        let digest = sha.digest().bytes();
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}
