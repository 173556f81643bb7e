// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use crate::config::{BucketType, KetamaMap, RouteConfig, VbucketMap};
use crate::pipeline::Pipeline;

/// One generation of routing state, derived from a [`RouteConfig`].
///
/// A state is immutable after publication: readers snapshot the mux's state
/// pointer with a single atomic load and route against it without locking.
/// Pipelines are index-aligned with the config's KV server list; any index
/// outside that range resolves to the dead pipeline.
pub struct KvMuxState {
    rev_id: i64,
    uuid: String,
    bkt_type: BucketType,
    vb_map: Option<VbucketMap>,
    ketama_map: Option<KetamaMap>,
    pipelines: Vec<Arc<Pipeline>>,
    dead_pipe: Arc<Pipeline>,
}

impl KvMuxState {
    pub(crate) fn new(
        cfg: &RouteConfig,
        pipelines: Vec<Arc<Pipeline>>,
        dead_pipe: Arc<Pipeline>,
    ) -> Self {
        KvMuxState {
            rev_id: cfg.rev_id,
            uuid: cfg.uuid.clone(),
            bkt_type: cfg.bkt_type,
            vb_map: cfg.vb_map.clone(),
            ketama_map: cfg.ketama_map.clone(),
            pipelines,
            dead_pipe,
        }
    }

    pub fn rev_id(&self) -> i64 {
        self.rev_id
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn bucket_type(&self) -> BucketType {
        self.bkt_type
    }

    pub fn vb_map(&self) -> Option<&VbucketMap> {
        self.vb_map.as_ref()
    }

    pub fn ketama_map(&self) -> Option<&KetamaMap> {
        self.ketama_map.as_ref()
    }

    pub fn num_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    /// Resolve a server index to its pipeline. Out-of-range indices,
    /// including the `-1` of an unowned vbucket copy, land on the dead
    /// pipeline.
    pub fn get_pipeline(&self, index: i32) -> Arc<Pipeline> {
        if index < 0 || index as usize >= self.pipelines.len() {
            Arc::clone(&self.dead_pipe)
        } else {
            Arc::clone(&self.pipelines[index as usize])
        }
    }

    pub(crate) fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    pub(crate) fn dead_pipe(&self) -> &Arc<Pipeline> {
        &self.dead_pipe
    }
}
