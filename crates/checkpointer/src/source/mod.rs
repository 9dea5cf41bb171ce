//! The places the checkpointer learns about pods from.
//!
//! Every source is polled once per pass. A source that fails is not fatal to the pass: the
//! caller decides how to degrade (see [`crate::Checkpointer`]).
use std::collections::BTreeSet;

use crate::pod::{CheckpointId, PodMap};

pub mod apiserver;
pub mod cri;
pub mod kubelet;

pub use apiserver::ApiServerClient;
pub use cri::RuntimeClient;
pub use kubelet::KubeletClient;

/// A source of parent pods bound to this node
#[async_trait::async_trait]
pub trait PodSource: Send + Sync {
    /// Lists the parent pods the source knows about, keyed by checkpoint id
    async fn pods(&self) -> anyhow::Result<PodMap>;
}

/// A source of the pods actually running on this node
#[async_trait::async_trait]
pub trait RuntimeSource: Send + Sync {
    /// Lists the pods with a ready sandbox and at least one running container. Checkpoints are
    /// never reported
    async fn running_pods(&self) -> anyhow::Result<BTreeSet<CheckpointId>>;
}
