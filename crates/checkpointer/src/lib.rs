//! A crate for keeping node-local checkpoints of self-hosted Kubernetes control plane pods.
//!
//! Pods annotated with `checkpointer.alpha.coreos.com/checkpoint: "true"` get a sanitized copy
//! of their manifest (and of the secrets and config maps they mount) staged on the node. When
//! the pod stops running and the API server can't bring it back, the staged copy is handed to
//! the kubelet as a static pod until the real pod returns. Checkpoints whose pods are gone from
//! the API server for longer than a grace period are garbage collected.
//!
//! The [`Checkpointer`] runs the loop; the [`reconcile::ReconciliationEngine`] and the
//! [`state::CheckpointState`] machine make the decisions.
//!
//! # Example
//! ```rust,no_run
//! use checkpointer::{config::Config, Checkpointer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default_config("pod-checkpointer-abcde")?;
//!     let kube_config = kube::Config::infer().await?;
//!     let mut checkpointer = Checkpointer::new(&config, kube_config)?;
//!     checkpointer.run().await
//! }
//! ```

#![warn(missing_docs)]
#![deny(rustdoc::private_intra_doc_links)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

mod checkpointer;
pub mod config;
pub mod pod;
pub mod reconcile;
pub mod sanitize;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod store;

pub use self::checkpointer::Checkpointer;

#[doc(inline)]
pub use pod::{CheckpointId, Pod};

/// The generated client for the container runtime interface
#[allow(missing_docs)]
pub mod runtime_api {
    pub mod v1alpha2 {
        tonic::include_proto!("runtime.v1alpha2");
    }
}
