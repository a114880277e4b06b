//! # zfssa-csi — CSI driver engine for the ZFS Storage Appliance
//!
//! `zfssa-csi` provisions block volumes (iSCSI LUNs) and filesystem volumes
//! (NFS shares) on an Oracle ZFS Storage Appliance through its REST v2
//! management interface, and exposes the [Container Storage Interface][csi]
//! Identity, Controller, and Node services over a UNIX-socket transport. It
//! follows the usual conventions of this stack: Tokio async runtime,
//! `tracing` for observability, `thiserror` for structured errors.
//!
//! The interesting part is the per-resource concurrency control plane: the
//! orchestrator may lose state and repeat any call, so every mutation runs
//! under an exclusive per-name handle (see [`registry`]) and every create
//! and delete is idempotent, reconciling 409/404 answers from the appliance
//! instead of failing.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: capabilities, requests, responses. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`id`] | Volume and snapshot identifier codec. |
//! | [`config`] | Environment configuration and credentials. |
//! | [`registry`] | Exclusive-access registry with latches and refcounts. |
//! | [`zfssa`] | Typed REST client with session-token lifecycle. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait — volume & snapshot lifecycle. |
//! | [`node`] | [`CsiNode`] trait — attach, mount, unmount, detach. |
//! | [`driver`] | [`ZfssaDriver`] — the appliance-backed implementation. |
//! | [`message`] | [`CsiMessage`] protocol envelope. |
//! | [`transport`] | UNIX-socket server and client. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod id;
pub mod identity;
pub mod message;
pub mod node;
pub mod registry;
pub mod transport;
pub mod types;
pub mod zfssa;

// Re-export the most commonly used items at crate root for convenience.
pub use config::Config;
pub use controller::CsiController;
pub use driver::ZfssaDriver;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;

/// Name the plugin registers under.
pub const DRIVER_NAME: &str = "zfssa-csi-driver";

/// Version reported by the Identity service.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
