//! fabricstream: a deterministic simulator of a wide-area content-addressed
//! storage fabric, plus the control plane that uses it as its data plane.
//!
//! The fabric side is a discrete-event world: virtual nodes with disks,
//! cooperative OS schedulers, and latency-weighted links, driven by a
//! single-threaded simulator with per-link max-min bandwidth sharing and
//! multi-hop chunk routing. The control plane layers resumable uploads,
//! manifests with versioning, replica placement, lifecycle tiering,
//! durability annotations, and healing sweeps on top, funnelling every
//! fabric mutation through one controller.

pub mod bus;
pub mod config;
pub mod controller;
pub mod disk;
pub mod download;
pub mod durability;
pub mod healing;
pub mod lifecycle;
pub mod metadata;
pub mod metrics;
pub mod network;
pub mod node;
pub mod replica;
pub mod sim;
pub mod snapshot;
pub mod upload;
pub mod vos;

pub use bus::{InMemoryBus, MessageEnvelope};
pub use config::FabricConfig;
pub use controller::{ControllerHandle, ControllerRuntime, FabricController, NodeSpec};
pub use disk::VirtualDisk;
pub use download::{DownloadChunk, DownloadStream};
pub use durability::DurabilityManager;
pub use healing::HealingService;
pub use lifecycle::LifecycleManager;
pub use metadata::MetadataStore;
pub use network::{DemandScalingConfig, RoutingStrategy, StorageVirtualNetwork};
pub use node::StorageVirtualNode;
pub use replica::ReplicaManager;
pub use sim::Simulator;
pub use upload::UploadOrchestrator;
pub use vos::VirtualOs;
