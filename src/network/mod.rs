mod network;
mod routing;
mod scaling;
mod transfers;
mod types;

pub use network::{FabricSimulator, StorageVirtualNetwork};
pub use types::{
    ActiveChunk, AssembleOutcome, DemandScalingConfig, FabricEvent, FabricManifest, FileSegment,
    NetworkEvent, NodeTelemetry, RoutingStrategy, ScalingTrigger, TransferPurpose,
};
