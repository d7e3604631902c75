//! Shared data contracts for partitioned graphs and cluster configuration.

pub mod ip_config;
pub mod partition;

pub use ip_config::{IpConfig, MachineAddr, NetType};
pub use partition::{
    ContractError, NodeDataFile, PartFiles, PartGraphFile, PartitionConfig,
    PartitionSchemaVersion,
};
