//! In-process distributed graph runtime for data-parallel GNN training.
//!
//! This crate provides the graph-side surface a trainer consumes:
//! - Cluster bootstrap from an IP config and a partition config
//! - Per-rank `DistGraph` handles with a `PartitionBook`
//! - `node_split` for partition-aware assignment of node ids to ranks
//! - Neighbor sampling into bipartite `Block`s and a node data loader
//! - `DistTensor` row storage shared by every rank
//! - `ProcessGroup` collectives (barrier, all-reduce, broadcast, all-gather)
//!
//! Every partition is served from the same process; each trainer runs on
//! its own thread and talks to the shared state through these handles.

pub mod graph;
pub mod loader;
pub mod partition;
pub mod runtime;
pub mod sampler;
pub mod split;
pub mod tensor;
pub mod types;

pub use graph::{DistGraph, GraphServer, PartitionBook};
pub use loader::{DistNodeDataLoader, LoaderConfig, MiniBatch};
pub use partition::{partition_graph, synthetic_graph, GraphData, SyntheticGraphConfig};
pub use runtime::{initialize, DistRuntime, ProcessGroup};
pub use sampler::{Block, NeighborSampler};
pub use split::{node_split, split_ids};
pub use tensor::DistTensor;
pub use types::*;
