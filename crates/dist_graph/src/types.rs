//! Core types and error definitions for dist_graph.

use data_contracts::ContractError;
use thiserror::Error;

/// Global node identifier.
pub type NodeId = u64;

pub type DistResult<T> = Result<T, DistGraphError>;

#[derive(Debug, Error)]
pub enum DistGraphError {
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("partition config describes graph {found:?}, expected {expected:?}")]
    GraphName { expected: String, found: String },
    #[error("node {id} out of range 0..{num_nodes}")]
    NodeOutOfRange { id: NodeId, num_nodes: u64 },
    #[error("node data {0:?} not found")]
    MissingNodeData(String),
    #[error("tensor {name:?} already exists with shape {existing:?}, requested {requested:?}")]
    TensorShape {
        name: String,
        existing: [usize; 2],
        requested: [usize; 2],
    },
    #[error("tensor {name:?}: expected {expected} values, got {found}")]
    RowData {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("unsupported process group backend {0:?}; expected gloo, nccl or mpi")]
    Backend(String),
    #[error("invalid fan-out {0:?}")]
    Fanout(String),
    #[error("rank {rank} out of range for world size {world_size}")]
    Rank { rank: usize, world_size: usize },
    #[error("world size {world_size} does not match {num_parts} partitions")]
    WorldSize { world_size: usize, num_parts: usize },
    #[error("batch size must be positive")]
    BatchSize,
    #[error("process group aborted by a failed rank")]
    Aborted,
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}
