//! Minibatch iteration over a rank's node ids.

use crate::graph::DistGraph;
use crate::sampler::{Block, NeighborSampler};
use crate::types::{DistGraphError, DistResult, NodeId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    pub seed: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            shuffle: false,
            drop_last: false,
            seed: None,
        }
    }
}

/// One sampled minibatch.
#[derive(Debug, Clone)]
pub struct MiniBatch {
    pub input_nodes: Vec<NodeId>,
    pub seeds: Vec<NodeId>,
    pub blocks: Vec<Block>,
}

pub struct DistNodeDataLoader {
    graph: DistGraph,
    nids: Vec<NodeId>,
    order: Vec<NodeId>,
    sampler: NeighborSampler,
    cfg: LoaderConfig,
    rng: StdRng,
    cursor: usize,
}

impl DistNodeDataLoader {
    pub fn new(
        graph: DistGraph,
        nids: Vec<NodeId>,
        sampler: NeighborSampler,
        cfg: LoaderConfig,
    ) -> DistResult<Self> {
        if cfg.batch_size == 0 {
            return Err(DistGraphError::BatchSize);
        }
        let rng = match cfg.seed {
            // Offset by rank so trainers do not draw identical permutations.
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(graph.rank() as u64)),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let mut loader = Self {
            graph,
            order: nids.clone(),
            nids,
            sampler,
            cfg,
            rng,
            cursor: 0,
        };
        loader.reset();
        Ok(loader)
    }

    /// Start a new pass; reshuffles when configured.
    pub fn reset(&mut self) {
        self.order.clone_from(&self.nids);
        if self.cfg.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        let n = self.nids.len();
        if self.cfg.drop_last {
            n / self.cfg.batch_size
        } else {
            n.div_ceil(self.cfg.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_batch(&mut self) -> DistResult<Option<MiniBatch>> {
        let remaining = self.order.len() - self.cursor;
        if remaining == 0 || (self.cfg.drop_last && remaining < self.cfg.batch_size) {
            return Ok(None);
        }
        let end = (self.cursor + self.cfg.batch_size).min(self.order.len());
        let seeds = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        let (input_nodes, blocks) = self
            .sampler
            .sample_blocks(&self.graph, &seeds, &mut self.rng)?;
        Ok(Some(MiniBatch {
            input_nodes,
            seeds,
            blocks,
        }))
    }
}
