use crate::graph::DistGraph;
use crate::types::{DistGraphError, DistResult, NodeId};
use rand::Rng;
use std::collections::HashMap;

/// Bipartite sampled subgraph feeding one model layer.
///
/// `src_nodes` starts with the destination nodes, followed by the sampled
/// neighbors that are not destinations themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub src_nodes: Vec<NodeId>,
    pub num_dst: usize,
    /// `(src_local, dst_local)` pairs.
    pub edges: Vec<(usize, usize)>,
}

impl Block {
    pub fn num_src(&self) -> usize {
        self.src_nodes.len()
    }

    pub fn num_dst(&self) -> usize {
        self.num_dst
    }

    pub fn dst_nodes(&self) -> &[NodeId] {
        &self.src_nodes[..self.num_dst]
    }

    pub fn in_degrees(&self) -> Vec<usize> {
        let mut deg = vec![0usize; self.num_dst];
        for &(_, dst) in &self.edges {
            deg[dst] += 1;
        }
        deg
    }

    /// `1 / in_degree` per destination, zero for isolated destinations.
    pub fn inverse_in_degrees(&self) -> Vec<f32> {
        self.in_degrees()
            .into_iter()
            .map(|d| if d == 0 { 0.0 } else { 1.0 / d as f32 })
            .collect()
    }

    /// Sample up to `fanout` in-neighbors of each of `dst` (`-1` = all).
    pub fn sample<R: Rng + ?Sized>(
        g: &DistGraph,
        dst: &[NodeId],
        fanout: i64,
        rng: &mut R,
    ) -> DistResult<Self> {
        let mut src_nodes = dst.to_vec();
        let mut local: HashMap<NodeId, usize> = HashMap::with_capacity(dst.len() * 2);
        for (pos, &id) in dst.iter().enumerate() {
            local.entry(id).or_insert(pos);
        }
        let mut edges = Vec::new();
        for (dst_local, &node) in dst.iter().enumerate() {
            let neigh = g.in_neighbors(node)?;
            let take_all = fanout < 0 || neigh.len() <= fanout as usize;
            let picked: Vec<NodeId> = if take_all {
                neigh.to_vec()
            } else {
                rand::seq::index::sample(rng, neigh.len(), fanout as usize)
                    .into_iter()
                    .map(|i| neigh[i])
                    .collect()
            };
            for src in picked {
                let src_local = *local.entry(src).or_insert_with(|| {
                    src_nodes.push(src);
                    src_nodes.len() - 1
                });
                edges.push((src_local, dst_local));
            }
        }
        Ok(Self {
            src_nodes,
            num_dst: dst.len(),
            edges,
        })
    }
}

/// Multi-layer neighbor sampler; fan-outs are listed input layer first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSampler {
    fanouts: Vec<i64>,
}

impl NeighborSampler {
    pub fn new(fanouts: Vec<i64>) -> DistResult<Self> {
        if fanouts.is_empty() {
            return Err(DistGraphError::Fanout(String::new()));
        }
        if let Some(bad) = fanouts.iter().find(|f| **f < -1 || **f == 0) {
            return Err(DistGraphError::Fanout(bad.to_string()));
        }
        Ok(Self { fanouts })
    }

    /// Parse `"10,25"` style fan-out lists.
    pub fn parse(list: &str) -> DistResult<Self> {
        let fanouts = list
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<i64>()
                    .map_err(|_| DistGraphError::Fanout(part.to_string()))
            })
            .collect::<DistResult<Vec<_>>>()?;
        Self::new(fanouts)
    }

    pub fn fanouts(&self) -> &[i64] {
        &self.fanouts
    }

    pub fn num_layers(&self) -> usize {
        self.fanouts.len()
    }

    /// Sample the blocks for `seeds`, outermost (input) layer first.
    ///
    /// Returns the input nodes of the first block and the blocks; the last
    /// block's destination nodes are `seeds`.
    pub fn sample_blocks<R: Rng + ?Sized>(
        &self,
        g: &DistGraph,
        seeds: &[NodeId],
        rng: &mut R,
    ) -> DistResult<(Vec<NodeId>, Vec<Block>)> {
        let mut blocks = Vec::with_capacity(self.fanouts.len());
        let mut frontier = seeds.to_vec();
        for &fanout in self.fanouts.iter().rev() {
            let block = Block::sample(g, &frontier, fanout, rng)?;
            frontier = block.src_nodes.clone();
            blocks.push(block);
        }
        blocks.reverse();
        Ok((frontier, blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fanouts() {
        assert_eq!(NeighborSampler::parse("10, 25").unwrap().fanouts(), &[10, 25]);
        assert_eq!(NeighborSampler::parse("-1").unwrap().fanouts(), &[-1]);
        assert!(NeighborSampler::parse("10,x").is_err());
        assert!(NeighborSampler::parse("0").is_err());
        assert!(NeighborSampler::parse("-2").is_err());
    }

    #[test]
    fn inverse_degrees_skip_isolated_destinations() {
        let block = Block {
            src_nodes: vec![5, 6, 7],
            num_dst: 2,
            edges: vec![(1, 0), (2, 0)],
        };
        assert_eq!(block.dst_nodes(), &[5, 6]);
        assert_eq!(block.in_degrees(), vec![2, 0]);
        assert_eq!(block.inverse_in_degrees(), vec![0.5, 0.0]);
    }
}
