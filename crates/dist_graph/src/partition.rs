//! Writing graphs out as range partitions, plus a synthetic graph generator
//! for local runs.

use crate::types::{DistResult, NodeId};
use data_contracts::{
    NodeDataFile, PartFiles, PartGraphFile, PartitionConfig, PartitionSchemaVersion,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// A whole graph held in memory before partitioning.
///
/// `labels` uses NaN for unlabeled nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphData {
    pub num_nodes: usize,
    /// `[src, dst]` pairs.
    pub edges: Vec<[NodeId; 2]>,
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<f32>,
    pub train_mask: Vec<bool>,
    pub val_mask: Vec<bool>,
    pub test_mask: Vec<bool>,
    pub trainer_id: Option<Vec<u32>>,
}

/// Split `graph` into `num_parts` contiguous node ranges and write
/// `<out_dir>/<graph_name>.json` plus `part{p}/` files. Returns the config
/// path.
pub fn partition_graph(
    graph: &GraphData,
    graph_name: &str,
    num_parts: usize,
    out_dir: &Path,
) -> DistResult<PathBuf> {
    let n = graph.num_nodes as u64;
    let parts = num_parts.max(1) as u64;
    let node_map: Vec<[u64; 2]> = (0..parts)
        .map(|p| [p * n / parts, (p + 1) * n / parts])
        .collect();

    let mut files = Vec::with_capacity(node_map.len());
    for (p, [start, end]) in node_map.iter().copied().enumerate() {
        let rows = start as usize..end as usize;
        let node_feats = PathBuf::from(format!("part{p}/node_feat.json"));
        let part_graph = PathBuf::from(format!("part{p}/graph.json"));
        NodeDataFile {
            features: graph.features[rows.clone()].to_vec(),
            labels: graph.labels[rows.clone()]
                .iter()
                .map(|l| (!l.is_nan()).then_some(*l))
                .collect(),
            train_mask: graph.train_mask[rows.clone()].to_vec(),
            val_mask: graph.val_mask[rows.clone()].to_vec(),
            test_mask: graph.test_mask[rows.clone()].to_vec(),
            trainer_id: graph.trainer_id.as_ref().map(|ids| ids[rows.clone()].to_vec()),
        }
        .save(&out_dir.join(&node_feats))?;
        PartGraphFile {
            edges: graph
                .edges
                .iter()
                .filter(|[_, dst]| (start..end).contains(dst))
                .copied()
                .collect(),
        }
        .save(&out_dir.join(&part_graph))?;
        files.push(PartFiles {
            node_feats,
            part_graph,
        });
    }

    let cfg = PartitionConfig {
        schema_version: PartitionSchemaVersion::V1,
        graph_name: graph_name.to_string(),
        num_nodes: n,
        num_edges: graph.edges.len() as u64,
        num_parts: node_map.len(),
        part_method: "range".into(),
        node_map,
        parts: files,
    };
    cfg.validate()?;
    let config_path = out_dir.join(format!("{graph_name}.json"));
    cfg.save(&config_path)?;
    tracing::info!(
        graph = graph_name,
        parts = cfg.num_parts,
        path = %config_path.display(),
        "wrote partitions"
    );
    Ok(config_path)
}

#[derive(Debug, Clone)]
pub struct SyntheticGraphConfig {
    pub num_nodes: usize,
    pub num_classes: usize,
    pub feat_dim: usize,
    /// Expected in-degree per node.
    pub avg_degree: usize,
    /// Probability that a sampled neighbor shares the node's class.
    pub homophily: f32,
    pub train_frac: f32,
    pub val_frac: f32,
    /// Fraction of nodes left without a label.
    pub unlabeled_frac: f32,
    pub seed: u64,
}

impl Default for SyntheticGraphConfig {
    fn default() -> Self {
        Self {
            num_nodes: 1000,
            num_classes: 4,
            feat_dim: 16,
            avg_degree: 8,
            homophily: 0.8,
            train_frac: 0.6,
            val_frac: 0.2,
            unlabeled_frac: 0.0,
            seed: 0,
        }
    }
}

/// Community graph: features carry a noisy class signal and edges mostly
/// stay within a class. Masks are disjoint; unlabeled nodes are in none.
pub fn synthetic_graph(cfg: &SyntheticGraphConfig) -> GraphData {
    let n = cfg.num_nodes;
    let classes = cfg.num_classes.max(1);
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let class_of: Vec<usize> = (0..n).map(|_| rng.random_range(0..classes)).collect();
    let mut members: Vec<Vec<NodeId>> = vec![Vec::new(); classes];
    for (id, &c) in class_of.iter().enumerate() {
        members[c].push(id as NodeId);
    }

    let features = class_of
        .iter()
        .map(|&c| {
            (0..cfg.feat_dim)
                .map(|d| {
                    let signal = if d % classes == c { 1.0 } else { 0.0 };
                    signal + rng.random_range(-0.5..0.5)
                })
                .collect()
        })
        .collect();

    let mut edges = Vec::with_capacity(n * cfg.avg_degree);
    if n > 1 {
        for (dst, &c) in class_of.iter().enumerate() {
            for _ in 0..cfg.avg_degree {
                let same = rng.random::<f32>() < cfg.homophily && members[c].len() > 1;
                let src = if same {
                    members[c][rng.random_range(0..members[c].len())]
                } else {
                    rng.random_range(0..n) as NodeId
                };
                if src != dst as NodeId {
                    edges.push([src, dst as NodeId]);
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);
    let n_unlabeled = (cfg.unlabeled_frac * n as f32) as usize;
    let labeled = n - n_unlabeled.min(n);
    let n_train = (cfg.train_frac * labeled as f32) as usize;
    let n_val = (cfg.val_frac * labeled as f32) as usize;
    let mut labels: Vec<f32> = class_of.iter().map(|&c| c as f32).collect();
    let mut train_mask = vec![false; n];
    let mut val_mask = vec![false; n];
    let mut test_mask = vec![false; n];
    for (rank, &id) in order.iter().enumerate() {
        if rank < n_train {
            train_mask[id] = true;
        } else if rank < n_train + n_val {
            val_mask[id] = true;
        } else if rank < labeled {
            test_mask[id] = true;
        } else {
            labels[id] = f32::NAN;
        }
    }

    GraphData {
        num_nodes: n,
        edges,
        features,
        labels,
        train_mask,
        val_mask,
        test_mask,
        trainer_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_masks_are_disjoint() {
        let graph = synthetic_graph(&SyntheticGraphConfig {
            num_nodes: 50,
            unlabeled_frac: 0.1,
            ..Default::default()
        });
        for i in 0..50 {
            let hits = [graph.train_mask[i], graph.val_mask[i], graph.test_mask[i]]
                .iter()
                .filter(|m| **m)
                .count();
            if graph.labels[i].is_nan() {
                assert_eq!(hits, 0);
            } else {
                assert_eq!(hits, 1);
            }
        }
        assert_eq!(graph.labels.iter().filter(|l| l.is_nan()).count(), 5);
    }

    #[test]
    fn synthetic_graph_is_seeded() {
        let cfg = SyntheticGraphConfig {
            num_nodes: 30,
            ..Default::default()
        };
        let a = synthetic_graph(&cfg);
        let b = synthetic_graph(&cfg);
        assert_eq!(a.edges, b.edges);
        assert_eq!(a.train_mask, b.train_mask);
    }
}
