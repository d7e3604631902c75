use crate::runtime::{DistRuntime, ProcessGroup};
use crate::tensor::DistTensor;
use crate::types::{DistGraphError, DistResult, NodeId};
use data_contracts::{ContractError, NodeDataFile, PartGraphFile, PartitionConfig};
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Maps node ids to the partition that owns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBook {
    node_map: Vec<Range<NodeId>>,
    partid: usize,
}

impl PartitionBook {
    pub fn new(node_map: Vec<Range<NodeId>>, partid: usize) -> Self {
        Self { node_map, partid }
    }

    /// Partition of the rank holding this book.
    pub fn partid(&self) -> usize {
        self.partid
    }

    pub fn num_partitions(&self) -> usize {
        self.node_map.len()
    }

    pub fn num_nodes(&self) -> u64 {
        self.node_map.last().map(|r| r.end).unwrap_or(0)
    }

    pub fn nid2partid(&self, id: NodeId) -> Option<usize> {
        // Ranges are sorted and contiguous.
        let idx = self.node_map.partition_point(|r| r.end <= id);
        self.node_map
            .get(idx)
            .filter(|r| r.contains(&id))
            .map(|_| idx)
    }

    pub fn partid2nids(&self, part: usize) -> Range<NodeId> {
        self.node_map.get(part).cloned().unwrap_or(0..0)
    }

    pub fn is_local(&self, id: NodeId) -> bool {
        self.partid2nids(self.partid).contains(&id)
    }
}

/// Every partition of one graph, loaded once and shared by all ranks.
#[derive(Debug)]
pub struct GraphServer {
    graph_name: String,
    num_nodes: u64,
    num_edges: u64,
    node_map: Vec<Range<NodeId>>,
    // CSR over in-edges: in_indices[in_offsets[v]..in_offsets[v + 1]] are v's sources.
    in_offsets: Vec<usize>,
    in_indices: Vec<NodeId>,
    ndata: HashMap<String, DistTensor>,
    named: Mutex<HashMap<String, DistTensor>>,
}

impl GraphServer {
    /// Load every partition listed in `part_config`.
    pub fn load(
        _runtime: &DistRuntime,
        graph_name: &str,
        part_config: &Path,
    ) -> DistResult<Arc<Self>> {
        let cfg = PartitionConfig::load(part_config)?;
        if cfg.graph_name != graph_name {
            return Err(DistGraphError::GraphName {
                expected: graph_name.to_string(),
                found: cfg.graph_name,
            });
        }
        let num_nodes = cfg.num_nodes as usize;

        let mut parts = Vec::with_capacity(cfg.num_parts);
        let mut edges = Vec::new();
        for (idx, files) in cfg.parts.iter().enumerate() {
            let data = NodeDataFile::load(&cfg.resolve(part_config, &files.node_feats))?;
            data.validate(cfg.part_len(idx))?;
            let graph = PartGraphFile::load(&cfg.resolve(part_config, &files.part_graph))?;
            graph.validate(cfg.num_nodes)?;
            edges.extend(graph.edges);
            parts.push(data);
        }

        let feat_dim = parts
            .iter()
            .find(|p| !p.features.is_empty())
            .map(NodeDataFile::feature_dim)
            .unwrap_or(0);
        let mut first_row = 0;
        for part in &parts {
            let width = part.feature_dim();
            if !part.features.is_empty() && width != feat_dim {
                return Err(ContractError::FeatureWidth {
                    row: first_row,
                    expected: feat_dim,
                    found: width,
                }
                .into());
            }
            first_row += part.features.len();
        }
        let mut features = Vec::with_capacity(num_nodes * feat_dim);
        let mut labels = Vec::with_capacity(num_nodes);
        let mut train = Vec::with_capacity(num_nodes);
        let mut val = Vec::with_capacity(num_nodes);
        let mut test = Vec::with_capacity(num_nodes);
        let has_trainer_ids = parts.iter().any(|p| p.trainer_id.is_some());
        let mut trainer_ids = Vec::new();
        for part in &parts {
            features.extend(part.features.iter().flatten().copied());
            labels.extend(part.labels_f32());
            train.extend(part.train_mask.iter().map(|&m| f32::from(u8::from(m))));
            val.extend(part.val_mask.iter().map(|&m| f32::from(u8::from(m))));
            test.extend(part.test_mask.iter().map(|&m| f32::from(u8::from(m))));
            if has_trainer_ids {
                match &part.trainer_id {
                    Some(ids) => trainer_ids.extend(ids.iter().map(|&t| t as f32)),
                    None => trainer_ids.extend(std::iter::repeat(-1.0).take(part.labels.len())),
                }
            }
        }

        let mut ndata = HashMap::new();
        ndata.insert(
            "features".to_string(),
            DistTensor::from_vec("features", [num_nodes, feat_dim], features),
        );
        for (name, column) in [
            ("labels", labels),
            ("train_mask", train),
            ("val_mask", val),
            ("test_mask", test),
        ] {
            ndata.insert(
                name.to_string(),
                DistTensor::from_vec(name, [num_nodes, 1], column),
            );
        }
        if has_trainer_ids {
            ndata.insert(
                "trainer_id".to_string(),
                DistTensor::from_vec("trainer_id", [num_nodes, 1], trainer_ids),
            );
        }

        let (in_offsets, in_indices) = build_in_csr(num_nodes, &edges);
        tracing::info!(
            graph = %cfg.graph_name,
            nodes = cfg.num_nodes,
            edges = edges.len(),
            parts = cfg.num_parts,
            "loaded partitioned graph"
        );
        Ok(Arc::new(Self {
            graph_name: cfg.graph_name,
            num_nodes: cfg.num_nodes,
            num_edges: edges.len() as u64,
            node_map: cfg.node_map.iter().map(|[s, e]| *s..*e).collect(),
            in_offsets,
            in_indices,
            ndata,
            named: Mutex::new(HashMap::new()),
        }))
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    pub fn num_parts(&self) -> usize {
        self.node_map.len()
    }

    /// Per-rank handle; rank `r` trains on partition `r`.
    pub fn connect(
        self: &Arc<Self>,
        rank: usize,
        group: Arc<ProcessGroup>,
    ) -> DistResult<DistGraph> {
        if group.world_size() != self.num_parts() {
            return Err(DistGraphError::WorldSize {
                world_size: group.world_size(),
                num_parts: self.num_parts(),
            });
        }
        if rank >= self.num_parts() {
            return Err(DistGraphError::Rank {
                rank,
                world_size: self.num_parts(),
            });
        }
        Ok(DistGraph {
            server: Arc::clone(self),
            group,
            rank,
        })
    }
}

fn build_in_csr(num_nodes: usize, edges: &[[NodeId; 2]]) -> (Vec<usize>, Vec<NodeId>) {
    let mut offsets = vec![0usize; num_nodes + 1];
    for [_, dst] in edges {
        offsets[*dst as usize + 1] += 1;
    }
    for i in 0..num_nodes {
        offsets[i + 1] += offsets[i];
    }
    let mut fill = offsets.clone();
    let mut indices = vec![0; edges.len()];
    for [src, dst] in edges {
        let slot = &mut fill[*dst as usize];
        indices[*slot] = *src;
        *slot += 1;
    }
    (offsets, indices)
}

/// One rank's view of the distributed graph.
#[derive(Debug, Clone)]
pub struct DistGraph {
    server: Arc<GraphServer>,
    group: Arc<ProcessGroup>,
    rank: usize,
}

impl DistGraph {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn graph_name(&self) -> &str {
        self.server.graph_name()
    }

    pub fn num_nodes(&self) -> u64 {
        self.server.num_nodes
    }

    pub fn num_edges(&self) -> u64 {
        self.server.num_edges
    }

    pub fn process_group(&self) -> &Arc<ProcessGroup> {
        &self.group
    }

    pub fn partition_book(&self) -> PartitionBook {
        PartitionBook::new(self.server.node_map.clone(), self.rank)
    }

    pub fn has_ndata(&self, name: &str) -> bool {
        self.server.ndata.contains_key(name)
    }

    pub fn ndata(&self, name: &str) -> DistResult<DistTensor> {
        self.server
            .ndata
            .get(name)
            .cloned()
            .ok_or_else(|| DistGraphError::MissingNodeData(name.to_string()))
    }

    /// Sources of `node`'s in-edges.
    pub fn in_neighbors(&self, node: NodeId) -> DistResult<&[NodeId]> {
        let idx = node as usize;
        if node >= self.server.num_nodes {
            return Err(DistGraphError::NodeOutOfRange {
                id: node,
                num_nodes: self.server.num_nodes,
            });
        }
        let offsets = &self.server.in_offsets;
        Ok(&self.server.in_indices[offsets[idx]..offsets[idx + 1]])
    }

    /// Named tensor with one row per node.
    ///
    /// With `persistent`, every rank asking for the same name gets the same
    /// storage; otherwise a private tensor is returned.
    pub fn new_tensor(
        &self,
        name: &str,
        row_width: usize,
        persistent: bool,
    ) -> DistResult<DistTensor> {
        let shape = [self.server.num_nodes as usize, row_width];
        if !persistent {
            return Ok(DistTensor::zeros(name, shape));
        }
        let mut named = self
            .server
            .named
            .lock()
            .map_err(|_| DistGraphError::Poisoned("named tensors"))?;
        if let Some(existing) = named.get(name) {
            if existing.shape() != shape {
                return Err(DistGraphError::TensorShape {
                    name: name.to_string(),
                    existing: existing.shape(),
                    requested: shape,
                });
            }
            return Ok(existing.clone());
        }
        let tensor = DistTensor::zeros(name, shape);
        named.insert(name.to_string(), tensor.clone());
        Ok(tensor)
    }

    pub fn barrier(&self) -> DistResult<()> {
        self.group.barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_book_lookup() {
        let pb = PartitionBook::new(vec![0..3, 3..3, 3..8], 2);
        assert_eq!(pb.nid2partid(0), Some(0));
        assert_eq!(pb.nid2partid(3), Some(2));
        assert_eq!(pb.nid2partid(7), Some(2));
        assert_eq!(pb.nid2partid(8), None);
        assert_eq!(pb.partid2nids(1), 3..3);
        assert!(pb.is_local(5));
        assert!(!pb.is_local(1));
        assert_eq!(pb.num_nodes(), 8);
    }

    #[test]
    fn csr_groups_sources_by_destination() {
        let (offsets, indices) = build_in_csr(3, &[[0, 2], [1, 2], [2, 0]]);
        assert_eq!(offsets, vec![0, 1, 1, 3]);
        assert_eq!(&indices[offsets[2]..offsets[3]], &[0, 1]);
        assert_eq!(&indices[offsets[0]..offsets[1]], &[2]);
    }
}
