use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("num_parts must be positive")]
    NoParts,
    #[error("node_map has {found} ranges but num_parts is {expected}")]
    NodeMapLen { expected: usize, found: usize },
    #[error("parts has {found} entries but num_parts is {expected}")]
    PartsLen { expected: usize, found: usize },
    #[error("node_map range {index} ({start}..{end}) is not contiguous with the previous range")]
    NodeMapGap { index: usize, start: u64, end: u64 },
    #[error("node_map ends at {end} but num_nodes is {num_nodes}")]
    NodeMapEnd { end: u64, num_nodes: u64 },
    #[error("node data column {column} has {found} rows, expected {expected}")]
    RowCount {
        column: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("feature rows have inconsistent width: row {row} has {found}, expected {expected}")]
    FeatureWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("edge {src}->{dst} references a node outside 0..{num_nodes}")]
    EdgeOutOfRange { src: u64, dst: u64, num_nodes: u64 },
    #[error("invalid ip config line {line}: {msg}")]
    IpConfig { line: usize, msg: String },
    #[error("unknown net type {0:?}; expected 'socket' or 'tensorpipe'")]
    NetType(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PartitionSchemaVersion {
    #[default]
    V1,
}

/// Files belonging to one partition, relative to the partition config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartFiles {
    pub node_feats: PathBuf,
    pub part_graph: PathBuf,
}

/// Top-level partition config (`--part_config`).
///
/// Node ids are relabelled so that partition `p` owns the half-open range
/// `node_map[p]`, and the ranges tile `0..num_nodes` in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionConfig {
    #[serde(default)]
    pub schema_version: PartitionSchemaVersion,
    pub graph_name: String,
    pub num_nodes: u64,
    pub num_edges: u64,
    pub num_parts: usize,
    #[serde(default = "default_part_method")]
    pub part_method: String,
    pub node_map: Vec<[u64; 2]>,
    pub parts: Vec<PartFiles>,
}

fn default_part_method() -> String {
    "range".to_string()
}

impl PartitionConfig {
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        let cfg: Self = read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<(), ContractError> {
        write_json(path, self)
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        if self.num_parts == 0 {
            return Err(ContractError::NoParts);
        }
        if self.node_map.len() != self.num_parts {
            return Err(ContractError::NodeMapLen {
                expected: self.num_parts,
                found: self.node_map.len(),
            });
        }
        if self.parts.len() != self.num_parts {
            return Err(ContractError::PartsLen {
                expected: self.num_parts,
                found: self.parts.len(),
            });
        }
        let mut cursor = 0u64;
        for (index, [start, end]) in self.node_map.iter().copied().enumerate() {
            if start != cursor || end < start {
                return Err(ContractError::NodeMapGap { index, start, end });
            }
            cursor = end;
        }
        if cursor != self.num_nodes {
            return Err(ContractError::NodeMapEnd {
                end: cursor,
                num_nodes: self.num_nodes,
            });
        }
        Ok(())
    }

    /// Resolve a part-relative path against the directory holding the config.
    pub fn resolve(&self, config_path: &Path, rel: &Path) -> PathBuf {
        if rel.is_absolute() {
            return rel.to_path_buf();
        }
        config_path
            .parent()
            .map(|dir| dir.join(rel))
            .unwrap_or_else(|| rel.to_path_buf())
    }

    pub fn part_len(&self, part: usize) -> usize {
        self.node_map
            .get(part)
            .map(|[start, end]| (end - start) as usize)
            .unwrap_or(0)
    }
}

/// Node data owned by one partition, rows in global id order within the
/// partition's range.
///
/// Missing labels are stored as `null` and surface as NaN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDataFile {
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<Option<f32>>,
    pub train_mask: Vec<bool>,
    pub val_mask: Vec<bool>,
    pub test_mask: Vec<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trainer_id: Option<Vec<u32>>,
}

impl NodeDataFile {
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ContractError> {
        write_json(path, self)
    }

    /// Feature width, or zero for an empty partition.
    pub fn feature_dim(&self) -> usize {
        self.features.first().map(Vec::len).unwrap_or(0)
    }

    pub fn validate(&self, expected_rows: usize) -> Result<(), ContractError> {
        let columns: [(&'static str, usize); 5] = [
            ("features", self.features.len()),
            ("labels", self.labels.len()),
            ("train_mask", self.train_mask.len()),
            ("val_mask", self.val_mask.len()),
            ("test_mask", self.test_mask.len()),
        ];
        for (column, found) in columns {
            if found != expected_rows {
                return Err(ContractError::RowCount {
                    column,
                    expected: expected_rows,
                    found,
                });
            }
        }
        if let Some(ids) = &self.trainer_id {
            if ids.len() != expected_rows {
                return Err(ContractError::RowCount {
                    column: "trainer_id",
                    expected: expected_rows,
                    found: ids.len(),
                });
            }
        }
        let width = self.feature_dim();
        for (row, feats) in self.features.iter().enumerate() {
            if feats.len() != width {
                return Err(ContractError::FeatureWidth {
                    row,
                    expected: width,
                    found: feats.len(),
                });
            }
        }
        Ok(())
    }

    /// Labels with the NaN sentinel for unlabeled nodes.
    pub fn labels_f32(&self) -> Vec<f32> {
        self.labels
            .iter()
            .map(|l| l.unwrap_or(f32::NAN))
            .collect()
    }
}

/// In-edges of the nodes a partition owns, as global `[src, dst]` pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartGraphFile {
    pub edges: Vec<[u64; 2]>,
}

impl PartGraphFile {
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ContractError> {
        write_json(path, self)
    }

    pub fn validate(&self, num_nodes: u64) -> Result<(), ContractError> {
        for [src, dst] in self.edges.iter().copied() {
            if src >= num_nodes || dst >= num_nodes {
                return Err(ContractError::EdgeOutOfRange {
                    src,
                    dst,
                    num_nodes,
                });
            }
        }
        Ok(())
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ContractError> {
    let bytes = fs::read(path).map_err(|source| ContractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ContractError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ContractError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ContractError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| ContractError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, bytes).map_err(|source| ContractError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_part_config() -> PartitionConfig {
        PartitionConfig {
            schema_version: PartitionSchemaVersion::V1,
            graph_name: "toy".into(),
            num_nodes: 10,
            num_edges: 0,
            num_parts: 2,
            part_method: "range".into(),
            node_map: vec![[0, 4], [4, 10]],
            parts: vec![
                PartFiles {
                    node_feats: "part0/node_feat.json".into(),
                    part_graph: "part0/graph.json".into(),
                },
                PartFiles {
                    node_feats: "part1/node_feat.json".into(),
                    part_graph: "part1/graph.json".into(),
                },
            ],
        }
    }

    #[test]
    fn contiguous_node_map_passes() {
        let cfg = two_part_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.part_len(1), 6);
    }

    #[test]
    fn gap_in_node_map_rejected() {
        let mut cfg = two_part_config();
        cfg.node_map[1] = [5, 10];
        assert!(matches!(
            cfg.validate(),
            Err(ContractError::NodeMapGap { index: 1, .. })
        ));
    }

    #[test]
    fn short_node_map_rejected() {
        let mut cfg = two_part_config();
        cfg.num_nodes = 12;
        assert!(matches!(
            cfg.validate(),
            Err(ContractError::NodeMapEnd { end: 10, .. })
        ));
    }

    #[test]
    fn missing_labels_become_nan() {
        let data = NodeDataFile {
            features: vec![vec![0.0; 2]; 2],
            labels: vec![Some(1.0), None],
            train_mask: vec![true, false],
            val_mask: vec![false, false],
            test_mask: vec![false, true],
            trainer_id: None,
        };
        let labels = data.labels_f32();
        assert_eq!(labels[0], 1.0);
        assert!(labels[1].is_nan());
    }
}
