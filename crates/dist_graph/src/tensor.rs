use crate::types::{DistGraphError, DistResult, NodeId};
use std::sync::{Arc, RwLock};

/// Row-major `[rows, cols]` f32 storage shared by every rank.
///
/// Clones are handles onto the same storage. Rows are indexed by global
/// node id.
#[derive(Debug, Clone)]
pub struct DistTensor {
    name: String,
    shape: [usize; 2],
    data: Arc<RwLock<Vec<f32>>>,
}

impl DistTensor {
    pub(crate) fn zeros(name: &str, shape: [usize; 2]) -> Self {
        Self::from_vec(name, shape, vec![0.0; shape[0] * shape[1]])
    }

    pub(crate) fn from_vec(name: &str, shape: [usize; 2], values: Vec<f32>) -> Self {
        debug_assert_eq!(values.len(), shape[0] * shape[1]);
        Self {
            name: name.to_string(),
            shape,
            data: Arc::new(RwLock::new(values)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    pub fn num_rows(&self) -> usize {
        self.shape[0]
    }

    pub fn row_width(&self) -> usize {
        self.shape[1]
    }

    /// Whether two handles share storage.
    pub fn same_storage(&self, other: &DistTensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn row_index(&self, id: NodeId) -> DistResult<usize> {
        let idx = id as usize;
        if idx >= self.shape[0] {
            return Err(DistGraphError::NodeOutOfRange {
                id,
                num_nodes: self.shape[0] as u64,
            });
        }
        Ok(idx)
    }

    /// Fetch the rows for `ids`, flattened row-major.
    pub fn gather(&self, ids: &[NodeId]) -> DistResult<Vec<f32>> {
        let width = self.shape[1];
        let data = self
            .data
            .read()
            .map_err(|_| DistGraphError::Poisoned("dist tensor"))?;
        let mut out = Vec::with_capacity(ids.len() * width);
        for &id in ids {
            let row = self.row_index(id)?;
            out.extend_from_slice(&data[row * width..(row + 1) * width]);
        }
        Ok(out)
    }

    /// Single-column convenience for labels and masks.
    pub fn gather_column(&self, ids: &[NodeId]) -> DistResult<Vec<f32>> {
        if self.shape[1] == 1 {
            return self.gather(ids);
        }
        let rows = self.gather(ids)?;
        Ok(rows.chunks(self.shape[1]).map(|r| r[0]).collect())
    }

    /// Overwrite the rows for `ids` with `values` (row-major).
    pub fn scatter(&self, ids: &[NodeId], values: &[f32]) -> DistResult<()> {
        let width = self.shape[1];
        if values.len() != ids.len() * width {
            return Err(DistGraphError::RowData {
                name: self.name.clone(),
                expected: ids.len() * width,
                found: values.len(),
            });
        }
        let mut data = self
            .data
            .write()
            .map_err(|_| DistGraphError::Poisoned("dist tensor"))?;
        for (&id, row) in ids.iter().zip(values.chunks(width.max(1))) {
            let idx = self.row_index(id)?;
            data[idx * width..(idx + 1) * width].copy_from_slice(row);
        }
        Ok(())
    }

    /// Copy of the full storage.
    pub fn to_vec(&self) -> DistResult<Vec<f32>> {
        Ok(self
            .data
            .read()
            .map_err(|_| DistGraphError::Poisoned("dist tensor"))?
            .clone())
    }
}
