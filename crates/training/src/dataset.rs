//! Moving node features and labels out of the distributed tensors onto the
//! compute device.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use dist_graph::{DistGraph, NodeId};
use models::rows_to_tensor;

/// Integer class indices from float labels; NaN (unlabeled) becomes 0.
pub fn labels_to_tensor<B: Backend>(labels: &[f32], device: &B::Device) -> Tensor<B, 1, Int> {
    let classes: Vec<i64> = labels.iter().map(|l| *l as i64).collect();
    Tensor::<B, 1, Int>::from_data(TensorData::new(classes, [labels.len()]), device)
}

/// Features of `input_nodes` and labels of `seeds`.
///
/// Features are skipped (`None`) when `load_feat` is false.
pub fn load_subtensor<B: Backend>(
    g: &DistGraph,
    seeds: &[NodeId],
    input_nodes: &[NodeId],
    device: &B::Device,
    load_feat: bool,
) -> anyhow::Result<(Option<Tensor<B, 2>>, Tensor<B, 1, Int>)> {
    let batch_inputs = if load_feat {
        let features = g.ndata("features")?;
        let rows = features.gather(input_nodes)?;
        Some(rows_to_tensor::<B>(
            rows,
            input_nodes.len(),
            features.row_width(),
            device,
        ))
    } else {
        None
    };
    let labels = g.ndata("labels")?.gather_column(seeds)?;
    Ok((batch_inputs, labels_to_tensor::<B>(&labels, device)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    #[test]
    fn nan_labels_cast_to_class_zero() {
        let device = Default::default();
        let labels = labels_to_tensor::<NdArray<f32>>(&[2.0, f32::NAN, 1.0], &device);
        let values = labels.into_data().to_vec::<i64>().unwrap();
        assert_eq!(values, vec![2, 0, 1]);
    }
}
