//! Burn GraphSAGE models for distributed node classification.
//!
//! - `SageConv`: mean-aggregation GraphSAGE layer over a sampled `Block`.
//! - `DistSage`: a stack of `SageConv` layers with ReLU and dropout between
//!   them, trained on sampled minibatches and evaluated with full-graph
//!   layer-wise inference.

use burn::module::Module;
use burn::nn;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use dist_graph::{
    split_ids, Block, DistGraph, DistNodeDataLoader, DistTensor, LoaderConfig, NeighborSampler,
    NodeId,
};

/// Mean of each destination's in-neighbor rows, accumulated over the block's
/// edge list. `h_src` rows follow `block.src_nodes`; isolated destinations get
/// a zero row.
pub fn mean_aggregate<B: Backend>(block: &Block, h_src: Tensor<B, 2>) -> Tensor<B, 2> {
    let [_, dim] = h_src.dims();
    let device = h_src.device();
    let zeros = Tensor::<B, 2>::zeros([block.num_dst(), dim], &device);
    if block.edges.is_empty() {
        return zeros;
    }
    let num_edges = block.edges.len();
    let (src, dst): (Vec<i64>, Vec<i64>) = block
        .edges
        .iter()
        .map(|&(s, d)| (s as i64, d as i64))
        .unzip();
    let src_idx = Tensor::<B, 1, Int>::from_data(TensorData::new(src, [num_edges]), &device);
    let dst_idx = Tensor::<B, 1, Int>::from_data(TensorData::new(dst, [num_edges]), &device);
    let msgs = h_src.select(0, src_idx);
    let summed = zeros.select_assign(0, dst_idx, msgs);
    let scale = Tensor::<B, 2>::from_data(
        TensorData::new(block.inverse_in_degrees(), [block.num_dst(), 1]),
        &device,
    );
    summed * scale
}

/// Row-major host rows to a `[rows, cols]` tensor.
pub fn rows_to_tensor<B: Backend>(
    values: Vec<f32>,
    rows: usize,
    cols: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    Tensor::<B, 2>::from_data(TensorData::new(values, [rows, cols]), device)
}

#[derive(Debug, Module)]
pub struct SageConv<B: Backend> {
    fc_self: nn::Linear<B>,
    fc_neigh: nn::Linear<B>,
}

impl<B: Backend> SageConv<B> {
    pub fn new(in_feats: usize, out_feats: usize, device: &B::Device) -> Self {
        let fc_self = nn::LinearConfig::new(in_feats, out_feats).init(device);
        let fc_neigh = nn::LinearConfig::new(in_feats, out_feats)
            .with_bias(false)
            .init(device);
        Self { fc_self, fc_neigh }
    }

    /// `fc_self(h_dst) + fc_neigh(h_neigh)`.
    pub fn forward(&self, h_neigh: Tensor<B, 2>, h_dst: Tensor<B, 2>) -> Tensor<B, 2> {
        self.fc_self.forward(h_dst) + self.fc_neigh.forward(h_neigh)
    }

    /// Apply the layer to `h`, whose rows follow `block.src_nodes`.
    pub fn forward_block(&self, block: &Block, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let [_, dim] = h.dims();
        let h_dst = h.clone().slice([0..block.num_dst(), 0..dim]);
        let h_neigh = mean_aggregate(block, h);
        self.forward(h_neigh, h_dst)
    }
}

#[derive(Debug, Clone)]
pub struct DistSageConfig {
    pub in_feats: usize,
    pub n_hidden: usize,
    pub n_classes: usize,
    pub n_layers: usize,
    pub dropout: f64,
}

impl Default for DistSageConfig {
    fn default() -> Self {
        Self {
            in_feats: 1,
            n_hidden: 16,
            n_classes: 2,
            n_layers: 2,
            dropout: 0.5,
        }
    }
}

#[derive(Debug, Module)]
pub struct DistSage<B: Backend> {
    layers: Vec<SageConv<B>>,
    dropout: nn::Dropout,
    n_hidden: usize,
    n_classes: usize,
}

impl<B: Backend> DistSage<B> {
    pub fn new(cfg: DistSageConfig, device: &B::Device) -> Self {
        let n_layers = cfg.n_layers;
        let layers = (0..n_layers)
            .map(|i| {
                let input = if i == 0 { cfg.in_feats } else { cfg.n_hidden };
                let output = if i + 1 == n_layers {
                    cfg.n_classes
                } else {
                    cfg.n_hidden
                };
                SageConv::new(input, output, device)
            })
            .collect();
        Self {
            layers,
            dropout: nn::DropoutConfig::new(cfg.dropout).init(),
            n_hidden: cfg.n_hidden,
            n_classes: cfg.n_classes,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[SageConv<B>] {
        &self.layers
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Whether ReLU and dropout follow layer `index`.
    pub fn activates(&self, index: usize) -> bool {
        index + 1 < self.layers.len()
    }

    fn activate(&self, h: Tensor<B, 2>) -> Tensor<B, 2> {
        self.dropout.forward(relu(h))
    }

    /// Minibatch forward over sampled blocks, outermost block first.
    ///
    /// `x` holds the features of `blocks[0].src_nodes`; the output has one
    /// row per destination node of the last block.
    pub fn forward(&self, blocks: &[Block], x: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut h = x;
        for (i, (layer, block)) in self.layers.iter().zip(blocks).enumerate() {
            h = layer.forward_block(block, h);
            if self.activates(i) {
                h = self.activate(h);
            }
        }
        h
    }

    /// Full-graph inference, one layer at a time over every node.
    ///
    /// Each rank computes its share of the nodes; all ranks must call this
    /// together since every layer ends with a barrier. Run it on a
    /// non-autodiff module (`model.valid()`) so dropout is inactive.
    pub fn inference(
        &self,
        g: &DistGraph,
        x: &DistTensor,
        batch_size: usize,
        device: &B::Device,
    ) -> anyhow::Result<DistTensor> {
        let all: Vec<NodeId> = (0..g.num_nodes()).collect();
        let nodes = split_ids(&all, &g.partition_book(), true);
        let mut x = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let last = !self.activates(i);
            // A fresh tensor per layer keeps inputs intact while rows are written.
            let (name, width) = if last {
                ("h_last".to_string(), self.n_classes)
            } else {
                (format!("h_{i}"), self.n_hidden)
            };
            let y = g.new_tensor(&name, width, true)?;
            tracing::info!(
                rank = g.rank(),
                layer = i,
                "|V|={}, eval batch size: {}",
                g.num_nodes(),
                batch_size
            );

            let sampler = NeighborSampler::new(vec![-1])?;
            let mut loader = DistNodeDataLoader::new(
                g.clone(),
                nodes.clone(),
                sampler,
                LoaderConfig {
                    batch_size,
                    shuffle: false,
                    drop_last: false,
                    seed: None,
                },
            )?;
            while let Some(batch) = loader.next_batch()? {
                let block = &batch.blocks[0];
                let rows = x.gather(&batch.input_nodes)?;
                let h = rows_to_tensor::<B>(rows, batch.input_nodes.len(), x.row_width(), device);
                let mut h = layer.forward_block(block, h);
                if !last {
                    h = self.activate(h);
                }
                let values = h
                    .into_data()
                    .to_vec::<f32>()
                    .map_err(|e| anyhow::anyhow!("failed to read layer {i} output: {e:?}"))?;
                y.scatter(&batch.seeds, &values)?;
            }

            x = y;
            g.barrier()?;
        }
        Ok(x)
    }
}

pub mod prelude {
    pub use super::{mean_aggregate, DistSage, DistSageConfig, SageConv};
}
