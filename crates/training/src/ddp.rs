//! Data-parallel gradient synchronisation across trainer ranks.
//!
//! Parameters are visited in module order, so every rank flattens its
//! gradients into the same layout before the all-reduce.

use anyhow::{anyhow, bail};
use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use dist_graph::ProcessGroup;
use std::sync::Arc;

/// Averages gradients over every rank of a process group after each step.
///
/// A rank that runs out of batches calls [`DistributedDataParallel::join`]
/// and keeps answering the remaining all-reduces until all ranks have
/// joined, so uneven batch counts do not deadlock.
#[derive(Debug, Clone)]
pub struct DistributedDataParallel {
    group: Arc<ProcessGroup>,
    rank: usize,
}

impl DistributedDataParallel {
    pub fn new(group: Arc<ProcessGroup>, rank: usize) -> anyhow::Result<Self> {
        if rank >= group.world_size() {
            bail!(
                "rank {rank} out of range for world size {}",
                group.world_size()
            );
        }
        Ok(Self { group, rank })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Replace every parameter with rank 0's value.
    pub fn broadcast_module<B: Backend, M: Module<B>>(&self, module: M) -> anyhow::Result<M> {
        let mut flat = module_values::<B, M>(&module)?;
        self.group.broadcast(self.rank, &mut flat, 0)?;
        let mut writer = ParamWriter {
            flat: &flat,
            offset: 0,
        };
        Ok(module.map(&mut writer))
    }

    /// Sum `grads` over all active ranks and divide by the world size.
    pub fn sync_gradients<B: AutodiffBackend, M: Module<B>>(
        &self,
        module: &M,
        mut grads: GradientsParams,
    ) -> anyhow::Result<GradientsParams> {
        let mut collector = GradCollector {
            grads: &mut grads,
            flat: Vec::new(),
            error: None,
        };
        module.visit(&mut collector);
        let GradCollector {
            mut flat, error, ..
        } = collector;
        if let Some(err) = error {
            bail!("failed to read gradients: {err}");
        }

        self.group.all_reduce_sum(&mut flat, true)?;

        let mut writer = GradWriter {
            grads: &mut grads,
            flat: &flat,
            offset: 0,
            scale: 1.0 / self.group.world_size() as f32,
        };
        module.visit(&mut writer);
        Ok(grads)
    }

    /// Shadow the gradient all-reduces of ranks that still have batches.
    pub fn join(&self) -> anyhow::Result<()> {
        let mut rounds = 0usize;
        while self.group.all_reduce_sum(&mut [], false)? > 0 {
            rounds += 1;
        }
        if rounds > 0 {
            tracing::debug!(rank = self.rank, rounds, "joined rank shadowed all-reduces");
        }
        Ok(())
    }
}

/// All float parameters of `module`, flattened in visit order.
pub fn module_values<B: Backend, M: Module<B>>(module: &M) -> anyhow::Result<Vec<f32>> {
    let mut collector = ParamCollector {
        flat: Vec::new(),
        error: None,
    };
    module.visit(&mut collector);
    match collector.error {
        Some(err) => Err(anyhow!("failed to read parameters: {err}")),
        None => Ok(collector.flat),
    }
}

fn host_values(data: TensorData) -> Result<Vec<f32>, String> {
    data.convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| format!("{e:?}"))
}

struct ParamCollector {
    flat: Vec<f32>,
    error: Option<String>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        match host_values(tensor.to_data()) {
            Ok(values) => self.flat.extend(values),
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
    }
}

struct ParamWriter<'a> {
    flat: &'a [f32],
    offset: usize,
}

impl<B: Backend> ModuleMapper<B> for ParamWriter<'_> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let dims = tensor.dims();
        let len = tensor.shape().num_elements();
        let Some(values) = self.flat.get(self.offset..self.offset + len) else {
            return tensor;
        };
        self.offset += len;
        let device = tensor.device();
        let require_grad = tensor.is_require_grad();
        let value = Tensor::<B, D>::from_data(TensorData::new(values.to_vec(), dims), &device);
        if require_grad {
            value.require_grad()
        } else {
            value
        }
    }
}

struct GradCollector<'a> {
    grads: &'a mut GradientsParams,
    flat: Vec<f32>,
    error: Option<String>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradCollector<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        match self.grads.remove::<B::InnerBackend, D>(id) {
            Some(grad) => match host_values(grad.into_data()) {
                Ok(values) => self.flat.extend(values),
                Err(err) => {
                    self.error.get_or_insert(err);
                }
            },
            // Parameters without a gradient still take their slot so every
            // rank reduces buffers of the same layout.
            None => self
                .flat
                .extend(std::iter::repeat(0.0).take(tensor.shape().num_elements())),
        }
    }
}

struct GradWriter<'a> {
    grads: &'a mut GradientsParams,
    flat: &'a [f32],
    offset: usize,
    scale: f32,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradWriter<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let dims = tensor.dims();
        let len = tensor.shape().num_elements();
        let Some(values) = self.flat.get(self.offset..self.offset + len) else {
            return;
        };
        self.offset += len;
        let averaged: Vec<f32> = values.iter().map(|v| v * self.scale).collect();
        let grad = Tensor::<B::InnerBackend, D>::from_data(
            TensorData::new(averaged, dims),
            &tensor.device(),
        );
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::nn::{Linear, LinearConfig};
    use burn::optim::{Optimizer, SgdConfig};
    use burn_ndarray::NdArray;
    use std::thread;

    type B = Autodiff<NdArray<f32>>;

    fn step(
        ddp: &DistributedDataParallel,
        model: Linear<B>,
        input: Vec<f32>,
    ) -> anyhow::Result<Linear<B>> {
        let device = Default::default();
        let x = Tensor::<B, 2>::from_data(TensorData::new(input, [1, 3]), &device);
        let loss = model.forward(x).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let grads = ddp.sync_gradients::<B, _>(&model, grads)?;
        let mut optim = SgdConfig::new().init();
        Ok(optim.step(0.1, model, grads))
    }

    #[test]
    fn broadcast_then_sync_keeps_ranks_identical() {
        let group = ProcessGroup::new(2, "gloo").unwrap();
        let params: Vec<Vec<f32>> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let group = Arc::clone(&group);
                    s.spawn(move || {
                        let ddp = DistributedDataParallel::new(group, rank).unwrap();
                        // Independent random init per rank.
                        let model = LinearConfig::new(3, 2).init::<B>(&Default::default());
                        let model = ddp.broadcast_module::<B, _>(model).unwrap();
                        let input = vec![rank as f32 + 1.0; 3];
                        let model = step(&ddp, model, input).unwrap();
                        ddp.join().unwrap();
                        module_values::<B, _>(&model).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(params[0], params[1]);
    }

    #[test]
    fn ragged_batch_counts_do_not_deadlock() {
        let group = ProcessGroup::new(3, "gloo").unwrap();
        thread::scope(|s| {
            for (rank, steps) in [(0usize, 4usize), (1, 1), (2, 0)] {
                let group = Arc::clone(&group);
                s.spawn(move || {
                    let ddp = DistributedDataParallel::new(group, rank).unwrap();
                    let model = LinearConfig::new(3, 2).init::<B>(&Default::default());
                    let mut model = ddp.broadcast_module::<B, _>(model).unwrap();
                    for _ in 0..steps {
                        model = step(&ddp, model, vec![1.0, 2.0, 3.0]).unwrap();
                    }
                    ddp.join().unwrap();
                    // Everyone leaves the join together.
                    ddp.group.barrier().unwrap();
                });
            }
        });
    }

    #[test]
    fn single_rank_gradients_are_unchanged() {
        let group = ProcessGroup::new(1, "gloo").unwrap();
        let ddp = DistributedDataParallel::new(group, 0).unwrap();
        let device = Default::default();
        let model = LinearConfig::new(3, 1).with_bias(false).init::<B>(&device);
        let x = Tensor::<B, 2>::from_data(TensorData::new(vec![1.0, 2.0, 3.0], [1, 3]), &device);
        let loss = model.forward(x).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let grads = ddp.sync_gradients::<B, _>(&model, grads).unwrap();
        let weight = grads
            .get::<NdArray<f32>, 2>(model.weight.id)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(weight, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn rank_outside_world_is_rejected() {
        let group = ProcessGroup::new(2, "gloo").unwrap();
        assert!(DistributedDataParallel::new(group, 2).is_err());
    }
}
