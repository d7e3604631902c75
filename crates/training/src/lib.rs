pub mod dataset;
pub mod ddp;
pub mod metrics;
pub mod util;

pub use dataset::{labels_to_tensor, load_subtensor};
pub use ddp::DistributedDataParallel;
pub use metrics::{compute_acc, count_classes, trailing_epoch_mean, StepStats};
pub use models::{DistSage, DistSageConfig};
pub use util::{run_train, TrainArgs, TrainSummary};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

/// Compute device for `rank`: GPU `rank % num_gpus`, or CPU when `num_gpus` is 0.
#[cfg(feature = "backend-wgpu")]
pub fn train_device(rank: usize, num_gpus: usize) -> burn_wgpu::WgpuDevice {
    if num_gpus == 0 {
        burn_wgpu::WgpuDevice::Cpu
    } else {
        burn_wgpu::WgpuDevice::DiscreteGpu(rank % num_gpus)
    }
}

/// Compute device for `rank`; the NdArray backend only has the CPU.
#[cfg(not(feature = "backend-wgpu"))]
pub fn train_device(_rank: usize, _num_gpus: usize) -> burn_ndarray::NdArrayDevice {
    burn_ndarray::NdArrayDevice::Cpu
}
