use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use clap::Parser;
use data_contracts::NetType;
use dist_graph::{
    initialize, node_split, DistGraph, DistGraphError, DistNodeDataLoader, DistTensor,
    GraphServer, LoaderConfig, NeighborSampler, NodeId, ProcessGroup,
};
use models::{rows_to_tensor, DistSage, DistSageConfig};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use crate::dataset::{labels_to_tensor, load_subtensor};
use crate::ddp::DistributedDataParallel;
use crate::metrics::{compute_acc, count_classes, trailing_epoch_mean, StepStats};
use crate::{train_device, TrainBackend};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "train",
    about = "Distributed GraphSAGE node classification over a partitioned graph"
)]
pub struct TrainArgs {
    /// Graph name; must match the partition config.
    #[arg(long = "graph_name")]
    pub graph_name: String,
    /// IP config file, one `ip [port]` per line.
    #[arg(long = "ip_config")]
    pub ip_config: PathBuf,
    /// Partition config JSON.
    #[arg(long = "part_config")]
    pub part_config: PathBuf,
    /// Number of classes; 0 detects it from the labels.
    #[arg(long = "n_classes", default_value_t = 0)]
    pub n_classes: usize,
    /// Process group backend (gloo, nccl or mpi).
    #[arg(long, default_value = "gloo")]
    pub backend: String,
    /// GPUs per machine; 0 trains on the CPU.
    #[arg(long = "num_gpus", default_value_t = 0)]
    pub num_gpus: usize,
    #[arg(long = "num_epochs", default_value_t = 20)]
    pub num_epochs: usize,
    #[arg(long = "num_hidden", default_value_t = 16)]
    pub num_hidden: usize,
    #[arg(long = "num_layers", default_value_t = 2)]
    pub num_layers: usize,
    /// Neighbors sampled per layer, outermost first; -1 takes all.
    #[arg(long = "fan_out", default_value = "10,25")]
    pub fan_out: String,
    #[arg(long = "batch_size", default_value_t = 1000)]
    pub batch_size: usize,
    #[arg(long = "batch_size_eval", default_value_t = 100000)]
    pub batch_size_eval: usize,
    #[arg(long = "log_every", default_value_t = 20)]
    pub log_every: usize,
    #[arg(long = "eval_every", default_value_t = 5)]
    pub eval_every: usize,
    #[arg(long, default_value_t = 0.003)]
    pub lr: f64,
    #[arg(long, default_value_t = 0.5)]
    pub dropout: f64,
    /// Accepted for launcher compatibility; ranks follow partition ids.
    #[arg(long = "local_rank")]
    pub local_rank: Option<usize>,
    /// Pad train ids so every rank runs the same number of batches.
    #[arg(long = "pad-data", default_value_t = false)]
    pub pad_data: bool,
    #[arg(long = "net_type", default_value = "socket", value_parser = ["socket", "tensorpipe"])]
    pub net_type: String,
    /// Seed for shuffling and neighbor sampling.
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Per-rank result of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub rank: usize,
    pub graph_name: String,
    pub epoch_time: f64,
    pub test_acc: f32,
}

/// Rank and device for one trainer.
#[derive(Debug, Clone)]
pub struct TrainContext<B: Backend> {
    pub rank: usize,
    pub device: B::Device,
}

/// Node ids and model shape for one trainer.
#[derive(Debug, Clone)]
pub struct TrainData {
    pub train_nid: Vec<NodeId>,
    pub val_nid: Vec<NodeId>,
    pub test_nid: Vec<NodeId>,
    pub in_feats: usize,
    pub n_classes: usize,
}

type ADBackend = Autodiff<TrainBackend>;

pub fn run_train(args: TrainArgs) -> anyhow::Result<Vec<TrainSummary>> {
    validate_backend_choice(args.num_gpus)?;
    let net_type: NetType = args.net_type.parse()?;

    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    info!(%host, "Initializing distributed runtime");
    let runtime = initialize(&args.ip_config, net_type)?;
    info!("Initializing DistGraph");
    let server = GraphServer::load(&runtime, &args.graph_name, &args.part_config)?;
    info!(backend = %args.backend, world_size = server.num_parts(), "Initializing process group");
    let group = ProcessGroup::new(server.num_parts(), &args.backend)?;

    let results: Vec<anyhow::Result<TrainSummary>> = thread::scope(|s| {
        let handles: Vec<_> = (0..server.num_parts())
            .map(|rank| {
                let args = &args;
                let server = &server;
                let group = Arc::clone(&group);
                s.spawn(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        let g = server.connect(rank, Arc::clone(&group))?;
                        let device = train_device(rank, args.num_gpus);
                        train_partition::<ADBackend>(args, g, device)
                    }))
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("trainer {rank} panicked")));
                    if let Err(err) = &result {
                        tracing::error!(rank, "trainer failed: {err:#}");
                        group.abort();
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("trainer thread panicked")))
            })
            .collect()
    });

    let mut summaries = Vec::with_capacity(results.len());
    let mut first_err = None;
    for result in results {
        match result {
            Ok(summary) => summaries.push(summary),
            // Report the failure that aborted the group, not its echoes.
            Err(err) if is_abort(&err) => {
                first_err.get_or_insert(err);
            }
            Err(err) => return Err(err),
        }
    }
    if let Some(err) = first_err {
        return Err(err);
    }
    for summary in &summaries {
        println!(
            "Summary of node classification(GraphSAGE): GraphName {} | TrainEpochTime(mean) {:.4} | TestAccuracy {:.4}",
            summary.graph_name, summary.epoch_time, summary.test_acc
        );
    }
    Ok(summaries)
}

fn is_abort(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<DistGraphError>(),
        Some(DistGraphError::Aborted)
    )
}

/// Split node ids, size the model and train one rank.
pub fn train_partition<B: AutodiffBackend>(
    args: &TrainArgs,
    g: DistGraph,
    device: B::Device,
) -> anyhow::Result<TrainSummary> {
    let rank = g.rank();
    let pb = g.partition_book();
    let trainer_ids = if g.has_ndata("trainer_id") {
        Some(g.ndata("trainer_id")?)
    } else {
        None
    };
    let split = |mask: &str| -> anyhow::Result<Vec<NodeId>> {
        Ok(node_split(&g.ndata(mask)?, &pb, true, trainer_ids.as_ref())?)
    };
    let mut train_nid = split("train_mask")?;
    let val_nid = split("val_mask")?;
    let test_nid = split("test_mask")?;
    let local = |ids: &[NodeId]| ids.iter().filter(|id| pb.is_local(**id)).count();
    info!(
        "part {}, train: {} (local: {}), val: {} (local: {}), test: {} (local: {})",
        rank,
        train_nid.len(),
        local(&train_nid),
        val_nid.len(),
        local(&val_nid),
        test_nid.len(),
        local(&test_nid),
    );

    if args.pad_data {
        train_nid = pad_node_ids(train_nid, g.process_group(), rank)?;
        info!(rank, train = train_nid.len(), "padded train ids");
    }

    let n_classes = if args.n_classes == 0 {
        let labels = g.ndata("labels")?.to_vec()?;
        let detected = count_classes(&labels);
        info!("Number of classes: {detected}");
        detected
    } else {
        args.n_classes
    };
    let in_feats = g.ndata("features")?.row_width();

    let data = TrainData {
        train_nid,
        val_nid,
        test_nid,
        in_feats,
        n_classes,
    };
    let ctx = TrainContext::<B> { rank, device };
    let (epoch_time, test_acc) = run(&ctx, args, &g, &data)?;
    Ok(TrainSummary {
        rank,
        graph_name: g.graph_name().to_string(),
        epoch_time,
        test_acc,
    })
}

/// Cycle `ids` until it is as long as the longest id list of any rank.
///
/// Every rank must call this; an empty list stays empty.
pub fn pad_node_ids(
    ids: Vec<NodeId>,
    group: &ProcessGroup,
    rank: usize,
) -> anyhow::Result<Vec<NodeId>> {
    let lens = group.all_gather_usize(rank, ids.len())?;
    let target = lens.into_iter().max().unwrap_or(0);
    if ids.is_empty() || ids.len() >= target {
        return Ok(ids);
    }
    Ok(ids.iter().copied().cycle().take(target).collect())
}

/// Train `model` on this rank's ids; returns the trailing mean epoch time
/// and the last test accuracy.
pub fn run<B: AutodiffBackend>(
    ctx: &TrainContext<B>,
    args: &TrainArgs,
    g: &DistGraph,
    data: &TrainData,
) -> anyhow::Result<(f64, f32)> {
    let device = &ctx.device;
    let sampler = NeighborSampler::parse(&args.fan_out)?;
    if args.num_layers == 0 {
        anyhow::bail!("--num_layers must be at least 1");
    }
    if sampler.num_layers() != args.num_layers {
        anyhow::bail!(
            "--fan_out lists {} layers but --num_layers is {}",
            sampler.num_layers(),
            args.num_layers
        );
    }
    let mut dataloader = DistNodeDataLoader::new(
        g.clone(),
        data.train_nid.clone(),
        sampler,
        LoaderConfig {
            batch_size: args.batch_size,
            shuffle: true,
            drop_last: false,
            seed: args.seed,
        },
    )?;

    let model = DistSage::<B>::new(
        DistSageConfig {
            in_feats: data.in_feats,
            n_hidden: args.num_hidden,
            n_classes: data.n_classes,
            n_layers: args.num_layers,
            dropout: args.dropout,
        },
        device,
    );
    let ddp = DistributedDataParallel::new(Arc::clone(g.process_group()), ctx.rank)?;
    let mut model = ddp.broadcast_module::<B, _>(model)?;
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut optim = AdamConfig::new().init();

    let features = g.ndata("features")?;
    let labels = g.ndata("labels")?;
    let log_every = args.log_every.max(1);
    let eval_every = args.eval_every.max(1);
    let mut stats = StepStats::new();
    let mut epoch_times = Vec::with_capacity(args.num_epochs);
    let mut test_acc = 0.0;

    for epoch in 1..=args.num_epochs {
        let tic = Instant::now();
        let mut sample_time = Duration::ZERO;
        let mut forward_time = Duration::ZERO;
        let mut backward_time = Duration::ZERO;
        let mut update_time = Duration::ZERO;
        let mut num_seeds = 0usize;
        let mut num_inputs = 0usize;
        stats.start_epoch();
        dataloader.reset();

        let mut start = Instant::now();
        let mut step = 0usize;
        while let Some(batch) = dataloader.next_batch()? {
            let tic_step = Instant::now();
            sample_time += tic_step - start;

            let (batch_inputs, batch_labels) =
                load_subtensor::<B>(g, &batch.seeds, &batch.input_nodes, device, true)?;
            let batch_inputs = batch_inputs
                .ok_or_else(|| anyhow::anyhow!("minibatch features were not loaded"))?;
            num_seeds += batch.blocks.last().map(|b| b.num_dst()).unwrap_or(0);
            num_inputs += batch.blocks.first().map(|b| b.num_src()).unwrap_or(0);

            start = Instant::now();
            let batch_pred = model.forward(&batch.blocks, batch_inputs);
            let loss = loss_fn.forward(batch_pred.clone(), batch_labels.clone());
            let loss_detached = loss.clone().detach();
            let forward_end = Instant::now();
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            let grads = ddp.sync_gradients::<B, _>(&model, grads)?;
            let compute_end = Instant::now();
            forward_time += forward_end - start;
            backward_time += compute_end - forward_end;

            model = optim.step(args.lr, model, grads);
            update_time += compute_end.elapsed();

            stats.record(batch.seeds.len(), tic_step.elapsed().as_secs_f64());
            if (step + 1) % log_every == 0 {
                let acc = compute_acc(batch_pred.detach(), batch_labels);
                // Burn does not expose allocator statistics.
                let gpu_mem_alloc = 0.0;
                info!(
                    "Part {} | Epoch {:05} | Step {:05} | Loss {:.4} | Train Acc {:.4} | Speed (samples/sec) {:.4} | GPU {:.1} MB | time {:.3} s",
                    ctx.rank,
                    epoch,
                    step,
                    scalar(loss_detached)?,
                    acc,
                    stats.mean_throughput(),
                    gpu_mem_alloc,
                    stats.mean_recent_step_time(log_every),
                );
            }
            start = Instant::now();
            step += 1;
        }
        // Keep answering gradient all-reduces until every rank is done.
        ddp.join()?;

        let toc = tic.elapsed().as_secs_f64();
        info!(
            "Part {}, Epoch Time(s): {:.4}, sample+data_copy: {:.4}, forward: {:.4}, backward: {:.4}, update: {:.4}, #seeds: {}, #inputs: {}",
            ctx.rank,
            toc,
            sample_time.as_secs_f64(),
            forward_time.as_secs_f64(),
            backward_time.as_secs_f64(),
            update_time.as_secs_f64(),
            num_seeds,
            num_inputs,
        );
        epoch_times.push(toc);

        if epoch % eval_every == 0 || epoch == args.num_epochs {
            let start = Instant::now();
            let (val_acc, acc) = evaluate(
                &model.valid(),
                g,
                &features,
                &labels,
                &data.val_nid,
                &data.test_nid,
                args.batch_size_eval,
                device,
            )?;
            test_acc = acc;
            info!(
                "Part {}, Val Acc {:.4}, Test Acc {:.4}, time: {:.4}",
                ctx.rank,
                val_acc,
                test_acc,
                start.elapsed().as_secs_f64()
            );
        }
    }

    Ok((trailing_epoch_mean(&epoch_times), test_acc))
}

/// Layer-wise inference over the whole graph, then accuracy on this rank's
/// validation and test ids. Every rank must call this together.
#[allow(clippy::too_many_arguments)]
pub fn evaluate<B: Backend>(
    model: &DistSage<B>,
    g: &DistGraph,
    inputs: &DistTensor,
    labels: &DistTensor,
    val_nid: &[NodeId],
    test_nid: &[NodeId],
    batch_size: usize,
    device: &B::Device,
) -> anyhow::Result<(f32, f32)> {
    let pred = model.inference(g, inputs, batch_size, device)?;
    let accuracy = |ids: &[NodeId]| -> anyhow::Result<f32> {
        if ids.is_empty() {
            return Ok(0.0);
        }
        let rows = rows_to_tensor::<B>(pred.gather(ids)?, ids.len(), pred.row_width(), device);
        let targets = labels_to_tensor::<B>(&labels.gather_column(ids)?, device);
        Ok(compute_acc(rows, targets))
    };
    let val_acc = accuracy(val_nid)?;
    let test_acc = accuracy(test_nid)?;
    // The next evaluation overwrites `pred` rows other ranks may still read.
    g.barrier()?;
    Ok((val_acc, test_acc))
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> anyhow::Result<f32> {
    let values = t
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read scalar tensor: {e:?}"))?;
    values
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("scalar tensor is empty"))
}

/// GPUs need the WGPU backend; without it `--num_gpus` must be 0.
pub fn validate_backend_choice(num_gpus: usize) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (num_gpus > 0, built_wgpu) {
        (true, false) => {
            anyhow::bail!("--num_gpus {num_gpus} needs the backend-wgpu feature; rebuild with --features backend-wgpu or pass --num_gpus 0")
        }
        (false, true) => {
            tracing::warn!("built with backend-wgpu and --num_gpus 0; trainers run on the WGPU CPU device");
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_names_and_defaults() {
        let args = TrainArgs::try_parse_from([
            "train",
            "--graph_name",
            "cora",
            "--ip_config",
            "ip.txt",
            "--part_config",
            "data/cora.json",
        ])
        .unwrap();
        assert_eq!(args.n_classes, 0);
        assert_eq!(args.backend, "gloo");
        assert_eq!(args.num_epochs, 20);
        assert_eq!(args.num_hidden, 16);
        assert_eq!(args.num_layers, 2);
        assert_eq!(args.fan_out, "10,25");
        assert_eq!(args.batch_size, 1000);
        assert_eq!(args.batch_size_eval, 100000);
        assert_eq!(args.log_every, 20);
        assert_eq!(args.eval_every, 5);
        assert_eq!(args.lr, 0.003);
        assert_eq!(args.dropout, 0.5);
        assert!(!args.pad_data);
        assert_eq!(args.net_type, "socket");

        let args = TrainArgs::try_parse_from([
            "train",
            "--graph_name",
            "cora",
            "--ip_config",
            "ip.txt",
            "--part_config",
            "cora.json",
            "--pad-data",
            "--net_type",
            "tensorpipe",
            "--local_rank",
            "1",
        ])
        .unwrap();
        assert!(args.pad_data);
        assert_eq!(args.local_rank, Some(1));
        assert_eq!(args.net_type, "tensorpipe");
    }

    #[test]
    fn unknown_net_type_is_rejected() {
        let parsed = TrainArgs::try_parse_from([
            "train",
            "--graph_name",
            "g",
            "--ip_config",
            "ip.txt",
            "--part_config",
            "g.json",
            "--net_type",
            "carrier-pigeon",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn padding_cycles_to_longest_rank() {
        let group = ProcessGroup::new(3, "gloo").unwrap();
        let padded: Vec<Vec<NodeId>> = thread::scope(|s| {
            let inputs = [vec![0, 1, 2, 3, 4], vec![7, 8], vec![]];
            let handles: Vec<_> = inputs
                .into_iter()
                .enumerate()
                .map(|(rank, ids)| {
                    let group = Arc::clone(&group);
                    s.spawn(move || pad_node_ids(ids, &group, rank).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(padded[0], vec![0, 1, 2, 3, 4]);
        assert_eq!(padded[1], vec![7, 8, 7, 8, 7]);
        assert!(padded[2].is_empty());
    }

    #[cfg(not(feature = "backend-wgpu"))]
    #[test]
    fn gpus_need_wgpu_build() {
        assert!(validate_backend_choice(1).is_err());
        assert!(validate_backend_choice(0).is_ok());
    }

    #[test]
    fn scalar_reads_first_value_and_rejects_empty() {
        type B = burn_ndarray::NdArray<f32>;
        let device = Default::default();
        let one = Tensor::<B, 1>::from_floats([2.5], &device);
        assert_eq!(scalar(one).unwrap(), 2.5);
        let empty = Tensor::<B, 1>::from_data(
            burn::tensor::TensorData::new(Vec::<f32>::new(), [0]),
            &device,
        );
        assert!(scalar(empty).is_err());
    }
}
