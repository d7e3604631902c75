use clap::Parser;
use dist_graph::{partition_graph, synthetic_graph, SyntheticGraphConfig};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Generate a synthetic community graph and write it as range partitions.
#[derive(Parser, Debug)]
#[command(name = "partition", about = "Write a synthetic graph as range partitions")]
struct PartitionArgs {
    #[arg(long = "graph_name", default_value = "synthetic")]
    graph_name: String,
    #[arg(long = "num_parts", default_value_t = 2)]
    num_parts: usize,
    #[arg(long = "num_nodes", default_value_t = 1000)]
    num_nodes: usize,
    #[arg(long = "num_classes", default_value_t = 4)]
    num_classes: usize,
    #[arg(long = "feat_dim", default_value_t = 16)]
    feat_dim: usize,
    #[arg(long = "avg_degree", default_value_t = 8)]
    avg_degree: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Output directory for the partition config and part folders.
    #[arg(long, default_value = "data")]
    output: PathBuf,
    /// Skip writing a loopback `ip_config.txt` next to the partitions.
    #[arg(long = "no_ip_config", default_value_t = false)]
    no_ip_config: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = PartitionArgs::parse();
    if args.num_parts == 0 {
        anyhow::bail!("--num_parts must be positive");
    }

    let graph = synthetic_graph(&SyntheticGraphConfig {
        num_nodes: args.num_nodes,
        num_classes: args.num_classes,
        feat_dim: args.feat_dim,
        avg_degree: args.avg_degree,
        seed: args.seed,
        ..Default::default()
    });
    fs::create_dir_all(&args.output)?;
    let config = partition_graph(&graph, &args.graph_name, args.num_parts, &args.output)?;
    if !args.no_ip_config {
        fs::write(args.output.join("ip_config.txt"), "127.0.0.1\n")?;
    }
    println!(
        "Wrote {} partitions of {} ({} nodes, {} edges) to {}",
        args.num_parts,
        args.graph_name,
        graph.num_nodes,
        graph.edges.len(),
        config.display()
    );
    Ok(())
}
