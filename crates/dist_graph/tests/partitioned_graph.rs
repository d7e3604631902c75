use anyhow::Result;
use dist_graph::{
    initialize, node_split, partition_graph, synthetic_graph, DistGraphError, DistNodeDataLoader,
    GraphServer, LoaderConfig, NeighborSampler, ProcessGroup, SyntheticGraphConfig,
};
use data_contracts::{ContractError, NetType, NodeDataFile, PartitionConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::sync::Arc;

fn toy_cluster(num_parts: usize) -> Result<(tempfile::TempDir, Arc<GraphServer>)> {
    let temp = tempfile::tempdir()?;
    let graph = synthetic_graph(&SyntheticGraphConfig {
        num_nodes: 20,
        num_classes: 2,
        feat_dim: 4,
        avg_degree: 3,
        seed: 7,
        ..Default::default()
    });
    let part_config = partition_graph(&graph, "toy", num_parts, temp.path())?;
    let ip_config = temp.path().join("ip_config.txt");
    fs::write(&ip_config, "127.0.0.1\n")?;
    let runtime = initialize(&ip_config, NetType::Socket)?;
    let server = GraphServer::load(&runtime, "toy", &part_config)?;
    Ok((temp, server))
}

#[test]
fn loads_all_partitions_into_shared_ndata() -> Result<()> {
    let (_temp, server) = toy_cluster(2)?;
    let group = ProcessGroup::new(2, "gloo")?;
    let g0 = server.connect(0, Arc::clone(&group))?;
    let g1 = server.connect(1, Arc::clone(&group))?;
    assert_eq!(g0.num_nodes(), 20);
    assert_eq!(g0.ndata("features")?.shape(), [20, 4]);
    assert!(g0.ndata("features")?.same_storage(&g1.ndata("features")?));
    assert!(!g0.has_ndata("trainer_id"));
    assert!(matches!(
        g0.ndata("missing"),
        Err(DistGraphError::MissingNodeData(_))
    ));
    assert_eq!(g1.partition_book().partid2nids(1), 10..20);
    Ok(())
}

#[test]
fn graph_name_must_match_config() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let graph = synthetic_graph(&SyntheticGraphConfig {
        num_nodes: 6,
        ..Default::default()
    });
    let part_config = partition_graph(&graph, "toy", 1, temp.path())?;
    let ip_config = temp.path().join("ip_config.txt");
    fs::write(&ip_config, "127.0.0.1\n")?;
    let runtime = initialize(&ip_config, NetType::TensorPipe)?;
    let err = GraphServer::load(&runtime, "other", &part_config).unwrap_err();
    assert!(matches!(err, DistGraphError::GraphName { .. }));
    Ok(())
}

#[test]
fn partitions_must_agree_on_feature_width() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let graph = synthetic_graph(&SyntheticGraphConfig {
        num_nodes: 8,
        feat_dim: 2,
        ..Default::default()
    });
    let part_config = partition_graph(&graph, "toy", 2, temp.path())?;
    let cfg = PartitionConfig::load(&part_config)?;
    let feats_path = cfg.resolve(&part_config, &cfg.parts[1].node_feats);
    let mut part = NodeDataFile::load(&feats_path)?;
    for row in &mut part.features {
        row.push(1.0);
    }
    part.save(&feats_path)?;

    let ip_config = temp.path().join("ip_config.txt");
    fs::write(&ip_config, "127.0.0.1\n")?;
    let runtime = initialize(&ip_config, NetType::Socket)?;
    let err = GraphServer::load(&runtime, "toy", &part_config).unwrap_err();
    assert!(matches!(
        err,
        DistGraphError::Contract(ContractError::FeatureWidth {
            row: 4,
            expected: 2,
            found: 3,
        })
    ));
    Ok(())
}

#[test]
fn world_size_must_match_partitions() -> Result<()> {
    let (_temp, server) = toy_cluster(2)?;
    let group = ProcessGroup::new(3, "gloo")?;
    assert!(matches!(
        server.connect(0, group),
        Err(DistGraphError::WorldSize { .. })
    ));
    Ok(())
}

#[test]
fn sampled_blocks_chain_from_input_to_seeds() -> Result<()> {
    let (_temp, server) = toy_cluster(1)?;
    let g = server.connect(0, ProcessGroup::new(1, "gloo")?)?;
    let sampler = NeighborSampler::parse("2,-1")?;
    let mut rng = StdRng::seed_from_u64(3);
    let seeds = vec![4, 9, 13];
    let (input_nodes, blocks) = sampler.sample_blocks(&g, &seeds, &mut rng)?;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1].dst_nodes(), seeds.as_slice());
    assert_eq!(blocks[0].dst_nodes(), blocks[1].src_nodes.as_slice());
    assert_eq!(input_nodes, blocks[0].src_nodes);
    // Inner layer takes every neighbor.
    for (dst_local, &node) in seeds.iter().enumerate() {
        assert_eq!(blocks[1].in_degrees()[dst_local], g.in_neighbors(node)?.len());
    }
    // Outer layer caps at two.
    assert!(blocks[0].in_degrees().iter().all(|d| *d <= 2));
    Ok(())
}

#[test]
fn loader_visits_every_seed_once_per_pass() -> Result<()> {
    let (_temp, server) = toy_cluster(1)?;
    let g = server.connect(0, ProcessGroup::new(1, "gloo")?)?;
    let nids: Vec<u64> = (0..20).collect();
    let mut loader = DistNodeDataLoader::new(
        g,
        nids.clone(),
        NeighborSampler::parse("-1")?,
        LoaderConfig {
            batch_size: 6,
            shuffle: true,
            drop_last: false,
            seed: Some(1),
        },
    )?;
    assert_eq!(loader.len(), 4);
    for _ in 0..2 {
        let mut seen = Vec::new();
        let mut batches = 0;
        while let Some(batch) = loader.next_batch()? {
            batches += 1;
            seen.extend(batch.seeds);
        }
        assert_eq!(batches, 4);
        seen.sort_unstable();
        assert_eq!(seen, nids);
        loader.reset();
    }
    Ok(())
}

#[test]
fn persistent_tensors_are_shared_by_name() -> Result<()> {
    let (_temp, server) = toy_cluster(2)?;
    let group = ProcessGroup::new(2, "gloo")?;
    let g0 = server.connect(0, Arc::clone(&group))?;
    let g1 = server.connect(1, group)?;
    let a = g0.new_tensor("h_0", 3, true)?;
    let b = g1.new_tensor("h_0", 3, true)?;
    assert!(a.same_storage(&b));
    assert!(g1.new_tensor("h_0", 5, true).is_err());
    assert!(!g0.new_tensor("h_0", 3, false)?.same_storage(&a));
    Ok(())
}

#[test]
fn node_split_over_loaded_masks_is_a_partition() -> Result<()> {
    let (_temp, server) = toy_cluster(2)?;
    let group = ProcessGroup::new(2, "gloo")?;
    let mut all = Vec::new();
    for rank in 0..2 {
        let g = server.connect(rank, Arc::clone(&group))?;
        let mask = g.ndata("train_mask")?;
        all.extend(node_split(&mask, &g.partition_book(), true, None)?);
    }
    let mask = server.connect(0, group)?.ndata("train_mask")?;
    let expected: Vec<u64> = (0..20u64)
        .filter(|id| mask.gather_column(&[*id]).map(|v| v[0] != 0.0).unwrap_or(false))
        .collect();
    all.sort_unstable();
    assert_eq!(all, expected);
    Ok(())
}
