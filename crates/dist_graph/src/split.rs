use crate::graph::PartitionBook;
use crate::tensor::DistTensor;
use crate::types::{DistResult, NodeId};

/// Assign the nodes selected by `mask` to the rank holding `pb`.
///
/// - `force_even`: masked ids in ascending order are cut into
///   `num_partitions` contiguous chunks whose sizes differ by at most one;
///   the rank gets chunk `pb.partid()`. Because ids are relabelled by
///   partition, most of a chunk is local.
/// - otherwise: the masked ids the rank's partition owns.
/// - `trainer_ids`: the masked ids whose trainer id equals the rank, evened
///   out as above when `force_even` and the trainer ids are unbalanced.
///
/// Across all ranks the results cover every masked node exactly once.
pub fn node_split(
    mask: &DistTensor,
    pb: &PartitionBook,
    force_even: bool,
    trainer_ids: Option<&DistTensor>,
) -> DistResult<Vec<NodeId>> {
    let all: Vec<NodeId> = (0..mask.num_rows() as NodeId).collect();
    let flags = mask.gather_column(&all)?;
    let selected: Vec<NodeId> = all
        .iter()
        .zip(&flags)
        .filter(|(_, m)| **m != 0.0)
        .map(|(&id, _)| id)
        .collect();

    let parts = pb.num_partitions().max(1);
    let rank = pb.partid();

    if let Some(trainers) = trainer_ids {
        let owners = trainers.gather_column(&selected)?;
        let mut buckets: Vec<Vec<NodeId>> = vec![Vec::new(); parts];
        let mut spill = Vec::new();
        for (&id, &owner) in selected.iter().zip(&owners) {
            match usize::try_from(owner as i64).ok().filter(|o| *o < parts) {
                Some(o) => buckets[o].push(id),
                None => spill.push(id),
            }
        }
        if !force_even {
            return Ok(std::mem::take(&mut buckets[rank]));
        }
        return Ok(rebalance(buckets, spill, selected.len(), rank));
    }

    Ok(split_ids(&selected, pb, force_even))
}

/// [`node_split`] over an explicit ascending id list instead of a mask.
pub fn split_ids(selected: &[NodeId], pb: &PartitionBook, force_even: bool) -> Vec<NodeId> {
    let rank = pb.partid();
    if force_even {
        let (start, end) = even_bounds(selected.len(), pb.num_partitions().max(1), rank);
        return selected[start..end].to_vec();
    }
    let local = pb.partid2nids(rank);
    selected.iter().copied().filter(|id| local.contains(id)).collect()
}

fn even_bounds(total: usize, parts: usize, rank: usize) -> (usize, usize) {
    (rank * total / parts, (rank + 1) * total / parts)
}

/// Move the overflow of over-full trainer buckets (plus unowned ids) to
/// under-full ones so sizes match `even_bounds`. Ranks keep their own ids
/// first.
fn rebalance(
    mut buckets: Vec<Vec<NodeId>>,
    mut spill: Vec<NodeId>,
    total: usize,
    rank: usize,
) -> Vec<NodeId> {
    let parts = buckets.len();
    let targets: Vec<usize> = (0..parts)
        .map(|r| {
            let (s, e) = even_bounds(total, parts, r);
            e - s
        })
        .collect();
    for (bucket, &target) in buckets.iter_mut().zip(&targets) {
        if bucket.len() > target {
            spill.extend(bucket.drain(target..));
        }
    }
    spill.sort_unstable();
    let mut spill = spill.into_iter();
    for (bucket, &target) in buckets.iter_mut().zip(&targets) {
        while bucket.len() < target {
            match spill.next() {
                Some(id) => bucket.push(id),
                None => break,
            }
        }
    }
    std::mem::take(&mut buckets[rank])
}
