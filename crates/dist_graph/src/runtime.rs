//! Cluster bootstrap and process-group collectives.

use crate::types::{DistGraphError, DistResult};
use data_contracts::{IpConfig, NetType};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

/// Handle returned by [`initialize`]; required to open a graph.
#[derive(Debug, Clone)]
pub struct DistRuntime {
    pub ip_config: IpConfig,
    pub net_type: NetType,
}

/// Read the cluster description and bring the runtime up.
///
/// All partitions are served from this process, so remote machines in the
/// IP config are only recorded.
pub fn initialize(ip_config: &Path, net_type: NetType) -> DistResult<DistRuntime> {
    let ip_config = IpConfig::load(ip_config)?;
    if !ip_config.all_loopback() {
        tracing::warn!(
            machines = ip_config.num_machines(),
            "ip config lists non-loopback machines; all partitions are served in-process"
        );
    }
    tracing::debug!(machines = ip_config.num_machines(), %net_type, "runtime initialized");
    Ok(DistRuntime {
        ip_config,
        net_type,
    })
}

const BACKENDS: [&str; 3] = ["gloo", "nccl", "mpi"];

#[derive(Debug, Default)]
struct ReduceState {
    generation: u64,
    arrived: usize,
    active: usize,
    acc: Vec<f64>,
    result: Arc<Vec<f64>>,
    result_active: usize,
    aborted: bool,
}

/// Collectives shared by every trainer of the job.
///
/// Each collective is a rendezvous: it returns once all `world_size` ranks
/// have entered it, so every rank must issue the same sequence of calls.
/// After [`ProcessGroup::abort`] every pending and future collective fails.
#[derive(Debug)]
pub struct ProcessGroup {
    world_size: usize,
    backend: String,
    state: Mutex<ReduceState>,
    cv: Condvar,
}

impl ProcessGroup {
    pub fn new(world_size: usize, backend: &str) -> DistResult<Arc<Self>> {
        let backend = backend.trim().to_ascii_lowercase();
        if !BACKENDS.contains(&backend.as_str()) {
            return Err(DistGraphError::Backend(backend));
        }
        if world_size == 0 {
            return Err(DistGraphError::Rank {
                rank: 0,
                world_size,
            });
        }
        Ok(Arc::new(Self {
            world_size,
            backend,
            state: Mutex::new(ReduceState::default()),
            cv: Condvar::new(),
        }))
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn barrier(&self) -> DistResult<()> {
        self.reduce_f64(&mut [], true).map(|_| ())
    }

    /// Release every rank blocked in a collective with an error.
    pub fn abort(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.aborted = true;
        }
        self.cv.notify_all();
    }

    /// Sum `data` element-wise across ranks, in place.
    ///
    /// `active == false` marks a rank that has joined: it contributes
    /// nothing (pass an empty slice) and only keeps the rendezvous going.
    /// Returns how many ranks were active in this round.
    pub fn all_reduce_sum(&self, data: &mut [f32], active: bool) -> DistResult<usize> {
        let mut buf: Vec<f64> = data.iter().map(|v| f64::from(*v)).collect();
        let active_count = self.reduce_f64(&mut buf, active)?;
        for (dst, src) in data.iter_mut().zip(buf) {
            *dst = src as f32;
        }
        Ok(active_count)
    }

    /// Copy `root`'s `data` into every other rank's `data`.
    pub fn broadcast(&self, rank: usize, data: &mut [f32], root: usize) -> DistResult<()> {
        self.check_rank(root)?;
        if rank != root {
            data.fill(0.0);
        }
        self.all_reduce_sum(data, true)?;
        Ok(())
    }

    /// Gather one value from every rank, indexed by rank.
    pub fn all_gather_usize(&self, rank: usize, value: usize) -> DistResult<Vec<usize>> {
        self.check_rank(rank)?;
        let mut buf = vec![0f64; self.world_size];
        buf[rank] = value as f64;
        self.reduce_f64(&mut buf, true)?;
        Ok(buf.into_iter().map(|v| v as usize).collect())
    }

    fn check_rank(&self, rank: usize) -> DistResult<()> {
        if rank >= self.world_size {
            return Err(DistGraphError::Rank {
                rank,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    fn reduce_f64(&self, data: &mut [f64], active: bool) -> DistResult<usize> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| DistGraphError::Poisoned("process group"))?;
        if st.aborted {
            return Err(DistGraphError::Aborted);
        }
        let generation = st.generation;
        if st.acc.len() < data.len() {
            st.acc.resize(data.len(), 0.0);
        }
        for (acc, v) in st.acc.iter_mut().zip(data.iter()) {
            *acc += *v;
        }
        st.arrived += 1;
        if active {
            st.active += 1;
        }
        if st.arrived == self.world_size {
            let acc = std::mem::take(&mut st.acc);
            st.result = Arc::new(acc);
            st.result_active = st.active;
            st.arrived = 0;
            st.active = 0;
            st.generation = st.generation.wrapping_add(1);
            self.cv.notify_all();
        } else {
            while st.generation == generation && !st.aborted {
                st = self
                    .cv
                    .wait(st)
                    .map_err(|_| DistGraphError::Poisoned("process group"))?;
            }
            if st.generation == generation {
                return Err(DistGraphError::Aborted);
            }
        }
        for (dst, src) in data.iter_mut().zip(st.result.iter()) {
            *dst = *src;
        }
        Ok(st.result_active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn unknown_backend_rejected() {
        assert!(matches!(
            ProcessGroup::new(2, "carrier-pigeon"),
            Err(DistGraphError::Backend(_))
        ));
        assert_eq!(ProcessGroup::new(1, "GLOO").unwrap().backend(), "gloo");
    }

    #[test]
    fn all_reduce_sums_across_threads() {
        let group = ProcessGroup::new(3, "gloo").unwrap();
        let results: Vec<Vec<f32>> = thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|rank| {
                    let group = Arc::clone(&group);
                    s.spawn(move || {
                        let mut data = vec![rank as f32, 1.0];
                        let active = group.all_reduce_sum(&mut data, true).unwrap();
                        assert_eq!(active, 3);
                        data
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for data in results {
            assert_eq!(data, vec![3.0, 3.0]);
        }
    }

    #[test]
    fn joined_rank_keeps_rendezvous_alive() {
        let group = ProcessGroup::new(2, "gloo").unwrap();
        thread::scope(|s| {
            let g0 = Arc::clone(&group);
            s.spawn(move || {
                // Three steps, then join.
                for _ in 0..3 {
                    let mut data = vec![2.0f32];
                    g0.all_reduce_sum(&mut data, true).unwrap();
                }
                while g0.all_reduce_sum(&mut [], false).unwrap() > 0 {}
            });
            let g1 = Arc::clone(&group);
            s.spawn(move || {
                let mut seen = Vec::new();
                let mut data = vec![1.0f32];
                g1.all_reduce_sum(&mut data, true).unwrap();
                seen.push(data[0]);
                while g1.all_reduce_sum(&mut [], false).unwrap() > 0 {}
                assert_eq!(seen, vec![3.0]);
            });
        });
    }

    #[test]
    fn abort_releases_waiting_ranks() {
        let group = ProcessGroup::new(2, "gloo").unwrap();
        thread::scope(|s| {
            let waiter = Arc::clone(&group);
            let handle = s.spawn(move || waiter.barrier());
            // Rank 1 fails instead of reaching the barrier.
            group.abort();
            assert!(matches!(handle.join().unwrap(), Err(DistGraphError::Aborted)));
        });
        assert!(group.barrier().is_err());
    }

    #[test]
    fn broadcast_and_all_gather() {
        let group = ProcessGroup::new(2, "gloo").unwrap();
        thread::scope(|s| {
            for rank in 0..2 {
                let group = Arc::clone(&group);
                s.spawn(move || {
                    let mut data = vec![rank as f32 + 5.0; 4];
                    group.broadcast(rank, &mut data, 0).unwrap();
                    assert_eq!(data, vec![5.0; 4]);
                    let lens = group.all_gather_usize(rank, 10 + rank).unwrap();
                    assert_eq!(lens, vec![10, 11]);
                });
            }
        });
    }
}
