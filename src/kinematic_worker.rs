//! The broad-phase thread. Consumes dT's latest pose buffer, rebuilds a
//! spatial hash over voxel bins, generates candidate contact pairs from
//! each body's 27-neighborhood, deduplicates by ordered `(A, B)`, and
//! republishes the new contact list together with the old-to-new mapping
//! dT's history migrator consumes.

use std::collections::HashMap;
use std::sync::Arc;

use fxhash::FxBuildHasher;

use crate::arrays::{ContactType, NULL_MAPPING};
use crate::buffers::{ContactsBuffer, PositionsBuffer};
use crate::config::Config;
use crate::coordination::SchedSupport;
use crate::encoding::Lattice;
use crate::error::DemResult;
use crate::family::FamilyMap;

/// A pair key in canonical (smaller-first) order so `(a, b)` and `(b, a)`
/// hash identically and dedup trivially.
type PairKey = (u32, u32);

pub struct KinematicWorker {
    pub lattice: Lattice,
    pub config: Config,
    pub families: Arc<FamilyMap>,
    pub sched: Arc<SchedSupport>,
    pub inbound: Arc<std::sync::Mutex<PositionsBuffer>>,
    pub outbound: Arc<std::sync::Mutex<ContactsBuffer>>,
    /// Old-list pair keys in the order they last occupied their slot, kept
    /// across cycles purely to compute the next mapping.
    prior_pairs: Vec<PairKey>,
    /// Sphere radius and local owner offset, set once at load time and
    /// never touched by dT.
    sphere_owner: Vec<u32>,
    sphere_radius: Vec<f64>,
    sphere_rel_pos: Vec<[f64; 3]>,
}

impl KinematicWorker {
    pub fn new(
        lattice: Lattice,
        config: Config,
        families: Arc<FamilyMap>,
        sched: Arc<SchedSupport>,
        inbound: Arc<std::sync::Mutex<PositionsBuffer>>,
        outbound: Arc<std::sync::Mutex<ContactsBuffer>>,
        sphere_owner: Vec<u32>,
        sphere_radius: Vec<f64>,
        sphere_rel_pos: Vec<[f64; 3]>,
    ) -> Self {
        KinematicWorker {
            lattice,
            config,
            families,
            sched,
            inbound,
            outbound,
            prior_pairs: Vec::new(),
            sphere_owner,
            sphere_radius,
            sphere_rel_pos,
        }
    }

    /// Blocks on the start latch and runs `cycles_per_call()` passes per
    /// wake, matching dT's own per-wake cycle count rather than being
    /// re-pulsed once per dT cycle.
    pub fn run(mut self) -> Self {
        loop {
            self.sched.kinematic_start.wait_for_start();
            if self.sched.kinematic_start.should_join() {
                break;
            }
            for _ in 0..self.config.cycles_per_call() {
                if let Err(err) = self.run_one_cycle() {
                    tracing::error!(error = %err, "kinematic worker aborting cycle");
                    return self;
                }
            }
        }
        self
    }

    fn run_one_cycle(&mut self) -> DemResult<()> {
        let span = tracing::trace_span!("kinematic_cycle");
        let _enter = span.enter();

        if self.sched.kinematic_should_wait() {
            return Ok(());
        }

        let (voxel_id, sub_x, sub_y, sub_z, q0, q1, q2, q3) = {
            let _guard = self.sched.kinematic_owned_buffer_lock.lock().unwrap();
            let inbound = self.inbound.lock().unwrap();
            let snapshot = (
                inbound.voxel_id.clone(),
                inbound.sub_x.clone(),
                inbound.sub_y.clone(),
                inbound.sub_z.clone(),
                inbound.ori_q0.clone(),
                inbound.ori_q1.clone(),
                inbound.ori_q2.clone(),
                inbound.ori_q3.clone(),
            );
            self.sched.kinematic_owned_cons2prod.clear();
            snapshot
        };

        let positions = self.sphere_world_positions(&voxel_id, &sub_x, &sub_y, &sub_z, &q0, &q1, &q2, &q3);
        let new_pairs = self.broad_phase(&positions);
        let mapping = self.rebind_mapping(&new_pairs);

        let id_a: Vec<u32> = new_pairs.iter().map(|&(a, _)| a).collect();
        let id_b: Vec<u32> = new_pairs.iter().map(|&(_, b)| b).collect();
        let contact_type = vec![ContactType::SphereSphere; new_pairs.len()];

        {
            let _guard = self.sched.dynamic_owned_buffer_lock.lock().unwrap();
            let mut outbound = self.outbound.lock().unwrap();
            let mapping_out = if self.config.is_historyless { None } else { Some(mapping.as_slice()) };
            outbound.publish(&id_a, &id_b, &contact_type, mapping_out);
        }
        self.sched.dynamic_owned_prod2cons.publish();
        self.prior_pairs = new_pairs;
        Ok(())
    }

    fn sphere_world_positions(
        &self,
        voxel_id: &[u64],
        sub_x: &[u32],
        sub_y: &[u32],
        sub_z: &[u32],
        q0: &[f64],
        q1: &[f64],
        q2: &[f64],
        q3: &[f64],
    ) -> Vec<[f64; 3]> {
        use crate::encoding::Quaternion;
        self.sphere_owner
            .iter()
            .zip(self.sphere_rel_pos.iter())
            .map(|(&owner, &rel)| {
                let i = owner as usize;
                let center = self.lattice.decode(voxel_id[i], sub_x[i], sub_y[i], sub_z[i]);
                let q = Quaternion {
                    q0: q0[i],
                    q1: q1[i],
                    q2: q2[i],
                    q3: q3[i],
                };
                let rotated = q.rotate(rel);
                [
                    center[0] + rotated[0],
                    center[1] + rotated[1],
                    center[2] + rotated[2],
                ]
            })
            .collect()
    }

    /// Bins every sphere by voxel, then for each sphere scans the
    /// 27-neighborhood of its own bin (itself plus the 26 adjacent voxels)
    /// for overlap candidates, keeping only `id_a < id_b` so each pair
    /// surfaces once regardless of which sphere's bin found it first.
    fn broad_phase(&self, positions: &[[f64; 3]]) -> Vec<PairKey> {
        let mut bins: HashMap<(i64, i64, i64), Vec<usize>, FxBuildHasher> =
            HashMap::with_hasher(FxBuildHasher::default());
        let cell = self.lattice.voxel_size;
        let bin_of = |p: [f64; 3]| -> (i64, i64, i64) {
            (
                (p[0] / cell).floor() as i64,
                (p[1] / cell).floor() as i64,
                (p[2] / cell).floor() as i64,
            )
        };
        for (i, &p) in positions.iter().enumerate() {
            bins.entry(bin_of(p)).or_default().push(i);
        }

        let mut found = std::collections::HashSet::with_hasher(FxBuildHasher::default());
        for (i, &p) in positions.iter().enumerate() {
            let (bx, by, bz) = bin_of(p);
            for dx in -1..=1 {
                for dy in -1..=1 {
                    for dz in -1..=1 {
                        let Some(candidates) = bins.get(&(bx + dx, by + dy, bz + dz)) else {
                            continue;
                        };
                        for &j in candidates {
                            if j <= i {
                                continue;
                            }
                            let owner_i = self.sphere_owner[i];
                            let owner_j = self.sphere_owner[j];
                            if owner_i == owner_j {
                                continue;
                            }
                            let d = [
                                positions[j][0] - p[0],
                                positions[j][1] - p[1],
                                positions[j][2] - p[2],
                            ];
                            let dist2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
                            let reach = self.sphere_radius[i] + self.sphere_radius[j];
                            if dist2 <= reach * reach {
                                let key = if owner_i < owner_j {
                                    (owner_i, owner_j)
                                } else {
                                    (owner_j, owner_i)
                                };
                                found.insert(key);
                            }
                        }
                    }
                }
            }
        }
        let mut pairs: Vec<PairKey> = found.into_iter().collect();
        pairs.sort_unstable();
        pairs
    }

    /// For each entry of `new_pairs`, looks up its index in `prior_pairs`
    /// (stable rekey by identity of the `(A, B)` pair) and returns
    /// `NULL_MAPPING` for pairs that did not exist last cycle.
    fn rebind_mapping(&self, new_pairs: &[PairKey]) -> Vec<u32> {
        let mut old_index: HashMap<PairKey, u32, FxBuildHasher> =
            HashMap::with_hasher(FxBuildHasher::default());
        for (idx, &key) in self.prior_pairs.iter().enumerate() {
            old_index.insert(key, idx as u32);
        }
        new_pairs
            .iter()
            .map(|key| *old_index.get(key).unwrap_or(&NULL_MAPPING))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Lattice;

    fn test_lattice() -> Lattice {
        Lattice {
            nx_bits: 16,
            ny_bits: 16,
            nz_bits: 16,
            voxel_size: 1.0,
            l: 1.0 / 1024.0,
            lbf: [-50.0, -50.0, -50.0],
        }
    }

    fn make_worker(owner: Vec<u32>, radius: Vec<f64>) -> KinematicWorker {
        let n = owner.len();
        KinematicWorker::new(
            test_lattice(),
            Config::default(),
            Arc::new(FamilyMap::new()),
            Arc::new(SchedSupport::new(4)),
            Arc::new(std::sync::Mutex::new(PositionsBuffer::default())),
            Arc::new(std::sync::Mutex::new(ContactsBuffer::default())),
            owner,
            radius,
            vec![[0.0; 3]; n],
        )
    }

    #[test]
    fn broad_phase_finds_overlapping_pair_across_owners() {
        let worker = make_worker(vec![0, 1], vec![1.0, 1.0]);
        let positions = vec![[0.0, 0.0, 0.0], [1.5, 0.0, 0.0]];
        let pairs = worker.broad_phase(&positions);
        assert_eq!(pairs, vec![(0, 1)]);
    }

    #[test]
    fn broad_phase_ignores_spheres_on_the_same_owner() {
        let worker = make_worker(vec![0, 0], vec![1.0, 1.0]);
        let positions = vec![[0.0, 0.0, 0.0], [0.5, 0.0, 0.0]];
        let pairs = worker.broad_phase(&positions);
        assert!(pairs.is_empty());
    }

    #[test]
    fn rebind_mapping_finds_surviving_pair_and_flags_new_one() {
        let mut worker = make_worker(vec![0, 1, 2], vec![1.0, 1.0, 1.0]);
        worker.prior_pairs = vec![(0, 1)];
        let mapping = worker.rebind_mapping(&[(0, 1), (1, 2)]);
        assert_eq!(mapping[0], 0);
        assert_eq!(mapping[1], NULL_MAPPING);
    }
}
