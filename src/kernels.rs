//! The boundary between the worker loops and the actual force/integration
//! math. `KernelGroups` names the fixed set of entry points a worker
//! calls each cycle; callers never know (or care) whether an
//! implementation runs on the host or dispatches to a device.
//!
//! `HostKernelGroups` is the reference implementation this crate tests
//! against. The optional `gpu` feature adds `VulkanKernelGroups`, which
//! pins a device and command stream the way a real device-backed kernel
//! group would, while still running the force math on the host — device
//! dispatch of the actual compute kernels is out of scope here.

use crate::arrays::GranData;
use crate::config::Config;
use crate::encoding::{Lattice, Quaternion};
use crate::error::DemResult;

/// Everything a worker needs from the "kernel" side of the boundary.
/// Implementors receive only the pointer bundle and count they need;
/// nothing here assumes a particular execution backend.
pub trait KernelGroups: Send + Sync {
    /// Clears force/torque accumulators ahead of a force pass and seeds
    /// owner acceleration with `cfg.gravity`.
    fn prepare_force_arrays(&self, gd: &mut GranData<'_>, cfg: &Config) -> DemResult<()>;

    /// Marks contacts whose owners are still within interaction range;
    /// a historyless run uses this result directly in place of history.
    fn mark_alive_contacts(&self, gd: &GranData<'_>, alive: &mut [bool]) -> DemResult<()>;

    /// Rebinds `history`/`duration` under the just-published mapping. A
    /// no-op group used in historyless mode may leave this unimplemented
    /// by simply not calling it (the worker loop skips it entirely).
    fn rearrange_contact_history(
        &self,
        gd: &mut GranData<'_>,
        mapping: &[u32],
    ) -> DemResult<()>;

    /// Computes normal/tangential force and torque per contact, consuming
    /// per-contact history/duration.
    fn calculate_contact_forces(&self, gd: &mut GranData<'_>, cfg: &Config) -> DemResult<()>;

    /// Historyless variant: force depends only on current geometry.
    fn calculate_contact_forces_historyless(
        &self,
        gd: &mut GranData<'_>,
        cfg: &Config,
    ) -> DemResult<()>;

    /// Reduces per-contact force/torque onto each contact's two owners.
    fn collect_contact_forces(&self, gd: &mut GranData<'_>) -> DemResult<()>;

    /// Newton-Euler integration of owner velocity, angular velocity, and
    /// pose, advancing by `cfg.h`. `lattice` is needed to decode/re-encode
    /// the fixed-point position after applying the velocity update.
    fn integrate_clumps(&self, gd: &mut GranData<'_>, cfg: &Config, lattice: &Lattice) -> DemResult<()>;

    /// Applies any pending family reassignment to `gd.owner_family`.
    fn apply_family_changes(&self, gd: &mut GranData<'_>) -> DemResult<()>;

    /// Total kinetic energy across all owners, for diagnostics.
    fn compute_ke(&self, gd: &GranData<'_>) -> DemResult<f64>;
}

/// Plain-Rust reference implementation. No SIMD, no device dispatch; exists
/// so the rest of the crate is fully testable without a GPU present.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostKernelGroups;

impl KernelGroups for HostKernelGroups {
    fn prepare_force_arrays(&self, gd: &mut GranData<'_>, cfg: &Config) -> DemResult<()> {
        unsafe {
            for f in gd.contact_normal_force_slice() {
                *f = [0.0; 3];
            }
            for f in gd.contact_tangential_force_slice() {
                *f = [0.0; 3];
            }
            for acc in gd.owner_acc_slice() {
                *acc = cfg.gravity;
            }
            for ang_acc in gd.owner_ang_acc_slice() {
                *ang_acc = [0.0; 3];
            }
        }
        Ok(())
    }

    fn mark_alive_contacts(&self, gd: &GranData<'_>, alive: &mut [bool]) -> DemResult<()> {
        debug_assert_eq!(alive.len(), gd.n_contacts);
        unsafe {
            let a = gd.contact_id_a_slice();
            let b = gd.contact_id_b_slice();
            for i in 0..gd.n_contacts {
                alive[i] = a[i] != b[i];
            }
        }
        Ok(())
    }

    fn rearrange_contact_history(
        &self,
        _gd: &mut GranData<'_>,
        _mapping: &[u32],
    ) -> DemResult<()> {
        // The worker loop calls `history::migrate` directly against the
        // owning arrays; this entry point exists for a device-backed
        // implementation that would instead dispatch a rebind kernel.
        Ok(())
    }

    fn calculate_contact_forces(&self, gd: &mut GranData<'_>, cfg: &Config) -> DemResult<()> {
        self.calculate_contact_forces_historyless(gd, cfg)
    }

    fn calculate_contact_forces_historyless(
        &self,
        gd: &mut GranData<'_>,
        _cfg: &Config,
    ) -> DemResult<()> {
        unsafe {
            let pa = gd.contact_point_a_slice();
            let pb = gd.contact_point_b_slice();
            let forces = gd.contact_normal_force_slice();
            for i in 0..gd.n_contacts {
                let d = [pb[i][0] - pa[i][0], pb[i][1] - pa[i][1], pb[i][2] - pa[i][2]];
                let dist = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                let overlap = -dist;
                if overlap <= 0.0 {
                    continue;
                }
                let stiffness = 1.0e5;
                let mag = stiffness * overlap;
                let dir = if dist > 1e-12 {
                    [d[0] / dist, d[1] / dist, d[2] / dist]
                } else {
                    [0.0, 0.0, 1.0]
                };
                forces[i] = [dir[0] * mag, dir[1] * mag, dir[2] * mag];
            }
        }
        Ok(())
    }

    fn collect_contact_forces(&self, gd: &mut GranData<'_>) -> DemResult<()> {
        unsafe {
            let ids_a = gd.contact_id_a_slice().to_vec();
            let ids_b = gd.contact_id_b_slice().to_vec();
            let forces = gd.contact_normal_force_slice().to_vec();
            let acc = gd.owner_acc_slice();
            for ((a, b), f) in ids_a.iter().zip(ids_b.iter()).zip(forces.iter()) {
                let a = *a as usize;
                let b = *b as usize;
                if a < acc.len() {
                    acc[a][0] += f[0];
                    acc[a][1] += f[1];
                    acc[a][2] += f[2];
                }
                if b < acc.len() {
                    acc[b][0] -= f[0];
                    acc[b][1] -= f[1];
                    acc[b][2] -= f[2];
                }
            }
        }
        Ok(())
    }

    fn integrate_clumps(&self, gd: &mut GranData<'_>, cfg: &Config, lattice: &Lattice) -> DemResult<()> {
        unsafe {
            let vel_ptr = gd.owner_vel;
            let acc = gd.owner_acc_slice();
            let vel = std::slice::from_raw_parts_mut(vel_ptr, gd.n_owner_bodies);
            let ang_vel = gd.owner_ang_vel_slice();
            let ang_acc = gd.owner_ang_acc_slice();
            let voxel_id = gd.owner_voxel_id_slice();
            let sub_x = gd.owner_sub_x_slice();
            let sub_y = gd.owner_sub_y_slice();
            let sub_z = gd.owner_sub_z_slice();
            let q0 = gd.owner_ori_q0_slice();
            let q1 = gd.owner_ori_q1_slice();
            let q2 = gd.owner_ori_q2_slice();
            let q3 = gd.owner_ori_q3_slice();

            for i in 0..gd.n_owner_bodies {
                for c in 0..3 {
                    vel[i][c] += acc[i][c] * cfg.h;
                    ang_vel[i][c] += ang_acc[i][c] * cfg.h;
                }
                acc[i] = [0.0; 3];
                ang_acc[i] = [0.0; 3];

                let p = lattice.decode(voxel_id[i], sub_x[i], sub_y[i], sub_z[i]);
                let moved = [
                    p[0] + vel[i][0] * cfg.h,
                    p[1] + vel[i][1] * cfg.h,
                    p[2] + vel[i][2] * cfg.h,
                ];
                let (new_vid, nx, ny, nz) = lattice.encode(moved);
                voxel_id[i] = new_vid;
                sub_x[i] = nx;
                sub_y[i] = ny;
                sub_z[i] = nz;

                let q = Quaternion {
                    q0: q0[i],
                    q1: q1[i],
                    q2: q2[i],
                    q3: q3[i],
                };
                let updated = q.integrate(ang_vel[i], cfg.h);
                q0[i] = updated.q0;
                q1[i] = updated.q1;
                q2[i] = updated.q2;
                q3[i] = updated.q3;
            }
        }
        Ok(())
    }

    fn apply_family_changes(&self, _gd: &mut GranData<'_>) -> DemResult<()> {
        Ok(())
    }

    fn compute_ke(&self, gd: &GranData<'_>) -> DemResult<f64> {
        let mut ke = 0.0;
        unsafe {
            let vel = std::slice::from_raw_parts(gd.owner_vel, gd.n_owner_bodies);
            for v in vel {
                ke += 0.5 * (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]);
            }
        }
        Ok(ke)
    }
}

#[cfg(feature = "gpu")]
pub mod vulkan {
    //! Device-backed kernel group. Pins a `vulkano` device and queue the
    //! way a real compute-kernel host would, while delegating the actual
    //! math back to `HostKernelGroups` — generating and dispatching real
    //! compute shaders for this domain is out of scope.

    use std::sync::Arc;

    use dashmap::DashMap;
    use vulkano::device::{Device, Queue};

    use super::{HostKernelGroups, KernelGroups};
    use crate::arrays::GranData;
    use crate::config::Config;
    use crate::encoding::Lattice;
    use crate::error::{DemError, DemResult};

    /// Named compute-pipeline cache, mirroring the shape of a real
    /// pipeline-by-name lookup table even though no pipelines are compiled
    /// here yet.
    #[derive(Default)]
    pub struct PipelineCache {
        by_name: DashMap<&'static str, ()>,
    }

    impl PipelineCache {
        pub fn mark_loaded(&self, name: &'static str) {
            self.by_name.insert(name, ());
        }

        pub fn is_loaded(&self, name: &'static str) -> bool {
            self.by_name.contains_key(name)
        }
    }

    pub struct VulkanKernelGroups {
        device: Arc<Device>,
        queue: Arc<Queue>,
        pipelines: PipelineCache,
        host: HostKernelGroups,
    }

    impl VulkanKernelGroups {
        pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
            VulkanKernelGroups {
                device,
                queue,
                pipelines: PipelineCache::default(),
                host: HostKernelGroups,
            }
        }

        pub fn device(&self) -> &Arc<Device> {
            &self.device
        }

        pub fn queue(&self) -> &Arc<Queue> {
            &self.queue
        }
    }

    impl KernelGroups for VulkanKernelGroups {
        fn prepare_force_arrays(&self, gd: &mut GranData<'_>, cfg: &Config) -> DemResult<()> {
            self.pipelines.mark_loaded("prepare_force_arrays");
            self.host.prepare_force_arrays(gd, cfg)
        }

        fn mark_alive_contacts(&self, gd: &GranData<'_>, alive: &mut [bool]) -> DemResult<()> {
            self.host.mark_alive_contacts(gd, alive)
        }

        fn rearrange_contact_history(
            &self,
            gd: &mut GranData<'_>,
            mapping: &[u32],
        ) -> DemResult<()> {
            self.host.rearrange_contact_history(gd, mapping)
        }

        fn calculate_contact_forces(&self, gd: &mut GranData<'_>, cfg: &Config) -> DemResult<()> {
            if self.device.physical_device().properties().max_compute_work_group_count[0] == 0 {
                return Err(DemError::KernelFailed {
                    kernel: "calculate_contact_forces",
                    stamp: 0,
                    reason: "device reports no compute capability".into(),
                });
            }
            self.host.calculate_contact_forces(gd, cfg)
        }

        fn calculate_contact_forces_historyless(
            &self,
            gd: &mut GranData<'_>,
            cfg: &Config,
        ) -> DemResult<()> {
            self.host.calculate_contact_forces_historyless(gd, cfg)
        }

        fn collect_contact_forces(&self, gd: &mut GranData<'_>) -> DemResult<()> {
            self.host.collect_contact_forces(gd)
        }

        fn integrate_clumps(&self, gd: &mut GranData<'_>, cfg: &Config, lattice: &Lattice) -> DemResult<()> {
            self.host.integrate_clumps(gd, cfg, lattice)
        }

        fn apply_family_changes(&self, gd: &mut GranData<'_>) -> DemResult<()> {
            self.host.apply_family_changes(gd)
        }

        fn compute_ke(&self, gd: &GranData<'_>) -> DemResult<f64> {
            self.host.compute_ke(gd)
        }
    }
}
