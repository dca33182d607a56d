//! The single public entry point a host program drives. Owns both worker
//! structs before their threads are spawned, launches them once, and
//! exposes `do_dynamics()` as the only per-call API a user needs.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::arrays::{ManagedArrays, MaterialProps, OwnerKind};
use crate::buffers::{ContactsBuffer, PositionsBuffer};
use crate::config::Config;
use crate::coordination::SchedSupport;
use crate::dynamic_worker::DynamicWorker;
use crate::encoding::Lattice;
use crate::error::{DemError, DemResult};
use crate::family::FamilyMap;
use crate::kernels::KernelGroups;
use crate::kinematic_worker::KinematicWorker;

/// One clump template: body-frame sphere geometry plus mass/inertia,
/// registered once at load time before any owner references it.
pub struct ClumpTemplate {
    pub mass: f64,
    pub moi: [f64; 3],
    pub sphere_rel_pos: Vec<[f64; 3]>,
    pub sphere_radius: Vec<f64>,
    pub sphere_material: Vec<MaterialProps>,
}

/// A single clump instance to place in the world at load time.
pub struct ClumpInstance {
    pub template: usize,
    pub position: [f64; 3],
    pub family: u32,
}

pub struct DemSystem<K: KernelGroups> {
    config: Config,
    lattice: Lattice,
    families: Arc<FamilyMap>,
    sched: Arc<SchedSupport>,
    dt_to_kt: Arc<Mutex<PositionsBuffer>>,
    kt_to_dt: Arc<Mutex<ContactsBuffer>>,
    /// Bounding-sphere radius per owner, cached at load time so the output
    /// writer has something to report after the arrays move into dT's
    /// thread.
    owner_radius: Vec<f64>,
    dynamic: Option<DynamicWorker<K>>,
    kinematic: Option<KinematicWorker>,
    dynamic_handle: Option<JoinHandle<DynamicWorker<K>>>,
    kinematic_handle: Option<JoinHandle<KinematicWorker>>,
}

impl<K: KernelGroups + 'static> DemSystem<K> {
    /// Allocates owner/sphere/template arrays for every clump instance, in
    /// clump -> analytical -> mesh partition order (only clumps are
    /// supported by this loader today).
    pub fn new(
        config: Config,
        lattice: Lattice,
        kernels: K,
        templates: &[ClumpTemplate],
        instances: &[ClumpInstance],
    ) -> DemResult<Self> {
        config.validate()?;

        let families = Arc::new(FamilyMap::new());
        let mut arrays = ManagedArrays::default();

        let mut clump_template_idx = Vec::with_capacity(templates.len());
        let mut sphere_template_idx: Vec<Vec<u32>> = Vec::with_capacity(templates.len());
        for t in templates {
            clump_template_idx.push(arrays.templates.push_clump_template(t.mass, t.moi));
            let mut indices = Vec::with_capacity(t.sphere_rel_pos.len());
            for ((&rel, &radius), &material) in
                t.sphere_rel_pos.iter().zip(t.sphere_radius.iter()).zip(t.sphere_material.iter())
            {
                indices.push(arrays.templates.push_sphere_template(radius, rel, material));
            }
            sphere_template_idx.push(indices);
        }

        let inertia_offsets: Vec<u32> = instances
            .iter()
            .map(|inst| clump_template_idx[inst.template])
            .collect();
        let base = arrays.owners.append_batch(OwnerKind::Clump, &inertia_offsets);

        let mut sphere_owner = Vec::new();
        let mut sphere_radius = Vec::new();
        let mut sphere_rel_pos = Vec::new();
        let mut owner_radius = vec![0.0f64; instances.len()];

        for (i, inst) in instances.iter().enumerate() {
            let owner_id = base + i as u32;
            let tag = families.resolve_or_default(inst.family);
            arrays.owners.family[owner_id as usize] = tag;
            let (vid, sx, sy, sz) = lattice.encode(inst.position);
            arrays.owners.voxel_id[owner_id as usize] = vid;
            arrays.owners.sub_x[owner_id as usize] = sx;
            arrays.owners.sub_y[owner_id as usize] = sy;
            arrays.owners.sub_z[owner_id as usize] = sz;

            let t = &templates[inst.template];
            for (&sphere_idx, (rel, radius)) in sphere_template_idx[inst.template]
                .iter()
                .zip(t.sphere_rel_pos.iter().zip(t.sphere_radius.iter()))
            {
                arrays.spheres.push(owner_id, sphere_idx, 0);
                sphere_owner.push(owner_id);
                sphere_radius.push(*radius);
                sphere_rel_pos.push(*rel);
                owner_radius[i] = owner_radius[i].max(*radius);
            }
        }

        let sched = Arc::new(SchedSupport::new(config.update_threshold));
        let dt_to_kt = Arc::new(Mutex::new(PositionsBuffer::default()));
        let kt_to_dt = Arc::new(Mutex::new(ContactsBuffer::default()));

        let dynamic = DynamicWorker::new(
            arrays,
            kernels,
            config.clone(),
            lattice,
            families.clone(),
            sched.clone(),
            kt_to_dt.clone(),
            dt_to_kt.clone(),
        );
        let kinematic = KinematicWorker::new(
            lattice,
            config.clone(),
            families.clone(),
            sched.clone(),
            dt_to_kt.clone(),
            kt_to_dt.clone(),
            sphere_owner,
            sphere_radius,
            sphere_rel_pos,
        );

        Ok(DemSystem {
            config,
            lattice,
            families,
            sched,
            dt_to_kt,
            kt_to_dt,
            owner_radius,
            dynamic: Some(dynamic),
            kinematic: Some(kinematic),
            dynamic_handle: None,
            kinematic_handle: None,
        })
    }

    pub fn families(&self) -> &Arc<FamilyMap> {
        &self.families
    }

    pub fn lattice(&self) -> Lattice {
        self.lattice
    }

    pub fn owner_radius(&self) -> &[f64] {
        &self.owner_radius
    }

    /// Copies out the latest pose buffer dT has published for kT, for use
    /// by an output writer running on the façade's own thread.
    pub fn positions_snapshot(&self) -> PositionsBuffer {
        let buf = self.dt_to_kt.lock().unwrap();
        let mut out = PositionsBuffer::default();
        out.write_from(
            &buf.voxel_id,
            &buf.sub_x,
            &buf.sub_y,
            &buf.sub_z,
            &buf.ori_q0,
            &buf.ori_q1,
            &buf.ori_q2,
            &buf.ori_q3,
            buf.family.as_deref(),
        );
        out
    }

    /// Spawns both worker threads. They immediately block on their start
    /// latches until the first `do_dynamics()` call.
    pub fn launch(&mut self) -> DemResult<()> {
        let span = tracing::info_span!("dem_system_launch");
        let _enter = span.enter();

        let dynamic = self
            .dynamic
            .take()
            .ok_or(DemError::WorkerTerminated("dynamic"))?;
        let kinematic = self
            .kinematic
            .take()
            .ok_or(DemError::WorkerTerminated("kinematic"))?;

        self.dynamic_handle = Some(
            std::thread::Builder::new()
                .name("dem-dynamic".into())
                .spawn(move || dynamic.run())
                .map_err(|e| DemError::InvalidConfig(e.to_string()))?,
        );
        self.kinematic_handle = Some(
            std::thread::Builder::new()
                .name("dem-kinematic".into())
                .spawn(move || kinematic.run())
                .map_err(|e| DemError::InvalidConfig(e.to_string()))?,
        );
        tracing::info!("dynamic and kinematic workers launched");
        Ok(())
    }

    /// Advances the simulation by one `cycle_duration` worth of dT cycles.
    /// Blocking: returns once dT has completed its whole batch of cycles
    /// for this call. Both start latches are pulsed exactly once; each
    /// worker's own `run()` loop then runs `cycles_per_call()` passes
    /// before going idle again, so kT is woken at the same cadence as dT
    /// rather than re-pulsed every single dT cycle.
    pub fn do_dynamics(&self) -> DemResult<()> {
        if self.dynamic_handle.is_none() {
            return Err(DemError::WorkerTerminated("dynamic"));
        }
        let n_cycles = self.config.cycles_per_call();
        tracing::trace!(n_cycles, "do_dynamics requested");
        let target = self.sched.current_stamp() + n_cycles;
        self.sched.kinematic_start.start();
        self.sched.dynamic_start.start();
        while self.sched.current_stamp() < target {
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Current dT stamp, exposed for tests that need to observe scheduling
    /// progress without a public handle into `coordination`.
    pub fn current_stamp(&self) -> u64 {
        self.sched.current_stamp()
    }

    /// Requests both workers join after their current cycle, then blocks
    /// until both threads have returned.
    pub fn shutdown(mut self) -> DemResult<()> {
        self.sched.request_join_both();
        if let Some(h) = self.dynamic_handle.take() {
            h.join().map_err(|_| DemError::WorkerTerminated("dynamic"))?;
        }
        if let Some(h) = self.kinematic_handle.take() {
            h.join().map_err(|_| DemError::WorkerTerminated("kinematic"))?;
        }
        Ok(())
    }

    pub fn stats(&self) -> &crate::coordination::SchedulingStats {
        &self.sched.stats
    }
}
