//! The force/integration thread. Every pass
//! drains whatever contact list kT has made fresh (a no-op if none has
//! arrived yet, e.g. the very first cycle), runs the force and
//! integration kernels, publishes its own pose buffer so kT can start its
//! first broad-phase pass, then checks the drift gate before looping.

use std::sync::Arc;
use std::sync::OnceLock;

use crate::arrays::{ManagedArrays, TempVectorPool};
use crate::buffers::{ContactsBuffer, PositionsBuffer};
use crate::config::Config;
use crate::coordination::SchedSupport;
use crate::error::DemResult;
use crate::family::FamilyMap;
use crate::history;
use crate::kernels::KernelGroups;

// The history migrator needs a scratch pool; dT owns one instance for its
// whole lifetime rather than allocating per cycle, mirroring the
// once-initialized pipeline-cache pattern used elsewhere in this crate.
static TEMP_POOL_CELL: OnceLock<TempVectorPool> = OnceLock::new();

fn temp_pool() -> &'static TempVectorPool {
    TEMP_POOL_CELL.get_or_init(TempVectorPool::default)
}

pub struct DynamicWorker<K: KernelGroups> {
    pub arrays: ManagedArrays,
    pub kernels: K,
    pub config: Config,
    pub lattice: crate::encoding::Lattice,
    pub families: Arc<FamilyMap>,
    pub sched: Arc<SchedSupport>,
    pub inbound: Arc<std::sync::Mutex<ContactsBuffer>>,
    pub outbound: Arc<std::sync::Mutex<PositionsBuffer>>,
    time_elapsed: std::sync::Mutex<f64>,
}

impl<K: KernelGroups> DynamicWorker<K> {
    pub fn new(
        arrays: ManagedArrays,
        kernels: K,
        config: Config,
        lattice: crate::encoding::Lattice,
        families: Arc<FamilyMap>,
        sched: Arc<SchedSupport>,
        inbound: Arc<std::sync::Mutex<ContactsBuffer>>,
        outbound: Arc<std::sync::Mutex<PositionsBuffer>>,
    ) -> Self {
        DynamicWorker {
            arrays,
            kernels,
            config,
            lattice,
            families,
            sched,
            inbound,
            outbound,
            time_elapsed: std::sync::Mutex::new(0.0),
        }
    }

    pub fn time_elapsed(&self) -> f64 {
        *self.time_elapsed.lock().unwrap()
    }

    /// The body of the worker's OS thread: blocks on the start latch and
    /// runs `cycles_per_call()` cycles per wake until `should_join` is
    /// observed. The very first wake additionally runs `bootstrap()` before
    /// any cycle, so dT never advances its stamp before kT's first contact
    /// list has arrived.
    pub fn run(mut self) -> Self {
        let mut bootstrapped = false;
        loop {
            self.sched.dynamic_start.wait_for_start();
            if self.sched.dynamic_start.should_join() {
                break;
            }
            if !bootstrapped {
                self.bootstrap();
                bootstrapped = true;
            }
            for _ in 0..self.config.cycles_per_call() {
                if let Err(err) = self.run_one_cycle() {
                    tracing::error!(error = %err, "dynamic worker aborting cycle");
                    return self;
                }
            }
        }
        self
    }

    /// Publishes the initial pose so kT has something to broad-phase
    /// against, then blocks until kT's first contact list arrives. The
    /// only point dT ever waits on kT before its cycle loop starts; every
    /// later wait is the drift gate inside `run_one_cycle`.
    fn bootstrap(&mut self) {
        tracing::debug!("dynamic worker bootstrap: publishing initial positions");
        self.publish_outbound_positions();
        self.sched.dynamic_owned_prod2cons.wait_until_fresh();
        tracing::debug!("dynamic worker bootstrap: first contact list received");
    }

    /// One full cycle: drain inbound, force step, publish outbound,
    /// advance the stamp, then gate on drift.
    fn run_one_cycle(&mut self) -> DemResult<()> {
        let span = tracing::trace_span!("dynamic_cycle", stamp = self.sched.current_stamp());
        let _enter = span.enter();

        self.drain_inbound_contacts()?;

        self.kernels.prepare_force_arrays(&mut self.arrays.republish(), &self.config)?;
        if self.config.is_historyless {
            self.kernels
                .calculate_contact_forces_historyless(&mut self.arrays.republish(), &self.config)?;
        } else {
            self.kernels
                .calculate_contact_forces(&mut self.arrays.republish(), &self.config)?;
        }
        self.kernels.collect_contact_forces(&mut self.arrays.republish())?;
        self.kernels
            .integrate_clumps(&mut self.arrays.republish(), &self.config, &self.lattice)?;
        if self.config.can_family_change {
            self.kernels.apply_family_changes(&mut self.arrays.republish())?;
        }

        self.publish_outbound_positions();
        self.sched.advance_stamp();

        {
            let mut t = self.time_elapsed.lock().unwrap();
            *t += self.config.h;
        }

        if self.sched.dynamic_should_wait() {
            self.sched.stats.record_dynamic_held_back();
            tracing::debug!("dynamic worker waiting out kinematic drift gate");
            self.sched.dynamic_owned_prod2cons.wait_until_fresh();
        }

        Ok(())
    }

    /// Copies a freshly published contact list out of the shared inbound
    /// buffer under `dynamic_owned_buffer_lock`, grows the primary contact
    /// arrays to fit, migrates history under the mapping (unless
    /// historyless), and marks the stamp consumed.
    fn drain_inbound_contacts(&mut self) -> DemResult<()> {
        if !self.sched.dynamic_owned_prod2cons.is_fresh() {
            return Ok(());
        }
        let _buffer_guard = self.sched.dynamic_owned_buffer_lock.lock().unwrap();
        let (id_a, id_b, contact_type, mapping) = {
            let inbound = self.inbound.lock().unwrap();
            (
                inbound.id_a.clone(),
                inbound.id_b.clone(),
                inbound.contact_type.clone(),
                inbound.mapping.clone(),
            )
        };
        let old_len = self.arrays.contacts.len();
        let new_len = id_a.len();

        self.arrays.contacts.grow_to(new_len, &self.arrays.mem);
        self.arrays.contacts.id_a[..id_a.len()].copy_from_slice(&id_a);
        self.arrays.contacts.id_b[..id_b.len()].copy_from_slice(&id_b);
        self.arrays.contacts.contact_type[..contact_type.len()].copy_from_slice(&contact_type);

        if self.config.is_historyless {
            let mut alive = vec![false; new_len];
            self.kernels.mark_alive_contacts(&self.arrays.republish(), &mut alive)?;
            let n_alive = alive.iter().filter(|&&a| a).count();
            tracing::trace!(n_alive, n_contacts = new_len, "historyless run marked alive contacts");
        } else if let Some(mapping) = mapping {
            self.kernels
                .rearrange_contact_history(&mut self.arrays.republish(), &mapping)?;
            let report = history::migrate(
                &mut self.arrays.contacts,
                &mapping,
                old_len,
                temp_pool(),
                &self.arrays.mem,
                self.config.is_async,
                self.config.verbosity,
            );
            tracing::trace!(
                carried = report.n_carried_over,
                born = report.n_newly_born,
                lost = report.n_lost,
                "contact history migrated"
            );
        }

        self.arrays.validate_contact_owner_refs()?;
        self.sched.dynamic_owned_prod2cons.clear();
        self.sched.mark_stamp_consumed();
        Ok(())
    }

    /// Overwrites the shared outbound pose buffer and publishes it, unless
    /// kT hasn't yet consumed the payload from the previous publish — in
    /// which case this is a no-op rather than clobbering unconsumed data.
    fn publish_outbound_positions(&self) {
        if self.sched.kinematic_owned_cons2prod.is_fresh() {
            return;
        }
        let _buffer_guard = self.sched.kinematic_owned_buffer_lock.lock().unwrap();
        let owners = &self.arrays.owners;
        let family = self.config.can_family_change.then(|| owners.family.as_slice());
        let mut outbound = self.outbound.lock().unwrap();
        outbound.write_from(
            &owners.voxel_id,
            &owners.sub_x,
            &owners.sub_y,
            &owners.sub_z,
            &owners.ori_q0,
            &owners.ori_q1,
            &owners.ori_q2,
            &owners.ori_q3,
            family,
        );
        drop(outbound);
        self.sched.kinematic_owned_cons2prod.publish();
        self.sched.stats.record_kinematic_update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::OwnerKind;
    use crate::encoding::Lattice;
    use crate::kernels::HostKernelGroups;

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

    fn make_worker() -> DynamicWorker<HostKernelGroups> {
        let mut arrays = ManagedArrays::default();
        arrays.owners.append_batch(OwnerKind::Clump, &[0, 0]);
        DynamicWorker::new(
            arrays,
            HostKernelGroups,
            Config::default(),
            test_lattice(),
            Arc::new(FamilyMap::new()),
            Arc::new(SchedSupport::new(4)),
            Arc::new(std::sync::Mutex::new(ContactsBuffer::default())),
            Arc::new(std::sync::Mutex::new(PositionsBuffer::default())),
        )
    }

    #[test]
    fn drain_inbound_is_noop_when_nothing_fresh() {
        let mut worker = make_worker();
        worker.drain_inbound_contacts().unwrap();
        assert_eq!(worker.arrays.contacts.len(), 0);
    }

    #[test]
    fn drain_inbound_grows_and_clears_freshness() {
        let mut worker = make_worker();
        {
            let mut inbound = worker.inbound.lock().unwrap();
            inbound.publish(&[0], &[1], &[crate::arrays::ContactType::SphereSphere], None);
        }
        worker.sched.dynamic_owned_prod2cons.publish();
        worker.drain_inbound_contacts().unwrap();
        assert_eq!(worker.arrays.contacts.len(), 1);
        assert!(!worker.sched.dynamic_owned_prod2cons.is_fresh());
    }

    #[test]
    fn one_cycle_publishes_outbound_and_advances_stamp() {
        let worker = make_worker();
        let mut worker = worker;
        worker.run_one_cycle().unwrap();
        assert_eq!(worker.sched.current_stamp(), 1);
        assert!(worker.sched.kinematic_owned_cons2prod.is_fresh());
    }

    #[test]
    fn bootstrap_blocks_until_first_contact_list_published() {
        let worker = make_worker();
        let sched = worker.sched.clone();
        let handle = std::thread::spawn(move || {
            let mut worker = worker;
            worker.bootstrap();
            worker
        });

        // The bootstrap thread has nothing to proceed past until we publish;
        // give it time to reach the wait and confirm it hasn't advanced the
        // stamp on its own.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(sched.current_stamp(), 0, "bootstrap must not advance the stamp by itself");
        assert!(sched.kinematic_owned_cons2prod.is_fresh(), "bootstrap should have published the initial pose");

        sched.dynamic_owned_prod2cons.publish();
        let worker = handle.join().unwrap();
        assert_eq!(worker.sched.current_stamp(), 0, "bootstrap itself never runs an integration cycle");
    }

    #[test]
    fn publish_outbound_positions_does_not_clobber_unconsumed_payload() {
        let worker = make_worker();
        worker.publish_outbound_positions();
        assert!(worker.sched.kinematic_owned_cons2prod.is_fresh());
        let updates_after_first = worker.sched.stats.n_kinematic_updates();

        // kT hasn't consumed the first publish yet, so a second call must
        // be a no-op: no second write, no second counter increment.
        worker.publish_outbound_positions();
        assert_eq!(worker.sched.stats.n_kinematic_updates(), updates_after_first);

        worker.sched.kinematic_owned_cons2prod.clear();
        worker.publish_outbound_positions();
        assert_eq!(worker.sched.stats.n_kinematic_updates(), updates_after_first + 1);
    }
}
