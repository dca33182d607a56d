//! Column-oriented owner/sphere/template/contact storage, plus the
//! resize-with-republish pointer bundle (`GranData`) and the per-worker
//! temp-vector pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{DemError, DemResult, OwnerId};
use crate::family::FamilyTag;

pub const NULL_MAPPING: u32 = u32::MAX;

/// The only polymorphism the core needs: tracked-object kind. Owners are
/// stored in one flat array, partitioned `Clump | Analytical | Mesh`; this
/// tag records which partition an owner index falls into without any
/// dynamic dispatch or inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Clump,
    Analytical,
    Mesh,
}

impl OwnerKind {
    pub fn from_tag(tag: u8) -> DemResult<OwnerKind> {
        match tag {
            0 => Ok(OwnerKind::Clump),
            1 => Ok(OwnerKind::Analytical),
            2 => Ok(OwnerKind::Mesh),
            other => Err(DemError::UnknownObjectType { tag: other }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactType {
    SphereSphere,
    SphereAnalytical,
    SphereMesh,
}

/// Tracks declared byte-size of every array under its watch, for the
/// memory-accounting report (`estimate_mem_usage`).
#[derive(Debug, Default)]
pub struct MemTracker {
    bytes: AtomicUsize,
}

impl MemTracker {
    pub fn add(&self, delta: i64) {
        if delta >= 0 {
            self.bytes.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            self.bytes.fetch_sub((-delta) as usize, Ordering::Relaxed);
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}

fn tracked_resize<T: Clone + Default>(vec: &mut Vec<T>, new_len: usize, tracker: &MemTracker) {
    let before = vec.len() * std::mem::size_of::<T>();
    vec.resize(new_len, T::default());
    let after = vec.len() * std::mem::size_of::<T>();
    tracker.add(after as i64 - before as i64);
}

/// Column-oriented owner (rigid body) storage. One entry per clump,
/// analytical object, or mesh entity, in that fixed partition order.
#[derive(Default)]
pub struct OwnerArrays {
    pub voxel_id: Vec<u64>,
    pub sub_x: Vec<u32>,
    pub sub_y: Vec<u32>,
    pub sub_z: Vec<u32>,
    pub ori_q0: Vec<f64>,
    pub ori_q1: Vec<f64>,
    pub ori_q2: Vec<f64>,
    pub ori_q3: Vec<f64>,
    pub vel: Vec<[f64; 3]>,
    pub ang_vel: Vec<[f64; 3]>,
    pub acc: Vec<[f64; 3]>,
    pub ang_acc: Vec<[f64; 3]>,
    pub family: Vec<FamilyTag>,
    pub inertia_offset: Vec<u32>,
    pub kind: Vec<OwnerKind>,
}

impl OwnerArrays {
    pub fn len(&self) -> usize {
        self.voxel_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_one(&mut self, kind: OwnerKind, inertia_offset: u32) {
        self.voxel_id.push(0);
        self.sub_x.push(0);
        self.sub_y.push(0);
        self.sub_z.push(0);
        self.ori_q0.push(1.0);
        self.ori_q1.push(0.0);
        self.ori_q2.push(0.0);
        self.ori_q3.push(0.0);
        self.vel.push([0.0; 3]);
        self.ang_vel.push([0.0; 3]);
        self.acc.push([0.0; 3]);
        self.ang_acc.push([0.0; 3]);
        self.family.push(0);
        self.inertia_offset.push(inertia_offset);
        self.kind.push(kind);
    }

    /// Appends `count` owners of `kind`, returning the prefix-sum base ID
    /// the caller should offset its batch handles by.
    pub fn append_batch(&mut self, kind: OwnerKind, inertia_offsets: &[u32]) -> OwnerId {
        let base = self.len() as OwnerId;
        for &off in inertia_offsets {
            self.push_one(kind, off);
        }
        base
    }
}

/// One entry per sphere-shaped component of a clump.
#[derive(Default)]
pub struct SphereArrays {
    pub owner_id: Vec<u32>,
    /// Narrow template index; `None` ("jitified" sentinel) iff the true
    /// index exceeds the jitifiable range and `component_offset_ext` must
    /// be consulted instead.
    pub component_offset: Vec<Option<u8>>,
    pub component_offset_ext: Vec<u32>,
    pub material_offset: Vec<u16>,
}

impl SphereArrays {
    pub const JITIFIABLE_LIMIT: u32 = 254;

    pub fn push(&mut self, owner_id: u32, template_idx: u32, material_offset: u16) {
        self.owner_id.push(owner_id);
        self.component_offset.push(if template_idx <= Self::JITIFIABLE_LIMIT {
            Some(template_idx as u8)
        } else {
            None
        });
        self.component_offset_ext.push(template_idx);
        self.material_offset.push(material_offset);
    }

    pub fn len(&self) -> usize {
        self.owner_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the true template index for sphere `i`, always using the
    /// full-width `_ext` variant (the narrow offset may carry a sentinel).
    pub fn template_index(&self, i: usize) -> u32 {
        self.component_offset_ext[i]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaterialProps {
    pub young_modulus: f64,
    pub poisson_ratio: f64,
    pub restitution: f64,
    pub friction: f64,
    pub rolling_resistance: f64,
}

/// Small tables shared by many owners/spheres.
#[derive(Default)]
pub struct TemplateArrays {
    pub mass: Vec<f64>,
    pub moi: Vec<[f64; 3]>,
    pub radius: Vec<f64>,
    pub rel_pos: Vec<[f64; 3]>,
    pub material: Vec<MaterialProps>,
}

impl TemplateArrays {
    pub fn push_clump_template(&mut self, mass: f64, moi: [f64; 3]) -> u32 {
        let idx = self.mass.len() as u32;
        self.mass.push(mass);
        self.moi.push(moi);
        idx
    }

    pub fn push_sphere_template(&mut self, radius: f64, rel_pos: [f64; 3], material: MaterialProps) -> u32 {
        let idx = self.radius.len() as u32;
        self.radius.push(radius);
        self.rel_pos.push(rel_pos);
        self.material.push(material);
        idx
    }
}

/// Per-contact event arrays, sized to the current pair count `N_c`.
/// Holds only the *primary* (dT-consumed) arrays; the producer-written
/// shadow copies live in `buffers.rs` and are copied in under lock.
#[derive(Default)]
pub struct ContactArrays {
    pub id_a: Vec<u32>,
    pub id_b: Vec<u32>,
    pub contact_type: Vec<ContactType>,
    pub point_a: Vec<[f64; 3]>,
    pub point_b: Vec<[f64; 3]>,
    pub normal_force: Vec<[f64; 3]>,
    pub tangential_force: Vec<[f64; 3]>,
    pub torque: Vec<[f64; 3]>,
    pub history: Vec<[f64; 3]>,
    pub duration: Vec<f64>,
}

impl ContactArrays {
    pub fn len(&self) -> usize {
        self.id_a.len()
    }

    pub fn capacity_entries(&self) -> usize {
        self.id_a.capacity()
    }

    /// Grows the per-contact arrays to at least `n`, never shrinking.
    /// Newly added slots default to zeroed force/history state;
    /// `id_a`/`id_b`/`contact_type` are overwritten wholesale by the
    /// caller right after resizing.
    pub fn grow_to(&mut self, n: usize, tracker: &MemTracker) {
        if n <= self.len() {
            return;
        }
        tracked_resize(&mut self.id_a, n, tracker);
        tracked_resize(&mut self.id_b, n, tracker);
        self.contact_type.resize(n, ContactType::SphereSphere);
        tracked_resize(&mut self.point_a, n, tracker);
        tracked_resize(&mut self.point_b, n, tracker);
        tracked_resize(&mut self.normal_force, n, tracker);
        tracked_resize(&mut self.tangential_force, n, tracker);
        tracked_resize(&mut self.torque, n, tracker);
        tracked_resize(&mut self.history, n, tracker);
        tracked_resize(&mut self.duration, n, tracker);
    }

    pub fn clear_forces(&mut self) {
        for f in &mut self.normal_force {
            *f = [0.0; 3];
        }
        for f in &mut self.tangential_force {
            *f = [0.0; 3];
        }
        for t in &mut self.torque {
            *t = [0.0; 3];
        }
    }
}

/// One scratch slot in the temp-vector pool.
#[derive(Default)]
struct TempSlot {
    bytes: Vec<u8>,
}

/// Generation-stable scratch buffer pool, indexed 0..6. Slots 0/1 are
/// reserved for a worker's hot-path bookkeeping (dT uses slot 1 for the
/// unpacked contact mapping); the history migrator uses 2..6 exclusively.
/// One pool per worker — never shared across threads.
pub struct TempVectorPool {
    slots: [Mutex<TempSlot>; 6],
}

impl Default for TempVectorPool {
    fn default() -> Self {
        TempVectorPool {
            slots: Default::default(),
        }
    }
}

impl TempVectorPool {
    pub const HOT_SLOTS: std::ops::Range<usize> = 0..2;
    pub const MIGRATOR_SLOTS: std::ops::Range<usize> = 2..6;

    /// Ensures slot `index` holds at least `bytes` capacity and returns a
    /// copy of its current contents length in bytes (call `write`/`read`
    /// helpers below to access typed views).
    pub fn ensure_capacity(&self, index: usize, bytes: usize) {
        let mut slot = self.slots[index].lock().unwrap();
        if slot.bytes.len() < bytes {
            slot.bytes.resize(bytes, 0);
        }
    }

    pub fn write_u32(&self, index: usize, values: &[u32]) {
        self.ensure_capacity(index, values.len() * 4);
        let mut slot = self.slots[index].lock().unwrap();
        slot.bytes.clear();
        slot.bytes.extend_from_slice(bytemuck::cast_slice(values));
    }

    pub fn read_u32(&self, index: usize, count: usize) -> Vec<u32> {
        let slot = self.slots[index].lock().unwrap();
        bytemuck::pod_collect_to_vec(&slot.bytes[..count * 4])
    }

    /// Flattens to a plain `f64` run before casting, since `[f64; 3]` isn't
    /// `Pod` on its own and the pool only ever needs a byte-exact round trip.
    pub fn write_f64x3(&self, index: usize, values: &[[f64; 3]]) {
        self.ensure_capacity(index, values.len() * 24);
        let mut slot = self.slots[index].lock().unwrap();
        slot.bytes.clear();
        let flat: Vec<f64> = values.iter().flatten().copied().collect();
        slot.bytes.extend_from_slice(bytemuck::cast_slice(&flat));
    }

    pub fn read_f64x3(&self, index: usize, count: usize) -> Vec<[f64; 3]> {
        let slot = self.slots[index].lock().unwrap();
        let flat: Vec<f64> = bytemuck::pod_collect_to_vec(&slot.bytes[..count * 24]);
        flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
    }

    pub fn write_f64(&self, index: usize, values: &[f64]) {
        self.ensure_capacity(index, values.len() * 8);
        let mut slot = self.slots[index].lock().unwrap();
        slot.bytes.clear();
        slot.bytes.extend_from_slice(bytemuck::cast_slice(values));
    }

    pub fn read_f64(&self, index: usize, count: usize) -> Vec<f64> {
        let slot = self.slots[index].lock().unwrap();
        bytemuck::pod_collect_to_vec(&slot.bytes[..count * 8])
    }

    pub fn write_bool(&self, index: usize, values: &[bool]) {
        self.ensure_capacity(index, values.len());
        let mut slot = self.slots[index].lock().unwrap();
        slot.bytes.clear();
        slot.bytes.extend(values.iter().map(|&b| b as u8));
    }

    pub fn read_bool(&self, index: usize, count: usize) -> Vec<bool> {
        let slot = self.slots[index].lock().unwrap();
        slot.bytes[..count].iter().map(|&b| b != 0).collect()
    }
}

/// Raw pointer bundle published to the kernel interface. Rebuilt by
/// `ManagedArrays::republish` every time an array it covers may have
/// reallocated; a `GranData` built
/// before such a reallocation must never be dereferenced afterwards.
///
/// All pointers alias into `ManagedArrays`-owned `Vec`s and are valid only
/// for the lifetime of the borrow that produced them — `republish` takes
/// `&mut ManagedArrays` precisely so the borrow checker ties a `GranData`'s
/// lifetime to the arrays it points into.
pub struct GranData<'a> {
    pub owner_voxel_id: *mut u64,
    pub owner_sub_x: *mut u32,
    pub owner_sub_y: *mut u32,
    pub owner_sub_z: *mut u32,
    pub owner_ori_q0: *mut f64,
    pub owner_ori_q1: *mut f64,
    pub owner_ori_q2: *mut f64,
    pub owner_ori_q3: *mut f64,
    pub owner_vel: *mut [f64; 3],
    pub owner_ang_vel: *mut [f64; 3],
    pub owner_acc: *mut [f64; 3],
    pub owner_ang_acc: *mut [f64; 3],
    pub owner_family: *mut FamilyTag,
    pub n_owner_bodies: usize,

    pub contact_id_a: *mut u32,
    pub contact_id_b: *mut u32,
    pub contact_point_a: *mut [f64; 3],
    pub contact_point_b: *mut [f64; 3],
    pub contact_normal_force: *mut [f64; 3],
    pub contact_tangential_force: *mut [f64; 3],
    pub contact_torque: *mut [f64; 3],
    pub contact_history: *mut [f64; 3],
    pub contact_duration: *mut f64,
    pub n_contacts: usize,

    _owner_lifetime: std::marker::PhantomData<&'a mut ()>,
}

impl GranData<'_> {
    /// # Safety
    /// The caller must ensure `n_owner_bodies` / `n_contacts` elements are
    /// valid starting at each respective pointer, and that no other
    /// `GranData` derived from the same `ManagedArrays` is used
    /// concurrently (the arrays are single-writer, single-reader by
    /// design).
    pub unsafe fn owner_vel_slice(&self) -> &mut [[f64; 3]] {
        std::slice::from_raw_parts_mut(self.owner_vel, self.n_owner_bodies)
    }

    pub unsafe fn owner_voxel_id_slice(&self) -> &mut [u64] {
        std::slice::from_raw_parts_mut(self.owner_voxel_id, self.n_owner_bodies)
    }

    pub unsafe fn owner_sub_x_slice(&self) -> &mut [u32] {
        std::slice::from_raw_parts_mut(self.owner_sub_x, self.n_owner_bodies)
    }

    pub unsafe fn owner_sub_y_slice(&self) -> &mut [u32] {
        std::slice::from_raw_parts_mut(self.owner_sub_y, self.n_owner_bodies)
    }

    pub unsafe fn owner_sub_z_slice(&self) -> &mut [u32] {
        std::slice::from_raw_parts_mut(self.owner_sub_z, self.n_owner_bodies)
    }

    pub unsafe fn owner_ori_q0_slice(&self) -> &mut [f64] {
        std::slice::from_raw_parts_mut(self.owner_ori_q0, self.n_owner_bodies)
    }

    pub unsafe fn owner_ori_q1_slice(&self) -> &mut [f64] {
        std::slice::from_raw_parts_mut(self.owner_ori_q1, self.n_owner_bodies)
    }

    pub unsafe fn owner_ori_q2_slice(&self) -> &mut [f64] {
        std::slice::from_raw_parts_mut(self.owner_ori_q2, self.n_owner_bodies)
    }

    pub unsafe fn owner_ori_q3_slice(&self) -> &mut [f64] {
        std::slice::from_raw_parts_mut(self.owner_ori_q3, self.n_owner_bodies)
    }

    pub unsafe fn owner_acc_slice(&self) -> &mut [[f64; 3]] {
        std::slice::from_raw_parts_mut(self.owner_acc, self.n_owner_bodies)
    }

    pub unsafe fn owner_ang_acc_slice(&self) -> &mut [[f64; 3]] {
        std::slice::from_raw_parts_mut(self.owner_ang_acc, self.n_owner_bodies)
    }

    pub unsafe fn owner_ang_vel_slice(&self) -> &mut [[f64; 3]] {
        std::slice::from_raw_parts_mut(self.owner_ang_vel, self.n_owner_bodies)
    }

    pub unsafe fn contact_normal_force_slice(&self) -> &mut [[f64; 3]] {
        std::slice::from_raw_parts_mut(self.contact_normal_force, self.n_contacts)
    }

    pub unsafe fn contact_tangential_force_slice(&self) -> &mut [[f64; 3]] {
        std::slice::from_raw_parts_mut(self.contact_tangential_force, self.n_contacts)
    }

    pub unsafe fn contact_id_a_slice(&self) -> &[u32] {
        std::slice::from_raw_parts(self.contact_id_a, self.n_contacts)
    }

    pub unsafe fn contact_id_b_slice(&self) -> &[u32] {
        std::slice::from_raw_parts(self.contact_id_b, self.n_contacts)
    }

    pub unsafe fn contact_point_a_slice(&self) -> &[[f64; 3]] {
        std::slice::from_raw_parts(self.contact_point_a, self.n_contacts)
    }

    pub unsafe fn contact_point_b_slice(&self) -> &[[f64; 3]] {
        std::slice::from_raw_parts(self.contact_point_b, self.n_contacts)
    }
}

/// Owns every array covered by the pointer bundle, plus its memory tracker.
#[derive(Default)]
pub struct ManagedArrays {
    pub owners: OwnerArrays,
    pub spheres: SphereArrays,
    pub templates: TemplateArrays,
    pub contacts: ContactArrays,
    pub mem: MemTracker,
}

impl ManagedArrays {
    /// Rebuilds the pointer bundle from current array state. Must be
    /// called again after any resize of a covered array.
    pub fn republish(&mut self) -> GranData<'_> {
        let n_owner_bodies = self.owners.len();
        let n_contacts = self.contacts.len();
        GranData {
            owner_voxel_id: self.owners.voxel_id.as_mut_ptr(),
            owner_sub_x: self.owners.sub_x.as_mut_ptr(),
            owner_sub_y: self.owners.sub_y.as_mut_ptr(),
            owner_sub_z: self.owners.sub_z.as_mut_ptr(),
            owner_ori_q0: self.owners.ori_q0.as_mut_ptr(),
            owner_ori_q1: self.owners.ori_q1.as_mut_ptr(),
            owner_ori_q2: self.owners.ori_q2.as_mut_ptr(),
            owner_ori_q3: self.owners.ori_q3.as_mut_ptr(),
            owner_vel: self.owners.vel.as_mut_ptr(),
            owner_ang_vel: self.owners.ang_vel.as_mut_ptr(),
            owner_acc: self.owners.acc.as_mut_ptr(),
            owner_ang_acc: self.owners.ang_acc.as_mut_ptr(),
            owner_family: self.owners.family.as_mut_ptr(),
            n_owner_bodies,
            contact_id_a: self.contacts.id_a.as_mut_ptr(),
            contact_id_b: self.contacts.id_b.as_mut_ptr(),
            contact_point_a: self.contacts.point_a.as_mut_ptr(),
            contact_point_b: self.contacts.point_b.as_mut_ptr(),
            contact_normal_force: self.contacts.normal_force.as_mut_ptr(),
            contact_tangential_force: self.contacts.tangential_force.as_mut_ptr(),
            contact_torque: self.contacts.torque.as_mut_ptr(),
            contact_history: self.contacts.history.as_mut_ptr(),
            contact_duration: self.contacts.duration.as_mut_ptr(),
            n_contacts,
            _owner_lifetime: std::marker::PhantomData,
        }
    }

    /// Memory-accounting report (ambient, C2): sum of tracked byte-sizes.
    pub fn estimate_mem_usage(&self) -> usize {
        self.mem.total_bytes()
    }

    pub fn validate_contact_owner_refs(&self) -> DemResult<()> {
        let n_owners = self.owners.len() as u32;
        for (i, (&a, &b)) in self
            .contacts
            .id_a
            .iter()
            .zip(self.contacts.id_b.iter())
            .enumerate()
        {
            if a >= n_owners {
                return Err(DemError::OwnerOutOfRange {
                    contact: i as u32,
                    owner: a,
                    n_owners,
                });
            }
            if b >= n_owners {
                return Err(DemError::OwnerOutOfRange {
                    contact: i as u32,
                    owner: b,
                    n_owners,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_batch_returns_prefix_sum_base() {
        let mut owners = OwnerArrays::default();
        let base1 = owners.append_batch(OwnerKind::Clump, &[0, 0, 1]);
        let base2 = owners.append_batch(OwnerKind::Analytical, &[2]);
        assert_eq!(base1, 0);
        assert_eq!(base2, 3);
        assert_eq!(owners.len(), 4);
    }

    #[test]
    fn sphere_offset_ext_always_carries_true_index() {
        let mut spheres = SphereArrays::default();
        spheres.push(0, 10, 0);
        spheres.push(0, 9000, 0);
        assert_eq!(spheres.component_offset[0], Some(10));
        assert_eq!(spheres.template_index(0), 10);
        assert_eq!(spheres.component_offset[1], None);
        assert_eq!(spheres.template_index(1), 9000);
    }

    #[test]
    fn contact_arrays_never_shrink() {
        let tracker = MemTracker::default();
        let mut contacts = ContactArrays::default();
        contacts.grow_to(5, &tracker);
        assert_eq!(contacts.len(), 5);
        contacts.grow_to(2, &tracker);
        assert_eq!(contacts.len(), 5);
    }

    #[test]
    fn republish_reflects_current_lengths() {
        let mut arrays = ManagedArrays::default();
        arrays.owners.append_batch(OwnerKind::Clump, &[0, 0]);
        arrays.contacts.grow_to(3, &arrays.mem);
        let gd = arrays.republish();
        assert_eq!(gd.n_owner_bodies, 2);
        assert_eq!(gd.n_contacts, 3);
    }

    #[test]
    fn temp_vector_pool_round_trips_mapping() {
        let pool = TempVectorPool::default();
        let mapping = vec![0u32, NULL_MAPPING, 1u32];
        pool.write_u32(1, &mapping);
        assert_eq!(pool.read_u32(1, mapping.len()), mapping);
    }
}
