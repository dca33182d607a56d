//! The double-buffered shadow copies exchanged between kT and dT. Each
//! direction has exactly one producer and one owner; access is always
//! taken under the matching `SchedSupport` lock and the matching
//! `FreshnessGate` governs visibility.

use crate::arrays::{ContactType, NULL_MAPPING};
use crate::family::FamilyTag;

/// dT -> kT: a shadow copy of owner pose (and optionally family), written
/// by dT under `kinematic_owned_buffer_lock`, consumed by kT.
#[derive(Default)]
pub struct PositionsBuffer {
    pub voxel_id: Vec<u64>,
    pub sub_x: Vec<u32>,
    pub sub_y: Vec<u32>,
    pub sub_z: Vec<u32>,
    pub ori_q0: Vec<f64>,
    pub ori_q1: Vec<f64>,
    pub ori_q2: Vec<f64>,
    pub ori_q3: Vec<f64>,
    pub family: Option<Vec<FamilyTag>>,
}

impl PositionsBuffer {
    /// Overwrites this buffer from the owning arrays. Caller must already
    /// hold `kinematic_owned_buffer_lock`.
    pub fn write_from(
        &mut self,
        voxel_id: &[u64],
        sub_x: &[u32],
        sub_y: &[u32],
        sub_z: &[u32],
        ori_q0: &[f64],
        ori_q1: &[f64],
        ori_q2: &[f64],
        ori_q3: &[f64],
        family: Option<&[FamilyTag]>,
    ) {
        self.voxel_id.clear();
        self.voxel_id.extend_from_slice(voxel_id);
        self.sub_x.clear();
        self.sub_x.extend_from_slice(sub_x);
        self.sub_y.clear();
        self.sub_y.extend_from_slice(sub_y);
        self.sub_z.clear();
        self.sub_z.extend_from_slice(sub_z);
        self.ori_q0.clear();
        self.ori_q0.extend_from_slice(ori_q0);
        self.ori_q1.clear();
        self.ori_q1.extend_from_slice(ori_q1);
        self.ori_q2.clear();
        self.ori_q2.extend_from_slice(ori_q2);
        self.ori_q3.clear();
        self.ori_q3.extend_from_slice(ori_q3);
        match family {
            Some(f) => {
                let dst = self.family.get_or_insert_with(Vec::new);
                dst.clear();
                dst.extend_from_slice(f);
            }
            None => self.family = None,
        }
    }

    pub fn len(&self) -> usize {
        self.voxel_id.len()
    }
}

/// kT -> dT: a shadow copy of the freshly regenerated contact list (plus
/// the old-to-new mapping, when history is enabled), written by kT under
/// `dynamic_owned_buffer_lock`, consumed by dT. The count and mapping are
/// written *last* by the producer — the publication point.
#[derive(Default)]
pub struct ContactsBuffer {
    pub id_a: Vec<u32>,
    pub id_b: Vec<u32>,
    pub contact_type: Vec<ContactType>,
    /// `mapping[i]` is the index this new pair held in the previous
    /// contact list, or `NULL_MAPPING` for newly-born contacts. Absent
    /// entirely in historyless mode.
    pub mapping: Option<Vec<u32>>,
    n_contact_pairs: usize,
}

impl ContactsBuffer {
    pub fn n_contact_pairs(&self) -> usize {
        self.n_contact_pairs
    }

    /// Writes the new contact geometry, then — last — the mapping and
    /// count, so a waking consumer never observes a partially written
    /// buffer.
    pub fn publish(
        &mut self,
        id_a: &[u32],
        id_b: &[u32],
        contact_type: &[ContactType],
        mapping: Option<&[u32]>,
    ) {
        debug_assert_eq!(id_a.len(), id_b.len());
        debug_assert_eq!(id_a.len(), contact_type.len());
        self.id_a.clear();
        self.id_a.extend_from_slice(id_a);
        self.id_b.clear();
        self.id_b.extend_from_slice(id_b);
        self.contact_type.clear();
        self.contact_type.extend_from_slice(contact_type);

        match mapping {
            Some(m) => {
                debug_assert_eq!(m.len(), id_a.len());
                let dst = self.mapping.get_or_insert_with(Vec::new);
                dst.clear();
                dst.extend_from_slice(m);
            }
            None => self.mapping = None,
        }
        // Count last: the publication point.
        self.n_contact_pairs = id_a.len();
    }
}

pub const fn is_null_mapping(v: u32) -> bool {
    v == NULL_MAPPING
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_order_leaves_count_consistent_with_arrays() {
        let mut buf = ContactsBuffer::default();
        buf.publish(
            &[0, 2],
            &[1, 3],
            &[ContactType::SphereSphere, ContactType::SphereSphere],
            Some(&[0, NULL_MAPPING]),
        );
        assert_eq!(buf.n_contact_pairs(), 2);
        assert_eq!(buf.id_a, vec![0, 2]);
        assert!(is_null_mapping(buf.mapping.unwrap()[1]));
    }

    #[test]
    fn positions_buffer_omits_family_when_not_permitted() {
        let mut buf = PositionsBuffer::default();
        buf.write_from(&[1], &[0], &[0], &[0], &[1.0], &[0.0], &[0.0], &[0.0], None);
        assert!(buf.family.is_none());
    }
}
