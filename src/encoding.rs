//! The voxel/sub-voxel lattice and quaternion rotation shared by kT and dT.
//!
//! World position `p` in the box `[LBF, LBF + voxelSize * 2^nv]` is encoded
//! as `(voxelID, subX, subY, subZ)`. `voxelID` packs three lattice
//! coordinates as `x * 2^(ny+nz) + y * 2^nz + z`; `subX/Y/Z` are integer
//! offsets within a voxel at resolution `l`. Encode/decode are exact
//! inverses over their shared integer lattice.

/// Bit widths and physical scale of the shared voxel lattice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lattice {
    pub nx_bits: u32,
    pub ny_bits: u32,
    pub nz_bits: u32,
    /// Size of one voxel, in world units.
    pub voxel_size: f64,
    /// Sub-voxel resolution: a sub-voxel coordinate counts units of this size.
    pub l: f64,
    /// Lower-bound-front corner of the simulation box.
    pub lbf: [f64; 3],
}

impl Lattice {
    /// Number of sub-voxel steps spanning one voxel edge.
    pub fn subdivisions(&self) -> u64 {
        (self.voxel_size / self.l).round() as u64
    }

    fn axis_bits(&self, axis: usize) -> u32 {
        match axis {
            0 => self.nx_bits,
            1 => self.ny_bits,
            _ => self.nz_bits,
        }
    }

    /// Encodes a world position into `(voxelID, subX, subY, subZ)`.
    pub fn encode(&self, p: [f64; 3]) -> (u64, u32, u32, u32) {
        let mut voxel_coord = [0u64; 3];
        let mut sub = [0u32; 3];
        for axis in 0..3 {
            let rel = (p[axis] - self.lbf[axis]).max(0.0);
            let voxel_idx = (rel / self.voxel_size).floor() as u64;
            let into_voxel = rel - (voxel_idx as f64) * self.voxel_size;
            let sub_idx = (into_voxel / self.l).floor() as u64;
            let max_voxel = 1u64 << self.axis_bits(axis);
            voxel_coord[axis] = voxel_idx.min(max_voxel.saturating_sub(1));
            sub[axis] = sub_idx.min(self.subdivisions().saturating_sub(1)) as u32;
        }
        let voxel_id = (voxel_coord[0] << (self.ny_bits + self.nz_bits))
            | (voxel_coord[1] << self.nz_bits)
            | voxel_coord[2];
        (voxel_id, sub[0], sub[1], sub[2])
    }

    /// Decodes `(voxelID, subX, subY, subZ)` back to a world position.
    pub fn decode(&self, voxel_id: u64, sub_x: u32, sub_y: u32, sub_z: u32) -> [f64; 3] {
        let z_mask = (1u64 << self.nz_bits) - 1;
        let y_mask = (1u64 << self.ny_bits) - 1;
        let z = voxel_id & z_mask;
        let y = (voxel_id >> self.nz_bits) & y_mask;
        let x = voxel_id >> (self.ny_bits + self.nz_bits);
        let voxel_coord = [x, y, z];
        let sub = [sub_x, sub_y, sub_z];
        let mut p = [0.0; 3];
        for axis in 0..3 {
            p[axis] = self.lbf[axis]
                + (voxel_coord[axis] as f64) * self.voxel_size
                + (sub[axis] as f64) * self.l;
        }
        p
    }

    /// Checks that a sub-voxel offset lies within the voxel extent.
    pub fn sub_voxel_in_range(&self, sub_x: u32, sub_y: u32, sub_z: u32) -> bool {
        let n = self.subdivisions();
        (sub_x as u64) < n && (sub_y as u64) < n && (sub_z as u64) < n
    }
}

/// Unit quaternion (q0 scalar, q1..q3 vector part).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub q0: f64,
    pub q1: f64,
    pub q2: f64,
    pub q3: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        q0: 1.0,
        q1: 0.0,
        q2: 0.0,
        q3: 0.0,
    };

    pub fn norm(&self) -> f64 {
        (self.q0 * self.q0 + self.q1 * self.q1 + self.q2 * self.q2 + self.q3 * self.q3).sqrt()
    }

    /// Re-normalizes to unit norm. A no-op, up to floating error, for
    /// an already-unit quaternion.
    pub fn normalized(&self) -> Quaternion {
        let n = self.norm();
        if n == 0.0 {
            return Quaternion::IDENTITY;
        }
        Quaternion {
            q0: self.q0 / n,
            q1: self.q1 / n,
            q2: self.q2 / n,
            q3: self.q3 / n,
        }
    }

    /// Rotates `v` by this quaternion: `v + 2 * q_vec x (q_vec x v + q0 * v)`.
    pub fn rotate(&self, v: [f64; 3]) -> [f64; 3] {
        let q_vec = [self.q1, self.q2, self.q3];
        let t = cross(q_vec, add(cross(q_vec, v), scale(v, self.q0)));
        add(v, scale(t, 2.0))
    }

    /// First-order quaternion update under body-frame angular velocity
    /// `omega`, advanced by timestep `h`, then renormalized.
    pub fn integrate(&self, omega: [f64; 3], h: f64) -> Quaternion {
        let wq = Quaternion {
            q0: 0.0,
            q1: omega[0],
            q2: omega[1],
            q3: omega[2],
        };
        let dq = quat_mul(*self, wq);
        let updated = Quaternion {
            q0: self.q0 + 0.5 * h * dq.q0,
            q1: self.q1 + 0.5 * h * dq.q1,
            q2: self.q2 + 0.5 * h * dq.q2,
            q3: self.q3 + 0.5 * h * dq.q3,
        };
        updated.normalized()
    }
}

fn quat_mul(a: Quaternion, b: Quaternion) -> Quaternion {
    Quaternion {
        q0: a.q0 * b.q0 - a.q1 * b.q1 - a.q2 * b.q2 - a.q3 * b.q3,
        q1: a.q0 * b.q1 + a.q1 * b.q0 + a.q2 * b.q3 - a.q3 * b.q2,
        q2: a.q0 * b.q2 - a.q1 * b.q3 + a.q2 * b.q0 + a.q3 * b.q1,
        q3: a.q0 * b.q3 + a.q1 * b.q2 - a.q2 * b.q1 + a.q3 * b.q0,
    }
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn round_trip_in_box() {
        let lat = test_lattice();
        let samples = [
            [0.0, 0.0, 0.0],
            [1.23456, -3.4, 7.89],
            [-49.999, 49.999, 0.001],
            [12.5, -12.5, 12.5],
        ];
        for p in samples {
            let (vid, sx, sy, sz) = lat.encode(p);
            assert!(lat.sub_voxel_in_range(sx, sy, sz));
            let back = lat.decode(vid, sx, sy, sz);
            for axis in 0..3 {
                assert!(
                    (back[axis] - p[axis]).abs() <= lat.l + 1e-9,
                    "axis {axis}: {back:?} vs {p:?}"
                );
            }
        }
    }

    #[test]
    fn quaternion_identity_rotation_is_noop() {
        let v = [1.0, 2.0, 3.0];
        assert_eq!(Quaternion::IDENTITY.rotate(v), v);
    }

    #[test]
    fn quaternion_integration_stays_unit_norm() {
        let mut q = Quaternion::IDENTITY;
        for _ in 0..1000 {
            q = q.integrate([0.1, -0.2, 0.05], 1e-3);
        }
        assert!((q.norm() - 1.0).abs() < 1e-9);
    }
}
