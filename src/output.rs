//! Turns a positions snapshot into a CSV column layout, honoring
//! per-family output suppression and the optional-column bitset.

use std::io::Write;

use crate::buffers::PositionsBuffer;
use crate::config::OutputFlags;
use crate::encoding::{Lattice, Quaternion};
use crate::error::{DemError, DemResult};
use crate::family::FamilyMap;

fn csv_err(e: csv::Error) -> DemError {
    DemError::InvalidConfig(format!("output write failed: {e}"))
}

/// Writes one CSV row per owner: always `#x,#y,#z,r`, then any optional
/// columns requested by `flags`, in the fixed order
/// `absv,vel,ang_vel,acc,ang_acc,family`. Owners whose family is
/// suppressed via `FamilyMap::suppress_from_output` are skipped entirely.
pub fn write_csv<W: Write>(
    mut out: W,
    lattice: &Lattice,
    positions: &PositionsBuffer,
    radius: &[f64],
    vel: &[[f64; 3]],
    ang_vel: &[[f64; 3]],
    acc: &[[f64; 3]],
    ang_acc: &[[f64; 3]],
    family: &[crate::family::FamilyTag],
    families: &FamilyMap,
    flags: OutputFlags,
) -> DemResult<()> {
    let n = positions.len();
    if radius.len() != n || family.len() != n {
        return Err(DemError::InvalidConfig(format!(
            "output column length mismatch: n={n}, radius={}, family={}",
            radius.len(),
            family.len()
        )));
    }

    let mut writer = csv::WriterBuilder::new().from_writer(&mut out);

    let mut header = vec!["#x", "#y", "#z", "r"];
    if flags.contains(OutputFlags::ABSV) {
        header.push("absv");
    }
    if flags.contains(OutputFlags::VEL) {
        header.extend(["vx", "vy", "vz"]);
    }
    if flags.contains(OutputFlags::ANG_VEL) {
        header.extend(["wx", "wy", "wz"]);
    }
    if flags.contains(OutputFlags::ACC) {
        header.extend(["ax", "ay", "az"]);
    }
    if flags.contains(OutputFlags::ANG_ACC) {
        header.extend(["alpha_x", "alpha_y", "alpha_z"]);
    }
    if flags.contains(OutputFlags::FAMILY) {
        header.push("family");
    }
    writer.write_record(&header).map_err(csv_err)?;

    for i in 0..n {
        if families.is_suppressed(family[i]) {
            continue;
        }
        let p = lattice.decode(
            positions.voxel_id[i],
            positions.sub_x[i],
            positions.sub_y[i],
            positions.sub_z[i],
        );
        let mut row = vec![p[0].to_string(), p[1].to_string(), p[2].to_string(), radius[i].to_string()];
        if flags.contains(OutputFlags::ABSV) {
            let v = vel[i];
            let mag = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            row.push(mag.to_string());
        }
        if flags.contains(OutputFlags::VEL) {
            row.extend(vel[i].map(|c| c.to_string()));
        }
        if flags.contains(OutputFlags::ANG_VEL) {
            row.extend(ang_vel[i].map(|c| c.to_string()));
        }
        if flags.contains(OutputFlags::ACC) {
            row.extend(acc[i].map(|c| c.to_string()));
        }
        if flags.contains(OutputFlags::ANG_ACC) {
            row.extend(ang_acc[i].map(|c| c.to_string()));
        }
        if flags.contains(OutputFlags::FAMILY) {
            row.push(
                families
                    .to_user(family[i])
                    .unwrap_or(u32::from(family[i]))
                    .to_string(),
            );
        }
        writer.write_record(&row).map_err(csv_err)?;
    }
    writer.flush().map_err(|e| DemError::InvalidConfig(format!("output write failed: {e}")))?;
    Ok(())
}

/// Resolves owner orientation to a decoded quaternion, for writers that
/// want full pose rather than just a centroid (not wired into
/// `write_csv` today; the documented format only emits centroid + radius).
pub fn decode_orientation(positions: &PositionsBuffer, i: usize) -> Quaternion {
    Quaternion {
        q0: positions.ori_q0[i],
        q1: positions.ori_q1[i],
        q2: positions.ori_q2[i],
        q3: positions.ori_q3[i],
    }
}

/// Column-oriented writer trait for output formats beyond CSV (binary,
/// streaming). Left as a stub: no second format exists yet, so there is
/// nothing concrete to implement against.
pub trait ColumnWriter {
    fn write_owner_row(&mut self, index: usize, positions: &PositionsBuffer, radius: f64) -> DemResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::FamilyMap;

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
    fn writes_minimal_columns_by_default() {
        let lattice = test_lattice();
        let mut positions = PositionsBuffer::default();
        let (vid, sx, sy, sz) = lattice.encode([1.0, 2.0, 3.0]);
        positions.write_from(&[vid], &[sx], &[sy], &[sz], &[1.0], &[0.0], &[0.0], &[0.0], None);
        let families = FamilyMap::new();
        let tag = families.register(0);

        let mut buf = Vec::new();
        write_csv(
            &mut buf,
            &lattice,
            &positions,
            &[0.5],
            &[[0.0; 3]],
            &[[0.0; 3]],
            &[[0.0; 3]],
            &[[0.0; 3]],
            &[tag],
            &families,
            OutputFlags::NONE,
        )
        .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().next().unwrap(), "#x,#y,#z,r");
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn suppressed_family_is_skipped() {
        let lattice = test_lattice();
        let mut positions = PositionsBuffer::default();
        let (vid, sx, sy, sz) = lattice.encode([0.0, 0.0, 0.0]);
        positions.write_from(&[vid], &[sx], &[sy], &[sz], &[1.0], &[0.0], &[0.0], &[0.0], None);
        let families = FamilyMap::new();
        let tag = families.register(9);
        families.suppress_from_output(9);

        let mut buf = Vec::new();
        write_csv(
            &mut buf,
            &lattice,
            &positions,
            &[0.5],
            &[[0.0; 3]],
            &[[0.0; 3]],
            &[[0.0; 3]],
            &[[0.0; 3]],
            &[tag],
            &families,
            OutputFlags::NONE,
        )
        .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
