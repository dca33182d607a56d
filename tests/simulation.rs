//! End-to-end exercises against `HostKernelGroups`, driven entirely through
//! `DemSystem`'s public API. No GPU required.

use dem_core::{ClumpInstance, ClumpTemplate, Config, DemSystem, HostKernelGroups, OutputFlags};
use dem_core::encoding::Lattice;
use dem_core::arrays::MaterialProps;

fn test_lattice() -> Lattice {
    Lattice {
        nx_bits: 20,
        ny_bits: 20,
        nz_bits: 20,
        voxel_size: 1.0,
        l: 1.0 / 4096.0,
        lbf: [-500.0, -500.0, -500.0],
    }
}

fn unit_sphere_template() -> ClumpTemplate {
    ClumpTemplate {
        mass: 1.0,
        moi: [0.4, 0.4, 0.4],
        sphere_rel_pos: vec![[0.0, 0.0, 0.0]],
        sphere_radius: vec![1.0],
        sphere_material: vec![MaterialProps {
            young_modulus: 1.0e7,
            poisson_ratio: 0.3,
            restitution: 0.5,
            friction: 0.3,
            rolling_resistance: 0.0,
        }],
    }
}

#[test]
fn overlapping_pair_separates_over_several_calls() {
    let templates = vec![unit_sphere_template()];
    let instances = vec![
        ClumpInstance {
            template: 0,
            position: [0.0, 0.0, 0.0],
            family: 0,
        },
        ClumpInstance {
            template: 0,
            position: [1.5, 0.0, 0.0],
            family: 0,
        },
    ];
    let config = Config {
        h: 1.0e-4,
        cycle_duration: 1.0e-2,
        update_threshold: 8,
        ..Config::default()
    };
    let mut system = DemSystem::new(config, test_lattice(), HostKernelGroups, &templates, &instances).unwrap();
    system.launch().unwrap();
    system.do_dynamics().unwrap();
    system.do_dynamics().unwrap();

    let positions = system.positions_snapshot();
    let lattice = system.lattice();
    let p0 = lattice.decode(positions.voxel_id[0], positions.sub_x[0], positions.sub_y[0], positions.sub_z[0]);
    let p1 = lattice.decode(positions.voxel_id[1], positions.sub_x[1], positions.sub_y[1], positions.sub_z[1]);
    let dist = ((p1[0] - p0[0]).powi(2) + (p1[1] - p0[1]).powi(2) + (p1[2] - p0[2]).powi(2)).sqrt();
    assert!(dist > 1.5, "overlapping spheres should separate, got dist={dist}");

    system.shutdown().unwrap();
}

#[test]
fn drift_gate_eventually_holds_dynamic_back() {
    let templates = vec![unit_sphere_template()];
    let instances = vec![ClumpInstance {
        template: 0,
        position: [0.0, 0.0, 0.0],
        family: 0,
    }];
    let config = Config {
        h: 1.0e-5,
        cycle_duration: 1.0e-3,
        update_threshold: 2,
        ..Config::default()
    };
    let mut system = DemSystem::new(config, test_lattice(), HostKernelGroups, &templates, &instances).unwrap();
    system.launch().unwrap();
    for _ in 0..5 {
        system.do_dynamics().unwrap();
    }
    assert!(system.stats().n_times_dynamic_held_back() >= 1);
    system.shutdown().unwrap();
}

#[test]
fn family_suppression_hides_owner_from_csv_output() {
    let templates = vec![unit_sphere_template()];
    let instances = vec![
        ClumpInstance {
            template: 0,
            position: [0.0, 0.0, 0.0],
            family: 1,
        },
        ClumpInstance {
            template: 0,
            position: [5.0, 0.0, 0.0],
            family: 2,
        },
    ];
    let config = Config::default();
    let mut system = DemSystem::new(config, test_lattice(), HostKernelGroups, &templates, &instances).unwrap();
    system.families().suppress_from_output(2);
    system.launch().unwrap();
    system.do_dynamics().unwrap();

    let positions = system.positions_snapshot();
    let lattice = system.lattice();
    let family_tags: Vec<_> = instances
        .iter()
        .map(|inst| system.families().resolve_or_default(inst.family))
        .collect();
    let vel = vec![[0.0; 3]; instances.len()];

    let mut buf = Vec::new();
    dem_core::output::write_csv(
        &mut buf,
        &lattice,
        &positions,
        system.owner_radius(),
        &vel,
        &vel,
        &vel,
        &vel,
        &family_tags,
        system.families(),
        OutputFlags::NONE,
    )
    .unwrap();
    let text = String::from_utf8(buf).unwrap();
    // header + exactly one data row (family 1's owner; family 2 is suppressed)
    assert_eq!(text.lines().count(), 2);

    system.shutdown().unwrap();
}

#[test]
fn historyless_run_never_touches_contact_history_arrays() {
    let templates = vec![unit_sphere_template()];
    let instances = vec![
        ClumpInstance {
            template: 0,
            position: [0.0, 0.0, 0.0],
            family: 0,
        },
        ClumpInstance {
            template: 0,
            position: [1.2, 0.0, 0.0],
            family: 0,
        },
    ];
    let config = Config {
        is_historyless: true,
        ..Config::default()
    };
    let mut system = DemSystem::new(config, test_lattice(), HostKernelGroups, &templates, &instances).unwrap();
    system.launch().unwrap();
    for _ in 0..3 {
        system.do_dynamics().unwrap();
    }
    system.shutdown().unwrap();
}

#[test]
fn bootstrap_blocks_dynamic_until_first_contact_list_arrives() {
    let templates = vec![unit_sphere_template()];
    let instances = vec![ClumpInstance {
        template: 0,
        position: [0.0, 0.0, 0.0],
        family: 0,
    }];
    let config = Config::default();
    let n_cycles = config.cycles_per_call();
    let mut system = DemSystem::new(config, test_lattice(), HostKernelGroups, &templates, &instances).unwrap();
    system.launch().unwrap();
    assert_eq!(system.current_stamp(), 0);
    system.do_dynamics().unwrap();
    // The whole batch only completes once dT has bootstrapped past kT's
    // first contact list (proved deterministically at the unit level by
    // `dynamic_worker::tests::bootstrap_blocks_until_first_contact_list_published`)
    // and then run every cycle of the call.
    assert_eq!(system.current_stamp(), n_cycles);
    assert!(system.stats().n_kinematic_updates() >= 1);
    system.shutdown().unwrap();
}

#[test]
fn spheres_fall_under_gravity() {
    let templates = vec![unit_sphere_template()];
    let instances = vec![
        ClumpInstance {
            template: 0,
            position: [0.0, 0.0, 10.0],
            family: 0,
        },
        ClumpInstance {
            template: 0,
            position: [50.0, 0.0, 20.0],
            family: 0,
        },
    ];
    let config = Config {
        h: 1.0e-3,
        cycle_duration: 1.0,
        gravity: [0.0, 0.0, -9.81],
        ..Config::default()
    };
    let mut system = DemSystem::new(config, test_lattice(), HostKernelGroups, &templates, &instances).unwrap();
    system.launch().unwrap();
    system.do_dynamics().unwrap();

    let positions = system.positions_snapshot();
    let lattice = system.lattice();
    let p0 = lattice.decode(positions.voxel_id[0], positions.sub_x[0], positions.sub_y[0], positions.sub_z[0]);
    let p1 = lattice.decode(positions.voxel_id[1], positions.sub_x[1], positions.sub_y[1], positions.sub_z[1]);
    assert!(p0[2] < 9.0, "owner 0 should have fallen under gravity, z={}", p0[2]);
    assert!(p1[2] < 19.0, "owner 1 should have fallen under gravity, z={}", p1[2]);

    system.shutdown().unwrap();
}
