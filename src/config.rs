//! Typed configuration surface shared read-only between kT and dT.

use serde::{Deserialize, Serialize};

use crate::error::{DemError, DemResult};

/// Bitset of optional CSV output columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputFlags(u16);

impl OutputFlags {
    pub const ABSV: OutputFlags = OutputFlags(1 << 0);
    pub const VEL: OutputFlags = OutputFlags(1 << 1);
    pub const ANG_VEL: OutputFlags = OutputFlags(1 << 2);
    pub const ACC: OutputFlags = OutputFlags(1 << 3);
    pub const ANG_ACC: OutputFlags = OutputFlags(1 << 4);
    pub const FAMILY: OutputFlags = OutputFlags(1 << 5);

    pub const NONE: OutputFlags = OutputFlags(0);

    pub fn contains(&self, flag: OutputFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn union(self, other: OutputFlags) -> OutputFlags {
        OutputFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for OutputFlags {
    type Output = OutputFlags;
    fn bitor(self, rhs: OutputFlags) -> OutputFlags {
        self.union(rhs)
    }
}

/// Verbosity levels, ordered low to high. Maps onto `tracing::Level`
/// in `system.rs`; the core itself never prints directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Verbosity {
    Quiet,
    #[default]
    Info,
    StepMetric,
    Debug,
}

impl Verbosity {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Verbosity::Quiet => tracing::Level::ERROR,
            Verbosity::Info => tracing::Level::WARN,
            Verbosity::StepMetric => tracing::Level::INFO,
            Verbosity::Debug => tracing::Level::DEBUG,
        }
    }
}

/// Simulation-wide configuration, constructed once by the façade and shared
/// (`Arc`) read-only with both workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Integration timestep, in seconds.
    pub h: f64,
    /// Simulated seconds advanced per `do_dynamics` user call.
    pub cycle_duration: f64,
    /// Maximum stamps of drift dT may accumulate ahead of kT (must be >= 1).
    pub update_threshold: u64,
    /// Disables history arrays and the migrator entirely.
    pub is_historyless: bool,
    /// If false, the force/integration step loops until accepted. Current
    /// kernels always accept on the first pass.
    pub is_step_const: bool,
    /// Controls whether drift/history-sentry warnings are reported.
    pub is_async: bool,
    /// Enables the family-change kernel and family publication to kT.
    pub can_family_change: bool,
    /// Uniform body-force acceleration applied to every owner each cycle,
    /// before contact forces accumulate on top of it.
    pub gravity: [f64; 3],
    /// Optional CSV output columns.
    pub output_flags: OutputFlags,
    pub verbosity: Verbosity,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            h: 1e-5,
            cycle_duration: 1e-2,
            update_threshold: 4,
            is_historyless: false,
            is_step_const: true,
            is_async: true,
            can_family_change: false,
            gravity: [0.0, 0.0, -9.81],
            output_flags: OutputFlags::NONE,
            verbosity: Verbosity::Info,
        }
    }
}

impl Config {
    /// Validates the fields that the rest of the core assumes hold for its
    /// whole lifetime. Called once by the façade before any thread starts.
    pub fn validate(&self) -> DemResult<()> {
        if self.h <= 0.0 {
            return Err(DemError::InvalidConfig(format!(
                "h must be positive, got {}",
                self.h
            )));
        }
        if self.cycle_duration <= 0.0 {
            return Err(DemError::InvalidConfig(format!(
                "cycle_duration must be positive, got {}",
                self.cycle_duration
            )));
        }
        if self.update_threshold < 1 {
            return Err(DemError::InvalidConfig(
                "update_threshold must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of integration cycles dT runs per user call.
    pub fn cycles_per_call(&self) -> u64 {
        (self.cycle_duration / self.h).round() as u64
    }
}
