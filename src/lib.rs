//! Dual-worker (kinematic thread / dynamic thread) discrete element method
//! simulation core. A dynamic thread (dT) integrates contact forces and
//! owner motion at a fine timestep; a kinematic thread (kT) rebuilds the
//! broad-phase contact list asynchronously and republishes it whenever
//! ready. Both workers exchange state exclusively through the double
//! buffers in [`buffers`], coordinated by [`coordination::SchedSupport`].
//!
//! [`system::DemSystem`] is the entry point a host program drives.

pub mod arrays;
pub mod buffers;
pub mod config;
pub mod coordination;
pub mod dynamic_worker;
pub mod encoding;
pub mod error;
pub mod family;
pub mod history;
pub mod kernels;
pub mod kinematic_worker;
pub mod output;
pub mod system;

pub use config::{Config, OutputFlags, Verbosity};
pub use error::{DemError, DemResult};
pub use kernels::{HostKernelGroups, KernelGroups};
pub use system::{ClumpInstance, ClumpTemplate, DemSystem};

#[cfg(feature = "gpu")]
pub use kernels::vulkan::VulkanKernelGroups;
