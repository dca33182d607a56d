//! Typed error hierarchy for the simulation core.
//!
//! Only GPU-fatal and user-input conditions are represented as `Err`
//! variants here. Consistency warnings and default-applied notices are not
//! errors — they are `tracing` events emitted where they occur (history.rs,
//! family.rs) and never interrupt a user call.

use thiserror::Error;

/// Index of an owner (rigid body) in the managed arrays.
pub type OwnerId = u32;
/// Index of a contact pair in the contact arrays.
pub type ContactId = u32;

#[derive(Debug, Error)]
pub enum DemError {
    /// A kernel group reported a non-zero status. Fatal: the user call is
    /// aborted and the error propagates to the caller of `do_dynamics`.
    #[error("kernel group `{kernel}` failed at stamp {stamp}: {reason}")]
    KernelFailed {
        kernel: &'static str,
        stamp: u64,
        reason: String,
    },

    /// A tracked-object type outside {clump, analytical, mesh} was supplied.
    #[error("unknown tracked-object type tag {tag}")]
    UnknownObjectType { tag: u8 },

    /// A contact referenced an owner ID past the end of the owner arrays.
    #[error("contact {contact} references out-of-range owner {owner} (nOwnerBodies = {n_owners})")]
    OwnerOutOfRange {
        contact: ContactId,
        owner: OwnerId,
        n_owners: u32,
    },

    /// Raised at `Config` construction time, before any thread is spawned.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The worker that owns a resource panicked or exited with a fatal
    /// error on a previous user call and cannot be used again.
    #[error("worker `{0}` has already terminated after a fatal error")]
    WorkerTerminated(&'static str),
}

pub type DemResult<T> = Result<T, DemError>;
