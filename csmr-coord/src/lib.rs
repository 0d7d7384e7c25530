//! # csmr-coord
//!
//! Coordination layer for csmr.
//!
//! This crate provides:
//! - The `Coordination` capability: register, deregister, watch membership,
//!   try to acquire a lock
//! - Leases with fencing tokens, revoked when the holder's session expires
//! - An in-process coordinator with session-timeout failure detection

pub mod coordination;
pub mod error;
pub mod lease;
pub mod local;

pub use coordination::{Coordination, LeaveReason, Member, MembershipEvent, MembershipWatch};
pub use error::CoordinationError;
pub use lease::{Lease, LeaseBackend};
pub use local::{LocalCoordinator, LockHolder, Session};
