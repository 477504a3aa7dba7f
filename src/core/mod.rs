//! Rule compilation and transaction logic
//!
//! - [`model`]: Typed configuration document
//! - [`expand`]: `${variable}` and `%{zone}` placeholder expansion
//! - [`compiler`]: Ordered, table-grouped rule scripts
//! - [`ipsets`]: `ipset restore` input
//! - [`backend`]: The kernel-facing seam and its process-spawning implementation
//! - [`transaction`]: Apply, confirm, persist and rollback
//! - [`verify`]: Dry-run checks with `iptables-restore --test`
//! - [`error`]: Error types and restore error translation

pub mod backend;
pub mod compiler;
pub mod error;
pub mod expand;
pub mod ipsets;
pub mod model;
pub mod transaction;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;
