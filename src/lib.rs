//! zonewall - zone-based iptables rule compiler
//!
//! Compiles a declarative YAML description of zones, policies, global rule
//! hooks, helper chains and ipsets into `iptables-restore` input, then loads
//! it with a confirm-or-rollback safety net.
//!
//! # Architecture
//!
//! - [`core`] - Configuration model, compiler, backend seam and transactions
//! - [`config`] - YAML loading, defaults merge, tool settings
//! - [`validators`] - Name and length checks run before compiling
//! - [`elevation`] - Tool invocation, namespaces and privilege escalation
//! - [`audit`] - JSON-lines audit log of privileged operations
//! - [`prompt`] - Terminal confirmation countdown
//! - [`utils`] - Directory helpers
//!
//! # Safety Features
//!
//! - Everything is compiled before the first backend call
//! - Dead-man switch: unconfirmed changes are rolled back after a timeout
//! - Rollback replays the last confirmed state, or resets to accept-all
//! - SHA-256 checksums of applied scripts in the audit log
//! - Atomic restore file writes with 0600 permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod prompt;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::model::{Config, Family, Table};
