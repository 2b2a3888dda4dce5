//! Common infrastructure for the OVS obfuscation rotation daemon.
//!
//! This crate provides the pieces shared by the rotation daemon and its
//! manual CLI entry points:
//!
//! - [`shell`]: Safe shell command execution with proper quoting and
//!   bounded timeouts
//! - [`lock`]: Exclusive, non-blocking operation lock with RAII release
//! - [`error`]: Error taxonomy for rotation operations
//!
//! # Architecture
//!
//! The rotation subsystem manipulates switch and interface state only
//! through external CLIs (`ovs-vsctl`, `ip`, `tc`):
//!
//! 1. Load the rotation policy once at startup
//! 2. Acquire the exclusive operation lock (fail fast when busy)
//! 3. Execute shell commands to mutate port attributes
//! 4. Persist last-rotation state for restart continuity

pub mod error;
pub mod lock;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{ObfsError, ObfsResult};
pub use lock::{LockGuard, OpLock};
