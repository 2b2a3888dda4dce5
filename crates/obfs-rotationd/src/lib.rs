//! obfs-rotationd - attribute-rotation daemon for mesh interfaces
//!
//! Periodically mutates OVS port attributes (VLAN tag, MAC address,
//! ingress policing, egress delay) on mesh-created interfaces to resist
//! passive traffic analysis. All switch and interface manipulation goes
//! through external CLIs; this crate only decides what to change and when.

mod commands;
mod mutator;
mod policy;
mod scheduler;
mod state;
mod types;

pub use commands::*;
pub use mutator::PortMutator;
pub use policy::{load as load_policy, parse as parse_policy, RotationPolicy};
pub use scheduler::{AttachHooks, RotationScheduler};
pub use state::{InterfaceState, StateStore};
pub use types::*;
