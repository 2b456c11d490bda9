//! C7: host-to-guest transport. Everything an instance needs to talk to
//! its own in-guest agent over vsock lives here, gated by the same
//! resilience stack (C2) as the VMM control plane.
pub mod pathdefence;
pub mod transport;

pub use transport::{GuestClient, ReadFile, SharedGuestClient};
