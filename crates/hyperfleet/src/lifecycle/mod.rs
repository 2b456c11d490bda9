//! C9: the lifecycle engine. Owns the state machine (spec §4.8) that
//! takes a machine from `pending` through `running` to `stopped`/`failed`,
//! composing C3 (store), C4 (OCI resolver), C5 (hypervisor driver), C6
//! (network), C7 (guest transport) and C8 (runtime registry) behind a
//! single entry point serialized per machine id.

pub mod engine;
pub mod supervisor;

pub use engine::Engine;
