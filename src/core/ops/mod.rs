//! The closed loop: proposals become missions, missions emit events, events
//! spawn reactions and triggers, and those feed new proposals.

pub mod cap_gates;
pub mod chance;
pub mod enrichment;
pub mod events;
pub mod executor;
pub mod heartbeat;
pub mod initiative;
pub mod outcomes;
pub mod policy;
pub mod proposals;
pub mod reactions;
pub mod recovery;
pub mod relationships;
pub mod steps;
pub mod triggers;
pub mod voice;
