//! Bridge coordinator: handle resolution, cross-protocol primitives, policy and chat intake
//! (§4.7, §4.8, §4.9).

pub mod coordinator;
pub mod intake;
pub mod objects;
pub mod policy;

pub use objects::{FedActor, FedMessage};
