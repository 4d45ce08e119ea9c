//! Wire (JSON-LD) representations of fed actors, objects and activities (§4.4, §6).

pub mod activities;
pub mod context;
pub mod objects;
pub mod public_key;
pub mod values;
