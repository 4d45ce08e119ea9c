//! Key/signature engine and typed object dereferencing (§4.2, §9).

pub mod key_cache;
pub mod object_id;
pub mod signatures;
