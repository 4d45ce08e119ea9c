//! HTTP surface: fed discovery/actor/collection/inbox routes and the chat-side
//! application-service callback routes (§4.5, §4.9, §6).

pub mod dedupe;
pub mod rate_limit;
pub mod server;
