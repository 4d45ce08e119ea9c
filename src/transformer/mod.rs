//! Bidirectional activity/message translation (§4.4).

pub mod chat_to_fed;
pub mod fed_to_chat;
pub mod html;
