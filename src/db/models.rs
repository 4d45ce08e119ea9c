//! Row structs and upsert helpers for the tables in [`crate::db::schema`].
//!
//! Each "get-or-create by external id" helper uses an upsert via `ON CONFLICT ... DO UPDATE`
//! (§4.1) so that concurrent first-sightings of the same remote actor or chat user don't race
//! into a duplicate row.

use crate::db::schema::{blocks, follows, media, message_mappings, rooms, users};
use chrono::{DateTime, Utc};
use diesel::prelude::*;

/// A chat user, a remote fed actor ("ghost"), or both (§3 User).
#[derive(Queryable, Selectable, Identifiable, Clone, Debug)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i64,
    pub chat_user_id: Option<String>,
    pub fed_actor_id: Option<String>,
    pub inbox_url: Option<String>,
    pub shared_inbox_url: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_ghost: bool,
    pub is_double_puppet: bool,
    pub encrypted_chat_token: Option<Vec<u8>>,
    pub private_key_pem: Option<String>,
    pub public_key_pem: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insertable counterpart of [`User`]. Exactly one of `chat_user_id`/`fed_actor_id` must be set
/// (§3 User invariant); this is enforced by [`crate::db::upsert_user`], not by the type.
#[derive(Insertable, AsChangeset, Clone, Debug)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub chat_user_id: Option<String>,
    pub fed_actor_id: Option<String>,
    pub inbox_url: Option<String>,
    pub shared_inbox_url: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_ghost: bool,
    pub is_double_puppet: bool,
    pub encrypted_chat_token: Option<Vec<u8>>,
    pub private_key_pem: Option<String>,
    pub public_key_pem: Option<String>,
}

/// A bridged chat room, with its fed conversation context once assigned (§3 Room/Context).
#[derive(Queryable, Selectable, Identifiable, Clone, Debug)]
#[diesel(table_name = rooms)]
pub struct Room {
    pub id: i64,
    pub chat_room_id: String,
    pub fed_context_id: Option<String>,
    pub room_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = rooms)]
pub struct NewRoom {
    pub chat_room_id: String,
    pub fed_context_id: Option<String>,
    pub room_type: String,
}

/// Bidirectional correspondence between a chat event and a fed object (§3 Message mapping).
#[derive(Queryable, Selectable, Identifiable, Clone, Debug)]
#[diesel(table_name = message_mappings)]
pub struct MessageMapping {
    pub id: i64,
    pub chat_event_id: Option<String>,
    pub fed_object_id: Option<String>,
    pub room_id: i64,
    pub sender_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = message_mappings)]
pub struct NewMessageMapping {
    pub chat_event_id: Option<String>,
    pub fed_object_id: Option<String>,
    pub room_id: i64,
    pub sender_id: i64,
}

/// A follow relationship, fed or chat originated (§3 Follow).
#[derive(Queryable, Selectable, Identifiable, Clone, Debug)]
#[diesel(table_name = follows)]
pub struct Follow {
    pub id: i64,
    pub follower_id: i64,
    pub following_id: i64,
    pub fed_follow_activity_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = follows)]
pub struct NewFollow {
    pub follower_id: i64,
    pub following_id: i64,
    pub fed_follow_activity_id: Option<String>,
    pub status: String,
}

/// A user- or instance-level block (§3 Block).
#[derive(Queryable, Selectable, Identifiable, Clone, Debug)]
#[diesel(table_name = blocks)]
pub struct Block {
    pub id: i64,
    pub blocker_id: Option<i64>,
    pub blocked_user_id: Option<i64>,
    pub blocked_instance: Option<String>,
    pub kind: String,
    pub reason: Option<String>,
    pub fed_block_activity_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = blocks)]
pub struct NewBlock {
    pub blocker_id: Option<i64>,
    pub blocked_user_id: Option<i64>,
    pub blocked_instance: Option<String>,
    pub kind: String,
    pub reason: Option<String>,
    pub fed_block_activity_id: Option<String>,
}

/// A media asset with its chat-side handle and/or fed-side URL (§3 Media).
#[derive(Queryable, Selectable, Identifiable, Clone, Debug)]
#[diesel(table_name = media)]
pub struct Media {
    pub id: i64,
    pub chat_media_handle: Option<String>,
    pub fed_media_url: Option<String>,
    pub mime_type: String,
    pub file_size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration_secs: Option<f64>,
    pub blurhash: Option<String>,
    pub alt_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = media)]
pub struct NewMedia {
    pub chat_media_handle: Option<String>,
    pub fed_media_url: Option<String>,
    pub mime_type: String,
    pub file_size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration_secs: Option<f64>,
    pub blurhash: Option<String>,
    pub alt_text: Option<String>,
}
