//! Diesel table definitions mirroring the entities in spec.md §3.

diesel::table! {
    users (id) {
        id -> Int8,
        chat_user_id -> Nullable<Text>,
        fed_actor_id -> Nullable<Text>,
        inbox_url -> Nullable<Text>,
        shared_inbox_url -> Nullable<Text>,
        display_name -> Nullable<Text>,
        avatar_url -> Nullable<Text>,
        is_ghost -> Bool,
        is_double_puppet -> Bool,
        encrypted_chat_token -> Nullable<Bytea>,
        private_key_pem -> Nullable<Text>,
        public_key_pem -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    rooms (id) {
        id -> Int8,
        chat_room_id -> Text,
        fed_context_id -> Nullable<Text>,
        room_type -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    message_mappings (id) {
        id -> Int8,
        chat_event_id -> Nullable<Text>,
        fed_object_id -> Nullable<Text>,
        room_id -> Int8,
        sender_id -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    follows (id) {
        id -> Int8,
        follower_id -> Int8,
        following_id -> Int8,
        fed_follow_activity_id -> Nullable<Text>,
        status -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    blocks (id) {
        id -> Int8,
        blocker_id -> Nullable<Int8>,
        blocked_user_id -> Nullable<Int8>,
        blocked_instance -> Nullable<Text>,
        kind -> Text,
        reason -> Nullable<Text>,
        fed_block_activity_id -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    media (id) {
        id -> Int8,
        chat_media_handle -> Nullable<Text>,
        fed_media_url -> Nullable<Text>,
        mime_type -> Text,
        file_size -> Int8,
        width -> Nullable<Int4>,
        height -> Nullable<Int4>,
        duration_secs -> Nullable<Float8>,
        blurhash -> Nullable<Text>,
        alt_text -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(message_mappings -> rooms (room_id));
diesel::joinable!(message_mappings -> users (sender_id));
diesel::allow_tables_to_appear_in_same_query!(users, rooms, message_mappings, follows, blocks, media);
