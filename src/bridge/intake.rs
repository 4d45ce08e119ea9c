//! Chat-side intake (§4.9): ingests application-service transaction batches pushed by the
//! homeserver, guards against replay and ghost/bot echo loops, and turns the documented `m.*`
//! event types into translate-out jobs.
//!
//! Bearer `hs_token` authentication and raw-body capture are the HTTP layer's job
//! ([`crate::inbox::server`]); by the time a [`ChatTransaction`] reaches here it is already
//! parsed and authenticated. Uses the same closed-dispatch-with-ignore-branch pattern (§9) as
//! the fed-side inbox, here for homeserver event types instead of fed activity types.

use crate::{
    bridge::{coordinator, FedActor},
    config::Data,
    core::signatures,
    db::{self, models},
    error::Error,
    protocol::values::AttachmentKind,
    queue::TranslateOutJob,
    transformer::{chat_to_fed, html},
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Deserialize;
use url::Url;

/// One event inside a homeserver transaction batch — a trimmed view of the Matrix event shape
/// carrying only the fields intake consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatTxnEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub redacts: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub origin_server_ts: i64,
}

/// Body of `PUT /_matrix/app/v1/transactions/:txnId` (§6).
#[derive(Debug, Deserialize)]
pub struct ChatTransaction {
    pub events: Vec<ChatTxnEvent>,
}

/// Entry point for an authenticated transaction. Replays within the dedupe TTL are dropped
/// without reprocessing; each event's handler failure is logged and does not fail the batch
/// (§4.9: "Handlers translate and enqueue; failures are logged, never propagate").
pub async fn process_transaction(data: &Data, txn_id: &str, txn: ChatTransaction) -> Result<(), Error> {
    if data.txn_dedupe.check_and_insert(txn_id).await {
        return Ok(());
    }
    for event in &txn.events {
        if is_loop_risk(&event.sender, &data.settings.local_domain) {
            continue;
        }
        if let Err(error) = dispatch_event(data, event).await {
            tracing::warn!(%error, event_id = %event.event_id, event_type = %event.event_type, "chat intake handler failed");
        }
    }
    Ok(())
}

/// Loop prevention (§5): drop events from our own ghosts (`@_ap_<user>_<instance>:<domain>`) and
/// from the bridge bot itself, since both are echoes of something the bridge already sent.
fn is_loop_risk(sender: &str, local_domain: &str) -> bool {
    let suffix = format!(":{local_domain}");
    (sender.starts_with("@_ap_") && sender.ends_with(&suffix)) || sender == format!("@fedbridge{suffix}")
}

async fn dispatch_event(data: &Data, event: &ChatTxnEvent) -> Result<(), Error> {
    match event.event_type.as_str() {
        "m.room.message" => handle_message(data, event).await,
        "m.reaction" => handle_reaction(data, event).await,
        "m.room.redaction" => handle_redaction(data, event).await,
        "m.room.member" => handle_membership(data, event).await,
        other => {
            tracing::debug!(event_type = other, "ignoring unhandled chat event type");
            Ok(())
        }
    }
}

/// Looks up the local user's row by chat-user-id, projecting a brand new fed actor (keypair,
/// actor id, inbox) on first sighting (§3 User lifecycle: "created on first sighting (local user
/// sends a message requiring fed projection...)").
async fn ensure_local_actor(data: &Data, chat_user_id: &str) -> Result<FedActor, Error> {
    let existing = db::with_transaction(&data.db, |conn| db::find_user_by_chat_id(conn, chat_user_id))?;
    match existing {
        Some(row) if row.fed_actor_id.is_some() => FedActor::try_from(row),
        Some(row) => project_local_actor(data, row).await,
        None => {
            let row = db::with_transaction(&data.db, |conn| {
                db::upsert_user(
                    conn,
                    &models::NewUser {
                        chat_user_id: Some(chat_user_id.to_string()),
                        fed_actor_id: None,
                        inbox_url: None,
                        shared_inbox_url: None,
                        display_name: None,
                        avatar_url: None,
                        is_ghost: false,
                        is_double_puppet: false,
                        encrypted_chat_token: None,
                        private_key_pem: None,
                        public_key_pem: None,
                    },
                )
            })?;
            project_local_actor(data, row).await
        }
    }
}

/// Generates a keypair and mints a fed actor id/inbox for a local user row that doesn't have one
/// yet (§4.2: "On first outbound signing for a local fed actor that lacks a key, a pair is
/// generated and stored atomically").
async fn project_local_actor(data: &Data, row: models::User) -> Result<FedActor, Error> {
    let chat_user_id = row
        .chat_user_id
        .clone()
        .ok_or_else(|| Error::other(anyhow::anyhow!("user {} has neither chat nor fed identity", row.id)))?;
    let localpart = chat_user_id
        .trim_start_matches('@')
        .split(':')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("user");

    let mut ap_id = data.settings.fed_base_url.clone();
    ap_id
        .path_segments_mut()
        .map_err(|()| Error::other(anyhow::anyhow!("cannot-be-a-base fed base url")))?
        .extend(["users", localpart]);
    let mut inbox = ap_id.clone();
    inbox
        .path_segments_mut()
        .map_err(|()| Error::other(anyhow::anyhow!("cannot-be-a-base fed base url")))?
        .push("inbox");
    let mut shared_inbox = data.settings.fed_base_url.clone();
    shared_inbox
        .path_segments_mut()
        .map_err(|()| Error::other(anyhow::anyhow!("cannot-be-a-base fed base url")))?
        .push("inbox");

    let keypair = signatures::generate_actor_keypair()?;

    let updated = db::with_transaction(&data.db, |conn| {
        db::upsert_user(
            conn,
            &models::NewUser {
                chat_user_id: Some(chat_user_id.clone()),
                fed_actor_id: Some(ap_id.to_string()),
                inbox_url: Some(inbox.to_string()),
                shared_inbox_url: Some(shared_inbox.to_string()),
                display_name: row.display_name.clone(),
                avatar_url: row.avatar_url.clone(),
                is_ghost: false,
                is_double_puppet: row.is_double_puppet,
                encrypted_chat_token: row.encrypted_chat_token.clone(),
                private_key_pem: Some(keypair.private_key),
                public_key_pem: Some(keypair.public_key),
            },
        )
    })?;
    FedActor::try_from(updated)
}

/// Gets or creates the room row for a chat room id. Room type is detected once, at creation,
/// from homeserver state (§3 Room/Context: "type is detected from chat room state"); an existing
/// room's type is never re-derived on later messages, since a room's audience shape doesn't
/// retroactively change just because membership fluctuates afterward.
async fn find_or_create_room(data: &Data, chat_room_id: &str) -> Result<models::Room, Error> {
    if let Some(room) = db::with_transaction(&data.db, |conn| db::find_room_by_chat_id(conn, chat_room_id))? {
        return Ok(room);
    }
    let room_type = coordinator::detect_room_type(data, chat_room_id).await;
    db::with_transaction(&data.db, |conn| {
        db::upsert_room(
            conn,
            &models::NewRoom {
                chat_room_id: chat_room_id.to_string(),
                fed_context_id: None,
                room_type,
            },
        )
    })
}

/// Resolves a DM room's other participant to a fed actor URL, if that participant is a ghost (or
/// otherwise has a known fed identity) — a plain local user with no fed counterpart yields `None`
/// and the message is sent as an untargeted `Create(Note)` instead.
async fn resolve_dm_recipient(data: &Data, chat_room_id: &str, local_mxid: &str) -> Option<Url> {
    let counterpart_mxid = coordinator::dm_counterpart(data, chat_room_id, local_mxid).await?;
    let row = db::with_transaction(&data.db, |conn| db::find_user_by_chat_id(conn, &counterpart_mxid))
        .ok()
        .flatten()?;
    row.fed_actor_id.as_deref().and_then(|s| Url::parse(s).ok())
}

/// Extracts and resolves `@user:server` mentions (§4.4 "Mention extraction"). Only mentions
/// naming a known local user or ghost on our own domain resolve; anything else is silently
/// omitted, matching the "malformed reply targets are silently omitted" edge-case policy extended
/// to mentions.
fn resolve_mentions(data: &Data, source: &str) -> Vec<chat_to_fed::ResolvedMention> {
    let mut mentions = Vec::new();
    for capture in html::chat_mention_regex().captures_iter(source) {
        let local = &capture[1];
        let server = &capture[2];
        if server != data.settings.local_domain {
            continue;
        }
        let mxid = format!("@{local}:{server}");
        let Ok(Some(row)) = db::with_transaction(&data.db, |conn| db::find_user_by_chat_id(conn, &mxid)) else {
            continue;
        };
        let Some(fed_actor_url) = row.fed_actor_id.as_deref().and_then(|s| Url::parse(s).ok()) else {
            continue;
        };
        let name = fed_actor_url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or(local)
            .to_string();
        mentions.push(chat_to_fed::ResolvedMention {
            matched_text: capture[0].to_string(),
            fed_actor_url,
            name,
        });
    }
    mentions
}

/// Matches a custom-emoji embed (`<img src="..." alt=":shortcode:">`) in a formatted body
/// (§4.4: "handle embeds for custom emoji before other transforms").
fn custom_emoji_regex() -> regex::Regex {
    regex::Regex::new(r#"<img[^>]*\bsrc="([^"]+)"[^>]*\balt=":([A-Za-z0-9_+\-]+):"[^>]*>"#).expect("valid regex")
}

fn resolve_emoji(data: &Data, formatted_body: &str) -> Vec<chat_to_fed::ResolvedEmoji> {
    custom_emoji_regex()
        .captures_iter(formatted_body)
        .filter_map(|capture| {
            let handle = &capture[1];
            let icon_url = crate::media::handle_to_local_url(handle, &data.settings.fed_base_url).ok()?;
            Some(chat_to_fed::ResolvedEmoji {
                shortcode: capture[2].to_string(),
                icon_url,
                icon_media_type: "image/png".to_string(),
                source_markup: capture[0].to_string(),
            })
        })
        .collect()
}

fn attachment_kind_for_msgtype(msgtype: &str) -> Option<AttachmentKind> {
    match msgtype {
        "m.image" => Some(AttachmentKind::Image),
        "m.video" => Some(AttachmentKind::Video),
        "m.audio" => Some(AttachmentKind::Audio),
        "m.file" => Some(AttachmentKind::Document),
        _ => None,
    }
}

fn resolve_attachment(
    data: &Data,
    content: &serde_json::Value,
    kind: AttachmentKind,
    plain_body: &str,
) -> Option<chat_to_fed::ResolvedAttachment> {
    let handle = content.get("url").and_then(|v| v.as_str())?;
    let url = crate::media::handle_to_local_url(handle, &data.settings.fed_base_url).ok()?;
    let info = content.get("info");
    Some(chat_to_fed::ResolvedAttachment {
        kind,
        media_type: info
            .and_then(|i| i.get("mimetype"))
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream")
            .to_string(),
        url,
        width: info
            .and_then(|i| i.get("w"))
            .and_then(|v| v.as_u64())
            .and_then(|w| u32::try_from(w).ok()),
        height: info
            .and_then(|i| i.get("h"))
            .and_then(|v| v.as_u64())
            .and_then(|h| u32::try_from(h).ok()),
        blurhash: info
            .and_then(|i| i.get("xyz.amorgan.blurhash"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        alt_text: Some(plain_body.to_string()),
    })
}

async fn handle_message(data: &Data, event: &ChatTxnEvent) -> Result<(), Error> {
    let content = &event.content;
    let msgtype_str = content.get("msgtype").and_then(|v| v.as_str()).unwrap_or_default();
    let attachment_kind = attachment_kind_for_msgtype(msgtype_str);
    let msgtype = match msgtype_str {
        "m.text" => chat_to_fed::ChatMsgType::Text,
        "m.notice" => chat_to_fed::ChatMsgType::Notice,
        "m.emote" => chat_to_fed::ChatMsgType::Emote,
        _ if attachment_kind.is_some() => chat_to_fed::ChatMsgType::Text,
        other => {
            tracing::debug!(msgtype = other, "ignoring unhandled chat msgtype");
            return Ok(());
        }
    };

    let plain_body = content.get("body").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let formatted_body = content
        .get("format")
        .and_then(|v| v.as_str())
        .filter(|format| *format == "org.matrix.custom.html")
        .and_then(|_| content.get("formatted_body"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let sender_actor = ensure_local_actor(data, &event.sender).await?;
    let sender_row = db::with_transaction(&data.db, |conn| db::find_user_by_fed_id(conn, sender_actor.ap_id.as_str()))?
        .ok_or(Error::NotFound)?;

    let room = find_or_create_room(data, &event.room_id).await?;
    let room_is_dm = room.room_type == "dm";
    let recipient_actor_id = if room_is_dm {
        resolve_dm_recipient(data, &event.room_id, &event.sender).await
    } else {
        None
    };

    let reply_to_fed_object_id = content
        .get("m.relates_to")
        .and_then(|r| r.get("m.in_reply_to"))
        .and_then(|r| r.get("event_id"))
        .and_then(|v| v.as_str())
        .and_then(|parent_event_id| {
            db::with_transaction(&data.db, |conn| db::find_mapping_by_chat_event(conn, parent_event_id)).ok().flatten()
        })
        .and_then(|mapping| mapping.fed_object_id)
        .and_then(|raw| Url::parse(&raw).ok());

    let mention_source = formatted_body.as_deref().unwrap_or(&plain_body);
    let mentions = resolve_mentions(data, mention_source);
    let emoji = formatted_body.as_deref().map(|body| resolve_emoji(data, body)).unwrap_or_default();
    let attachment = attachment_kind.and_then(|kind| resolve_attachment(data, content, kind, &plain_body));

    let published = DateTime::from_timestamp_millis(event.origin_server_ts).unwrap_or_else(Utc::now);

    let chat_event = chat_to_fed::ChatEvent {
        chat_event_id: event.event_id.clone(),
        msgtype,
        sender_display_name: sender_row.display_name.clone().unwrap_or_else(|| event.sender.clone()),
        sender_actor_id: sender_actor.ap_id.clone(),
        sender_followers_url: sender_actor.followers_url()?,
        room_is_public: !room_is_dm,
        recipient_actor_id,
        plain_body,
        formatted_body,
        reply_to_fed_object_id,
        mentions,
        emoji,
        attachment,
        published,
    };

    let followers = coordinator::followers_of(data, sender_row.id)?;
    data.queues.enqueue_translate_out(TranslateOutJob {
        chat_event,
        room_id: room.id,
        sender_id: sender_row.id,
        followers,
    });
    Ok(())
}

/// Translates an `m.reaction` into a fed `Like` against the mapped object's author (§4.7).
async fn handle_reaction(data: &Data, event: &ChatTxnEvent) -> Result<(), Error> {
    let Some(target_event_id) = event
        .content
        .get("m.relates_to")
        .and_then(|r| r.get("event_id"))
        .and_then(|v| v.as_str())
    else {
        return Ok(());
    };
    let Some(mapping) = db::with_transaction(&data.db, |conn| db::find_mapping_by_chat_event(conn, target_event_id))?
    else {
        return Ok(());
    };
    let Some(fed_object_id) = mapping.fed_object_id else { return Ok(()) };
    let target_object_id = Url::parse(&fed_object_id).map_err(Error::other)?;

    let target_row = db::with_transaction(&data.db, |conn| {
        use crate::db::schema::users;
        Ok(users::table.find(mapping.sender_id).first::<models::User>(conn)?)
    })?;
    let target_actor = FedActor::try_from(target_row)?;

    let sender_actor = ensure_local_actor(data, &event.sender).await?;
    let sender_row = db::with_transaction(&data.db, |conn| db::find_user_by_fed_id(conn, sender_actor.ap_id.as_str()))?
        .ok_or(Error::NotFound)?;

    coordinator::like(data, sender_row.id, target_object_id, target_actor.inbox.clone()).await
}

/// Propagates a chat-side redaction as a `Delete` of the mapped fed object (§4.8, §8: "if E is
/// redacted, eventually a `Delete` activity... is enqueued exactly once").
async fn handle_redaction(data: &Data, event: &ChatTxnEvent) -> Result<(), Error> {
    let target_event_id = event
        .redacts
        .clone()
        .or_else(|| event.content.get("redacts").and_then(|v| v.as_str()).map(str::to_string));
    let Some(target_event_id) = target_event_id else { return Ok(()) };
    coordinator::delete_message(data, &target_event_id).await
}

/// Treats inviting/joining a ghost into a room as following its remote actor, and leaving/
/// removing a ghost as unfollowing it — the chat-side analogue of the bot command grammar the
/// overview excludes from scope (§1: "the interactive bot command grammar... treated as a thin
/// handler that calls core operations").
async fn handle_membership(data: &Data, event: &ChatTxnEvent) -> Result<(), Error> {
    let Some(membership) = event.content.get("membership").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let Some(target_mxid) = event.state_key.as_deref() else { return Ok(()) };
    let Some(ghost_row) = db::with_transaction(&data.db, |conn| db::find_user_by_chat_id(conn, target_mxid))? else {
        return Ok(());
    };
    let Some(fed_actor_id) = ghost_row.fed_actor_id.as_deref() else { return Ok(()) };
    let ghost_actor_url = Url::parse(fed_actor_id).map_err(Error::other)?;
    let identifier = format!(
        "{}@{}",
        ghost_actor_url.path_segments().and_then(|mut s| s.next_back()).unwrap_or_default(),
        ghost_actor_url.host_str().unwrap_or_default(),
    );

    let sender_actor = ensure_local_actor(data, &event.sender).await?;
    let sender_row = db::with_transaction(&data.db, |conn| db::find_user_by_fed_id(conn, sender_actor.ap_id.as_str()))?
        .ok_or(Error::NotFound)?;

    match membership {
        "join" | "invite" => coordinator::follow(data, sender_row.id, &identifier).await,
        "leave" | "ban" => coordinator::unfollow(data, sender_row.id, &identifier).await,
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_prevention_matches_ghost_and_bot_patterns() {
        assert!(is_loop_risk("@_ap_alice_remote_example_com:example.com", "example.com"));
        assert!(is_loop_risk("@fedbridge:example.com", "example.com"));
        assert!(!is_loop_risk("@carol:example.com", "example.com"));
    }

    #[test]
    fn custom_emoji_regex_extracts_shortcode_and_src() {
        let html = r#"hi <img src="mxc://example.com/abc" alt=":wave:"> there"#;
        let caps = custom_emoji_regex().captures(html).unwrap();
        assert_eq!(&caps[1], "mxc://example.com/abc");
        assert_eq!(&caps[2], "wave");
    }
}
