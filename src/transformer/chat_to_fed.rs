//! Chat→Fed translation (§4.4). Pure given an already-resolved [`ChatEvent`]: reply targets,
//! mentioned actors, and attachment metadata are resolved by the caller (the coordinator, via
//! the mapping store and the media gateway) before this function runs, so the translation itself
//! stays a deterministic, synchronously-testable function of its inputs.

use crate::protocol::{
    activities::Create,
    context::WithContext,
    objects::Note,
    values::{Attachment, AttachmentKind, EmojiIcon, EmojiTag, Hashtag, Mention, Tag},
};
use crate::{core::object_id::ObjectId, error::Error, transformer::html};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

/// `m.*` chat message types relevant to translation (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatMsgType {
    Text,
    Notice,
    Emote,
}

/// A mention already resolved to its fed actor, found in the source body.
#[derive(Clone, Debug)]
pub struct ResolvedMention {
    pub matched_text: String,
    pub fed_actor_url: Url,
    pub name: String,
}

/// A custom-emoji embed already resolved to its icon URL. `source_markup` is the literal
/// substring (typically an `<img>` tag) that stands for the emoji in the source HTML and must be
/// replaced by its `:shortcode:` before any other transform runs (§4.4).
#[derive(Clone, Debug)]
pub struct ResolvedEmoji {
    pub shortcode: String,
    pub icon_url: Url,
    pub icon_media_type: String,
    pub source_markup: String,
}

/// An attachment already uploaded/resolved to its fed-facing URL and metadata.
#[derive(Clone, Debug)]
pub struct ResolvedAttachment {
    pub kind: AttachmentKind,
    pub media_type: String,
    pub url: Url,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub blurhash: Option<String>,
    pub alt_text: Option<String>,
}

/// The source chat event, fully resolved, ready for pure translation.
#[derive(Clone, Debug)]
pub struct ChatEvent {
    pub chat_event_id: String,
    pub msgtype: ChatMsgType,
    pub sender_display_name: String,
    pub sender_actor_id: Url,
    pub sender_followers_url: Url,
    pub room_is_public: bool,
    pub recipient_actor_id: Option<Url>,
    pub plain_body: String,
    pub formatted_body: Option<String>,
    pub reply_to_fed_object_id: Option<Url>,
    pub mentions: Vec<ResolvedMention>,
    pub emoji: Vec<ResolvedEmoji>,
    pub attachment: Option<ResolvedAttachment>,
    pub published: DateTime<Utc>,
}

/// Result of a successful translation: the wrapped activity plus the identifier pair to persist
/// in the message mapping table.
pub struct Translated {
    pub activity: WithContext<Create>,
    pub object_id: Url,
    pub activity_id: Url,
}

/// Deterministic object id: `<base>/objects/<url-encoded(chat-event-id)>` (§4.4).
pub fn object_id(base: &Url, chat_event_id: &str) -> Url {
    let mut url = base.clone();
    url.path_segments_mut()
        .expect("base url is not cannot-be-a-base")
        .push("objects")
        .push(&url::form_urlencoded::byte_serialize(chat_event_id.as_bytes()).collect::<String>());
    url
}

/// Deterministic activity id: `<base>/activities/<lower(type)>-<short-base64url(hash(objectId))>`.
pub fn activity_id(base: &Url, activity_type: &str, object_id: &Url) -> Url {
    let mut hasher = Sha256::new();
    hasher.update(object_id.as_str().as_bytes());
    let digest = hasher.finalize();
    let short_hash = URL_SAFE_NO_PAD.encode(&digest[..8]);
    let mut url = base.clone();
    url.path_segments_mut()
        .expect("base url is not cannot-be-a-base")
        .push("activities")
        .push(&format!("{}-{short_hash}", activity_type.to_lowercase()));
    url
}

/// Translates a resolved chat event into a `Create(Note)` activity (§4.4 "Chat→Fed Note").
pub fn translate(base: &Url, event: &ChatEvent) -> Result<Translated, Error> {
    let object_id = object_id(base, &event.chat_event_id);
    let activity_id = activity_id(base, "create", &object_id);

    let (to, cc) = audience(event);

    let content = render_content(event);
    let mut tags = extract_tags(event);
    tags.extend(event.emoji.iter().map(|emoji| {
        Tag::Emoji(EmojiTag {
            name: format!(":{}:", emoji.shortcode),
            icon: EmojiIcon {
                kind: crate::protocol::values::ImageType::default(),
                url: emoji.icon_url.clone(),
            },
        })
    }));

    let (sensitive, summary) = event
        .formatted_body
        .as_deref()
        .and_then(html::extract_spoiler_label)
        .map(|label| (true, Some(label)))
        .unwrap_or((false, None));

    let attachment = event
        .attachment
        .as_ref()
        .map(|a| Attachment {
            kind: a.kind,
            media_type: a.media_type.clone(),
            url: a.url.clone(),
            width: a.width,
            height: a.height,
            blurhash: a.blurhash.clone(),
            alt_text: a.alt_text.clone(),
        })
        .into_iter()
        .collect();

    let note = Note {
        kind: Default::default(),
        id: ObjectId::new(object_id.clone()),
        attributed_to: ObjectId::new(event.sender_actor_id.clone()),
        to: to.clone(),
        cc: cc.clone(),
        content,
        in_reply_to: event.reply_to_fed_object_id.clone().map(ObjectId::new),
        summary,
        sensitive,
        published: event.published,
        tag: tags,
        attachment,
    };

    let create = Create {
        kind: Default::default(),
        id: activity_id.clone(),
        actor: ObjectId::new(event.sender_actor_id.clone()),
        to,
        cc,
        object: note,
    };

    Ok(Translated {
        activity: WithContext::new_default(create),
        object_id,
        activity_id,
    })
}

const PUBLIC_ADDRESS: &str = "https://www.w3.org/ns/activitystreams#Public";

fn audience(event: &ChatEvent) -> (Vec<Url>, Vec<Url>) {
    if event.room_is_public {
        let public = Url::parse(PUBLIC_ADDRESS).expect("valid url");
        (vec![public], vec![event.sender_followers_url.clone()])
    } else {
        match &event.recipient_actor_id {
            Some(recipient) => (vec![recipient.clone()], vec![]),
            None => (vec![], vec![]),
        }
    }
}

fn render_content(event: &ChatEvent) -> String {
    match event.msgtype {
        ChatMsgType::Emote => {
            let action = event
                .formatted_body
                .as_deref()
                .unwrap_or(&event.plain_body);
            format!("<em>{} {}</em>", html_escape(&event.sender_display_name), html_escape(action))
        }
        ChatMsgType::Text | ChatMsgType::Notice => match &event.formatted_body {
            Some(html_body) => rewrite_chat_html(html_body, event),
            None => html_escape(&event.plain_body),
        },
    }
}

fn rewrite_chat_html(html_body: &str, event: &ChatEvent) -> String {
    let mut rewritten = html_body.to_string();
    // Custom emoji embeds are handled before sanitizing/other transforms so the shortcode
    // survives (§4.4: "handle embeds for custom emoji before other transforms").
    for emoji in &event.emoji {
        rewritten = rewritten.replace(&emoji.source_markup, &format!(":{}:", emoji.shortcode));
    }
    rewritten = html::sanitize(&rewritten);
    for mention in &event.mentions {
        rewritten = rewritten.replace(&mention.matched_text, &format!("@{}@{}", mention.name, fed_host(&mention.fed_actor_url)));
    }
    rewritten
}

fn fed_host(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_string()
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn extract_tags(event: &ChatEvent) -> Vec<Tag> {
    let mut tags: Vec<Tag> = event
        .mentions
        .iter()
        .map(|m| {
            Tag::Mention(Mention {
                href: m.fed_actor_url.clone(),
                name: format!("@{}@{}", m.name, fed_host(&m.fed_actor_url)),
            })
        })
        .collect();

    let source_text = event.formatted_body.as_deref().unwrap_or(&event.plain_body);
    for capture in html::hashtag_regex().captures_iter(source_text) {
        let word = capture[1].to_string();
        tags.push(Tag::Hashtag(Hashtag {
            href: Url::parse(&format!("https://example.invalid/tags/{word}")).expect("valid url"),
            name: format!("#{word}"),
        }));
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event() -> ChatEvent {
        ChatEvent {
            chat_event_id: "$abc:example.com".to_string(),
            msgtype: ChatMsgType::Text,
            sender_display_name: "Alice".to_string(),
            sender_actor_id: Url::parse("https://fed.example/users/alice").unwrap(),
            sender_followers_url: Url::parse("https://fed.example/users/alice/followers").unwrap(),
            room_is_public: true,
            recipient_actor_id: None,
            plain_body: "hello world".to_string(),
            formatted_body: None,
            reply_to_fed_object_id: None,
            mentions: vec![],
            emoji: vec![],
            attachment: None,
            published: Utc::now(),
        }
    }

    #[test]
    fn object_and_activity_ids_are_deterministic() {
        let base = Url::parse("https://fed.example").unwrap();
        let id_a = object_id(&base, "$abc:example.com");
        let id_b = object_id(&base, "$abc:example.com");
        assert_eq!(id_a, id_b);
        let activity_a = activity_id(&base, "Create", &id_a);
        let activity_b = activity_id(&base, "Create", &id_b);
        assert_eq!(activity_a, activity_b);
        assert!(activity_a.as_str().contains("/activities/create-"));
    }

    #[test]
    fn plain_text_is_escaped_not_reparsed_as_html() {
        let event = base_event();
        let translated = translate(&Url::parse("https://fed.example").unwrap(), &event).unwrap();
        assert_eq!(translated.activity.inner().object.content, "hello world");
    }

    #[test]
    fn public_room_addresses_public_and_followers() {
        let event = base_event();
        let translated = translate(&Url::parse("https://fed.example").unwrap(), &event).unwrap();
        let create = translated.activity.inner();
        assert_eq!(create.to, vec![Url::parse(PUBLIC_ADDRESS).unwrap()]);
        assert_eq!(create.cc, vec![event.sender_followers_url]);
    }

    #[test]
    fn dm_addresses_only_recipient() {
        let mut event = base_event();
        event.room_is_public = false;
        event.recipient_actor_id = Some(Url::parse("https://fed.example/users/bob").unwrap());
        let translated = translate(&Url::parse("https://fed.example").unwrap(), &event).unwrap();
        let create = translated.activity.inner();
        assert_eq!(create.to, vec![Url::parse("https://fed.example/users/bob").unwrap()]);
        assert!(create.cc.is_empty());
    }

    #[test]
    fn spoiler_marker_sets_sensitive_and_summary() {
        let mut event = base_event();
        event.formatted_body = Some(r#"<span data-mx-spoiler="ending">he dies</span>"#.to_string());
        let translated = translate(&Url::parse("https://fed.example").unwrap(), &event).unwrap();
        assert!(translated.activity.inner().object.sensitive);
        assert_eq!(translated.activity.inner().object.summary.as_deref(), Some("ending"));
    }

    #[test]
    fn emote_wraps_action_with_sender_name() {
        let mut event = base_event();
        event.msgtype = ChatMsgType::Emote;
        event.plain_body = "waves".to_string();
        let translated = translate(&Url::parse("https://fed.example").unwrap(), &event).unwrap();
        assert_eq!(translated.activity.inner().object.content, "<em>Alice waves</em>");
    }

    #[test]
    fn idempotent_translation_produces_identical_ids() {
        let event = base_event();
        let base = Url::parse("https://fed.example").unwrap();
        let first = translate(&base, &event).unwrap();
        let second = translate(&base, &event).unwrap();
        assert_eq!(first.object_id, second.object_id);
        assert_eq!(first.activity_id, second.activity_id);
    }
}
