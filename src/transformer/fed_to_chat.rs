//! Fed→Chat translation (§4.4). Pure given an already-resolved [`FedNote`]: the reply lookup and
//! per-attachment media handle resolution happen in the caller before translation, matching
//! [`crate::transformer::chat_to_fed`]'s purity split.

use crate::{protocol::objects::Note, transformer::html};

/// A ghost ready to be addressed: either a local chat user, or a synthesized `@_ap_<user>_<host>`
/// ghost id (§4.4 "Fed→Chat message").
pub fn mention_target(local_part: &str, host: &str, local_domain: &str) -> String {
    if host == local_domain {
        format!("@{local_part}:{host}")
    } else {
        format!("@_ap_{local_part}_{}:{local_domain}", host.replace('.', "_"))
    }
}

/// An attachment already resolved to a chat media handle via the media gateway.
#[derive(Clone, Debug)]
pub struct ResolvedChatAttachment {
    pub handle: String,
    pub msgtype: &'static str,
    pub alt_text: Option<String>,
}

/// An emoji tag already resolved to a chat-renderable `<img>` source.
#[derive(Clone, Debug)]
pub struct ResolvedChatEmoji {
    pub shortcode: String,
    pub icon_chat_url: String,
}

/// The source fed note, fully resolved, ready for pure translation.
pub struct FedNote<'a> {
    pub note: &'a Note,
    pub local_domain: &'a str,
    pub reply_to_chat_event_id: Option<String>,
    pub attachments: Vec<ResolvedChatAttachment>,
    pub emoji: Vec<ResolvedChatEmoji>,
}

/// A translated chat message: formatted (HTML) body, plain-text fallback, and optional reply
/// relation, plus any attachment messages that must be sent alongside it.
pub struct TranslatedChatMessage {
    pub formatted_body: String,
    pub plain_body: String,
    pub reply_to_chat_event_id: Option<String>,
    pub attachments: Vec<ResolvedChatAttachment>,
}

/// Translates a resolved fed note into chat-renderable content (§4.4 "Fed→Chat message").
pub fn translate(source: &FedNote<'_>) -> TranslatedChatMessage {
    let mut body = html::sanitize(&source.note.content);
    body = rewrite_fed_mentions(&body, source.local_domain);
    body = rewrite_shortcodes(&body, &source.emoji);

    let mut plain_body = strip_tags(&source.note.content);
    plain_body = rewrite_fed_mentions(&plain_body, source.local_domain);

    if source.note.sensitive {
        if let Some(summary) = &source.note.summary {
            body = format!(r#"<span data-mx-spoiler="{summary}">{body}</span>"#);
            plain_body = format!("[{summary}] {plain_body}");
        }
    }

    TranslatedChatMessage {
        formatted_body: body,
        plain_body,
        reply_to_chat_event_id: source.reply_to_chat_event_id.clone(),
        attachments: source.attachments.clone(),
    }
}

fn rewrite_fed_mentions(text: &str, local_domain: &str) -> String {
    html::fed_mention_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            mention_target(&caps[1], &caps[2], local_domain)
        })
        .to_string()
}

fn rewrite_shortcodes(text: &str, emoji: &[ResolvedChatEmoji]) -> String {
    let mut out = text.to_string();
    for e in emoji {
        let shortcode = format!(":{}:", e.shortcode);
        out = out.replace(&shortcode, &format!(r#"<img src="{}" alt="{shortcode}">"#, e.icon_chat_url));
    }
    out
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::object_id::ObjectId, protocol::objects::Note};
    use chrono::Utc;
    use url::Url;

    fn sample_note(content: &str) -> Note {
        Note {
            kind: Default::default(),
            id: ObjectId::new(Url::parse("https://fed.example/objects/1").unwrap()),
            attributed_to: ObjectId::new(Url::parse("https://fed.example/users/alice").unwrap()),
            to: vec![],
            cc: vec![],
            content: content.to_string(),
            in_reply_to: None,
            summary: None,
            sensitive: false,
            published: Utc::now(),
            tag: vec![],
            attachment: vec![],
        }
    }

    #[test]
    fn local_domain_mention_becomes_chat_id() {
        assert_eq!(mention_target("alice", "chat.example", "chat.example"), "@alice:chat.example");
    }

    #[test]
    fn remote_mention_becomes_ghost_id() {
        assert_eq!(
            mention_target("alice", "fed.example", "chat.example"),
            "@_ap_alice_fed_example:chat.example"
        );
    }

    #[test]
    fn sensitive_note_wraps_spoiler() {
        let mut note = sample_note("hidden text");
        note.sensitive = true;
        note.summary = Some("spoiler".to_string());
        let source = FedNote {
            note: &note,
            local_domain: "chat.example",
            reply_to_chat_event_id: None,
            attachments: vec![],
            emoji: vec![],
        };
        let translated = translate(&source);
        assert!(translated.formatted_body.contains("data-mx-spoiler"));
        assert!(translated.plain_body.starts_with("[spoiler] "));
    }

    #[test]
    fn plain_text_round_trips_modulo_whitespace() {
        let note = sample_note("hello world");
        let source = FedNote {
            note: &note,
            local_domain: "chat.example",
            reply_to_chat_event_id: None,
            attachments: vec![],
            emoji: vec![],
        };
        let translated = translate(&source);
        assert_eq!(translated.plain_body.trim(), "hello world");
    }
}
