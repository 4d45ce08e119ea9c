//! Shared leaf value types used across activities and objects: kind markers, tags, attachments
//! (§4.4, §6).

use serde::{Deserialize, Serialize};
use url::Url;

pub use activitystreams_kinds::{
    activity::{
        AcceptType, AnnounceType, BlockType, CreateType, DeleteType, FlagType, FollowType,
        LikeType, RejectType, UndoType, UpdateType,
    },
    actor::PersonType,
    object::{DocumentType, ImageType, NoteType},
};

/// A mention or hashtag attached to a note's `tag` list (§4.4).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Tag {
    Mention(Mention),
    Hashtag(Hashtag),
    Emoji(EmojiTag),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub href: Url,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Hashtag {
    pub href: Url,
    pub name: String,
}

/// Custom emoji tag: `name` is `:shortcode:`, `icon` the image object carrying the glyph URL.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmojiTag {
    pub name: String,
    pub icon: EmojiIcon,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmojiIcon {
    #[serde(rename = "type")]
    pub kind: ImageType,
    pub url: Url,
}

/// Media kinds a note attachment may take (§4.4: `{Image, Video, Audio, Document}`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    Document,
}

/// One translated media attachment on a note (§4.4).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub media_type: String,
    pub url: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blurhash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "name")]
    pub alt_text: Option<String>,
}

/// Deserializes a field that may be given as a single value or an array of values, defaulting
/// to an empty vector when absent. Needed for `to`/`cc`/`@context`.
pub fn deserialize_one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }
    Ok(match OneOrMany::<T>::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}
