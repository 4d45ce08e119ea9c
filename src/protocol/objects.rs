//! Federated object documents: actors and notes (§4.4, §6).

use crate::{
    core::object_id::ObjectId,
    protocol::{
        public_key::PublicKey,
        values::{deserialize_one_or_many, Attachment, NoteType, PersonType, Tag},
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// `endpoints` member of an actor document, carrying the shared inbox (§6).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorEndpoints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<Url>,
}

/// Wire representation of a `Person` actor (§6 `GET /users/:username`).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(rename = "type")]
    pub kind: PersonType,
    pub id: ObjectId<crate::bridge::FedActor>,
    pub preferred_username: String,
    pub inbox: Url,
    pub outbox: Url,
    pub followers: Url,
    pub following: Url,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Attachment>,
    #[serde(default)]
    pub endpoints: ActorEndpoints,
}

/// Wire representation of a `Note` object (§4.4).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(rename = "type")]
    pub kind: NoteType,
    pub id: ObjectId<crate::bridge::FedMessage>,
    pub attributed_to: ObjectId<crate::bridge::FedActor>,
    #[serde(deserialize_with = "deserialize_one_or_many", default)]
    pub to: Vec<Url>,
    #[serde(deserialize_with = "deserialize_one_or_many", default)]
    pub cc: Vec<Url>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<ObjectId<crate::bridge::FedMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
    pub published: DateTime<Utc>,
    #[serde(default)]
    pub tag: Vec<Tag>,
    #[serde(default)]
    pub attachment: Vec<Attachment>,
}

/// `Tombstone` replacing a deleted object (§4.8).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    #[serde(rename = "type")]
    pub kind: activitystreams_kinds::object::TombstoneType,
    pub id: Url,
}

/// Marker implemented by both wire object kinds so handlers can log a stable type name.
pub trait ObjectKind {
    fn type_name(&self) -> &'static str;
}

impl ObjectKind for Person {
    fn type_name(&self) -> &'static str {
        "Person"
    }
}

impl ObjectKind for Note {
    fn type_name(&self) -> &'static str {
        "Note"
    }
}

/// Top-level `OrderedCollection`, pointing at its first page (§6: outbox/followers/following).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: Url,
    pub total_items: i64,
    pub first: Url,
}

impl OrderedCollection {
    pub fn new(id: Url, total_items: i64, first: Url) -> Self {
        OrderedCollection {
            kind: "OrderedCollection",
            id,
            total_items,
            first,
        }
    }
}

/// One page of an `OrderedCollection` (§6).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollectionPage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: Url,
    pub part_of: Url,
    pub ordered_items: Vec<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Url>,
}
