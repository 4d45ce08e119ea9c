//! Wire representations of the closed set of activities this bridge sends and understands
//! (§4.4, §9 "Dynamic dispatch": "prefer a closed enumeration of activity kinds with a default
//! ignore branch").
//!
//! One per-activity struct per kind (`Create`, `Follow`, `Accept`, ...), collapsed into one
//! closed [`InboxActivity`] enum rather than an `enum_delegate`-boxed, open trait object list
//! (dropped per DESIGN.md).

use crate::{
    core::object_id::{deserialize_actor_ref, ObjectId},
    protocol::values::{
        deserialize_one_or_many, AcceptType, AnnounceType, BlockType, CreateType, DeleteType,
        FlagType, FollowType, LikeType, RejectType, UndoType, UpdateType,
    },
};
use crate::protocol::objects::Note;
use serde::{Deserialize, Serialize};
use url::Url;

type ActorId = ObjectId<crate::bridge::FedActor>;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Create {
    #[serde(rename = "type")]
    pub kind: CreateType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    #[serde(deserialize_with = "deserialize_one_or_many", default)]
    pub to: Vec<Url>,
    #[serde(deserialize_with = "deserialize_one_or_many", default)]
    pub cc: Vec<Url>,
    pub object: Note,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    #[serde(rename = "type")]
    pub kind: UpdateType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    #[serde(deserialize_with = "deserialize_one_or_many", default)]
    pub to: Vec<Url>,
    #[serde(deserialize_with = "deserialize_one_or_many", default)]
    pub cc: Vec<Url>,
    pub object: Note,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    #[serde(rename = "type")]
    pub kind: DeleteType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    /// Id of the deleted object (or actor, when the target is a `Tombstone` for an actor — §4.8).
    pub object: Url,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Follow {
    #[serde(rename = "type")]
    pub kind: FollowType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    pub object: ActorId,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accept {
    #[serde(rename = "type")]
    pub kind: AcceptType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    pub object: Follow,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reject {
    #[serde(rename = "type")]
    pub kind: RejectType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    pub object: Follow,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Like {
    #[serde(rename = "type")]
    pub kind: LikeType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    pub object: Url,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    #[serde(rename = "type")]
    pub kind: AnnounceType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    pub object: Url,
    #[serde(deserialize_with = "deserialize_one_or_many", default)]
    pub to: Vec<Url>,
    #[serde(deserialize_with = "deserialize_one_or_many", default)]
    pub cc: Vec<Url>,
}

/// An activity that undoes a previously-sent `Follow`/`Like`/`Announce`/`Block` (the only kinds
/// this bridge itself emits, so `object` is scoped to those rather than `Box<dyn Activity>`).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum UndoneActivity {
    Follow(Follow),
    Like(Like),
    Announce(Announce),
    Block(Block),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Undo {
    #[serde(rename = "type")]
    pub kind: UndoType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    pub object: UndoneActivity,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(rename = "type")]
    pub kind: BlockType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    pub object: ActorId,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    #[serde(rename = "type")]
    pub kind: FlagType,
    pub id: Url,
    #[serde(deserialize_with = "deserialize_actor_ref")]
    pub actor: ActorId,
    #[serde(deserialize_with = "deserialize_one_or_many")]
    pub object: Vec<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Closed set of activities this bridge accepts on an inbox (§9). Unknown `type` values fail to
/// deserialize into this enum and are handled by [`crate::inbox::server`]'s default-ignore branch
/// rather than a variant here, keeping the enumeration genuinely closed.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum InboxActivity {
    Create(Create),
    Update(Update),
    Delete(Delete),
    Follow(Follow),
    Accept(Accept),
    Reject(Reject),
    Like(Like),
    Announce(Announce),
    Undo(Undo),
    Block(Block),
    Flag(Flag),
}

impl InboxActivity {
    /// The activity's own id, used for inbox dedupe (§4.5).
    pub fn id(&self) -> &Url {
        match self {
            InboxActivity::Create(a) => &a.id,
            InboxActivity::Update(a) => &a.id,
            InboxActivity::Delete(a) => &a.id,
            InboxActivity::Follow(a) => &a.id,
            InboxActivity::Accept(a) => &a.id,
            InboxActivity::Reject(a) => &a.id,
            InboxActivity::Like(a) => &a.id,
            InboxActivity::Announce(a) => &a.id,
            InboxActivity::Undo(a) => &a.id,
            InboxActivity::Block(a) => &a.id,
            InboxActivity::Flag(a) => &a.id,
        }
    }

    /// The sending actor's id.
    pub fn actor(&self) -> &Url {
        match self {
            InboxActivity::Create(a) => a.actor.inner(),
            InboxActivity::Update(a) => a.actor.inner(),
            InboxActivity::Delete(a) => a.actor.inner(),
            InboxActivity::Follow(a) => a.actor.inner(),
            InboxActivity::Accept(a) => a.actor.inner(),
            InboxActivity::Reject(a) => a.actor.inner(),
            InboxActivity::Like(a) => a.actor.inner(),
            InboxActivity::Announce(a) => a.actor.inner(),
            InboxActivity::Undo(a) => a.actor.inner(),
            InboxActivity::Block(a) => a.actor.inner(),
            InboxActivity::Flag(a) => a.actor.inner(),
        }
    }

    /// Stable type name for logging (§7: "a stable `code` string for log aggregation").
    pub fn type_name(&self) -> &'static str {
        match self {
            InboxActivity::Create(_) => "Create",
            InboxActivity::Update(_) => "Update",
            InboxActivity::Delete(_) => "Delete",
            InboxActivity::Follow(_) => "Follow",
            InboxActivity::Accept(_) => "Accept",
            InboxActivity::Reject(_) => "Reject",
            InboxActivity::Like(_) => "Like",
            InboxActivity::Announce(_) => "Announce",
            InboxActivity::Undo(_) => "Undo",
            InboxActivity::Block(_) => "Block",
            InboxActivity::Flag(_) => "Flag",
        }
    }
}
