//! [`crate::traits::Object`]/[`crate::traits::Actor`] implementations binding the database rows
//! in [`crate::db::models`] to their fed wire representations (§3, §4.4).
//!
//! A plain struct holding both the parsed `ap_id: ObjectId<DbUser>` and the key material, built
//! once from the row rather than re-parsing strings on every trait call.

use crate::{
    config::Data,
    core::object_id::ObjectId,
    db::{self, models},
    error::Error,
    protocol::{
        objects::{ActorEndpoints, Note, Person},
        public_key::PublicKey,
        values::PersonType,
    },
    traits::{Actor, Object},
};
use async_trait::async_trait;
use diesel::prelude::*;
use url::Url;

/// A user or ghost, viewed as a fed actor. Always built from a [`models::User`] row whose
/// `fed_actor_id` and `inbox_url` are set — local users are lazily projected into Fed on first
/// outbound send or follow (§3 User lifecycle); [`crate::bridge::coordinator`] performs that
/// projection before constructing a `FedActor`.
#[derive(Clone, Debug)]
pub struct FedActor {
    pub row_id: i64,
    pub ap_id: Url,
    pub inbox: Url,
    pub shared_inbox: Option<Url>,
    pub preferred_username: String,
    pub display_name: Option<String>,
    pub public_key_pem: Option<String>,
    pub private_key_pem: Option<String>,
}

impl TryFrom<models::User> for FedActor {
    type Error = Error;

    fn try_from(row: models::User) -> Result<Self, Error> {
        let ap_id = Url::parse(row.fed_actor_id.as_deref().ok_or_else(|| {
            Error::other(anyhow::anyhow!("user {} has no fed_actor_id", row.id))
        })?)
        .map_err(Error::other)?;
        let inbox = Url::parse(row.inbox_url.as_deref().ok_or_else(|| {
            Error::other(anyhow::anyhow!("user {} has no inbox_url", row.id))
        })?)
        .map_err(Error::other)?;
        let shared_inbox = row
            .shared_inbox_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(Error::other)?;
        let preferred_username = ap_id
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("user")
            .to_string();
        Ok(FedActor {
            row_id: row.id,
            ap_id,
            inbox,
            shared_inbox,
            preferred_username,
            display_name: row.display_name,
            public_key_pem: row.public_key_pem,
            private_key_pem: row.private_key_pem,
        })
    }
}

impl FedActor {
    fn append_segment(&self, segment: &str) -> Result<Url, Error> {
        let mut url = self.inbox.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| Error::other(anyhow::anyhow!("cannot-be-a-base url: {}", self.inbox)))?;
            segments.pop();
            segments.push(segment);
        }
        Ok(url)
    }

    /// Followers collection URL, used by chat intake to build the fed `cc` audience (§4.4).
    pub fn followers_url(&self) -> Result<Url, Error> {
        self.append_segment("followers")
    }

    /// Following collection URL, served by the inbox server (§6).
    pub fn following_url(&self) -> Result<Url, Error> {
        self.append_segment("following")
    }

    /// Outbox collection URL, served by the inbox server (§6).
    pub fn outbox_url(&self) -> Result<Url, Error> {
        self.append_segment("outbox")
    }
}

#[async_trait]
impl Object for FedActor {
    type Protocol = Person;

    fn id(&self) -> &Url {
        &self.ap_id
    }

    async fn read_from_id(object_id: Url, data: &Data) -> Result<Option<Self>, Error> {
        use crate::db::schema::users;
        let target = object_id.to_string();
        let row: Option<models::User> = db::with_transaction(&data.db, move |conn| {
            Ok(users::table
                .filter(users::fed_actor_id.eq(Some(target)))
                .first::<models::User>(conn)
                .optional()?)
        })?;
        row.map(FedActor::try_from).transpose()
    }

    async fn into_protocol(self, _data: &Data) -> Result<Self::Protocol, Error> {
        let public_key_pem = self
            .public_key_pem
            .clone()
            .ok_or_else(|| Error::other(anyhow::anyhow!("fed actor {} missing public key", self.ap_id)))?;
        Ok(Person {
            kind: PersonType::default(),
            preferred_username: self.preferred_username.clone(),
            outbox: self.append_segment("outbox")?,
            followers: self.append_segment("followers")?,
            following: self.append_segment("following")?,
            name: self.display_name.clone(),
            summary: None,
            icon: None,
            endpoints: ActorEndpoints {
                shared_inbox: self.shared_inbox.clone(),
            },
            public_key: PublicKey::new(self.ap_id.clone(), public_key_pem),
            inbox: self.inbox.clone(),
            id: ObjectId::new(self.ap_id),
        })
    }

    async fn from_protocol(protocol: Self::Protocol, data: &Data) -> Result<Self, Error> {
        let new_user = models::NewUser {
            chat_user_id: None,
            fed_actor_id: Some(protocol.id.into_inner().to_string()),
            inbox_url: Some(protocol.inbox.to_string()),
            shared_inbox_url: protocol.endpoints.shared_inbox.map(|u| u.to_string()),
            display_name: protocol.name,
            avatar_url: None,
            is_ghost: true,
            is_double_puppet: false,
            encrypted_chat_token: None,
            private_key_pem: None,
            public_key_pem: Some(protocol.public_key.public_key_pem),
        };
        let row = db::with_transaction(&data.db, |conn| db::upsert_user(conn, &new_user))?;
        FedActor::try_from(row)
    }
}

impl Actor for FedActor {
    fn public_key_pem(&self) -> &str {
        self.public_key_pem.as_deref().unwrap_or_default()
    }

    fn private_key_pem(&self) -> Option<&str> {
        self.private_key_pem.as_deref()
    }

    fn inbox(&self) -> Url {
        self.inbox.clone()
    }

    fn shared_inbox(&self) -> Option<Url> {
        self.shared_inbox.clone()
    }
}

/// A message mapping row, viewed as a fed note identity. Bodies are not persisted (§1
/// Non-goals: "storing message bodies beyond what is required to preserve identifier and routing
/// mappings"), so `into_protocol`/`from_protocol` only ever need the id: the transformer
/// (`crate::transformer`) builds/consumes the full [`Note`] content directly from the source
/// event. `FedMessage` exists so `inReplyTo` targets can be resolved with the same typed
/// [`ObjectId`] machinery used for actors.
#[derive(Clone, Debug)]
pub struct FedMessage {
    pub row_id: i64,
    pub fed_object_id: Url,
}

impl TryFrom<models::MessageMapping> for FedMessage {
    type Error = Error;

    fn try_from(row: models::MessageMapping) -> Result<Self, Error> {
        let fed_object_id = Url::parse(row.fed_object_id.as_deref().ok_or_else(|| {
            Error::other(anyhow::anyhow!(
                "message mapping {} has no fed_object_id",
                row.id
            ))
        })?)
        .map_err(Error::other)?;
        Ok(FedMessage {
            row_id: row.id,
            fed_object_id,
        })
    }
}

#[async_trait]
impl Object for FedMessage {
    type Protocol = Note;

    fn id(&self) -> &Url {
        &self.fed_object_id
    }

    async fn read_from_id(object_id: Url, data: &Data) -> Result<Option<Self>, Error> {
        use crate::db::schema::message_mappings;
        let target = object_id.to_string();
        let row: Option<models::MessageMapping> = db::with_transaction(&data.db, move |conn| {
            Ok(message_mappings::table
                .filter(message_mappings::fed_object_id.eq(Some(target)))
                .first::<models::MessageMapping>(conn)
                .optional()?)
        })?;
        row.map(FedMessage::try_from).transpose()
    }

    async fn into_protocol(self, _data: &Data) -> Result<Self::Protocol, Error> {
        Err(Error::other(anyhow::anyhow!(
            "message bodies are not persisted; the transformer builds Note content directly"
        )))
    }

    async fn from_protocol(_protocol: Self::Protocol, _data: &Data) -> Result<Self, Error> {
        Err(Error::other(anyhow::anyhow!(
            "message bodies are not persisted; the transformer consumes Note content directly"
        )))
    }
}
