//! Actor public key document, federated in every actor's `publicKey` field (§4.2, §6).

use crate::core::signatures::main_key_id;
use serde::{Deserialize, Serialize};
use url::Url;

/// `publicKey` member of an actor document.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: String,
    pub owner: Url,
    pub public_key_pem: String,
}

impl PublicKey {
    /// Builds a `PublicKey` with the conventional `{actor}#main-key` id.
    pub fn new(owner: Url, public_key_pem: String) -> Self {
        let id = main_key_id(&owner);
        PublicKey {
            id,
            owner,
            public_key_pem,
        }
    }
}
