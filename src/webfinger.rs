//! WebFinger discovery: `@user@domain` → actor URL, and our own
//! `/.well-known/webfinger` response building (§4.7, §6).
//!
//! Trimmed to the single `Person` kind this bridge resolves remote handles to.

use crate::{
    bridge::FedActor,
    config::Data,
    core::object_id::ObjectId,
    error::Error,
};
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Resolves `@user@domain` (or `user@domain`) to a local [`FedActor`], fetching the actor
/// document via WebFinger + content negotiation if not already known (§4.7).
pub async fn resolve_actor(identifier: &str, data: &Data) -> Result<FedActor, Error> {
    let identifier = identifier.trim_start_matches('@');
    let (_, domain) = identifier
        .splitn(2, '@')
        .collect_tuple()
        .ok_or(Error::WebfingerResolveFailed)?;
    let scheme = if data.settings.debug { "http" } else { "https" };
    let fetch_url = format!("{scheme}://{domain}/.well-known/webfinger?resource=acct:{identifier}");
    debug!(url = %fetch_url, "fetching webfinger document");

    let response = data
        .client
        .get(&fetch_url)
        .send()
        .await
        .map_err(Error::other)?;
    if !response.status().is_success() {
        return Err(Error::WebfingerResolveFailed);
    }
    let document: Webfinger = response.json().await.map_err(Error::other)?;

    let candidate_links: Vec<Url> = document
        .links
        .iter()
        .filter(|link| link.rel.as_deref() == Some("self"))
        .filter(|link| {
            link.kind
                .as_deref()
                .is_some_and(|kind| kind.starts_with("application/"))
        })
        .filter_map(|link| link.href.clone())
        .collect();

    for href in candidate_links {
        match ObjectId::<FedActor>::new(href).dereference(data).await {
            Ok(actor) => return Ok(actor),
            Err(error) => debug!(%error, "failed to dereference webfinger link"),
        }
    }
    Err(Error::WebfingerResolveFailed)
}

/// Extracts the localpart from an incoming `acct:name@domain` resource query, validating that
/// the domain matches ours.
pub fn extract_webfinger_name<'a>(query: &'a str, local_domain: &str) -> Result<&'a str, Error> {
    let regex = Regex::new(r"^acct:([\p{L}0-9_.\-]+)@(.+)$").map_err(Error::other)?;
    let captures = regex
        .captures(query)
        .ok_or_else(|| Error::Validation("malformed webfinger resource".to_string()))?;
    let name = captures
        .get(1)
        .ok_or_else(|| Error::Validation("malformed webfinger resource".to_string()))?;
    let domain = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
    if domain != local_domain {
        return Err(Error::Validation("webfinger domain mismatch".to_string()));
    }
    Ok(name.as_str())
}

/// Builds our own `/.well-known/webfinger` response for a local actor (§6).
pub fn build_webfinger_response(subject: String, actor_url: Url, profile_url: Url) -> Webfinger {
    Webfinger {
        subject,
        aliases: vec![actor_url.clone()],
        links: vec![
            WebfingerLink {
                rel: Some("self".to_string()),
                kind: Some("application/activity+json".to_string()),
                href: Some(actor_url),
            },
            WebfingerLink {
                rel: Some("http://webfinger.net/rel/profile-page".to_string()),
                kind: Some("text/html".to_string()),
                href: Some(profile_url),
            },
        ],
        properties: HashMap::new(),
    }
}

/// JRD document as defined by RFC 7033.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Webfinger {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Url>,
    pub links: Vec<WebfingerLink>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebfingerLink {
    pub rel: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub href: Option<Url>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_name_when_domain_matches() {
        let name = extract_webfinger_name("acct:alice@example.com", "example.com").unwrap();
        assert_eq!(name, "alice");
    }

    #[test]
    fn rejects_domain_mismatch() {
        let err = extract_webfinger_name("acct:alice@other.example", "example.com").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn webfinger_response_has_self_and_profile_links() {
        let response = build_webfinger_response(
            "acct:alice@example.com".to_string(),
            Url::parse("https://example.com/users/alice").unwrap(),
            Url::parse("https://example.com/@alice").unwrap(),
        );
        assert_eq!(response.links.len(), 2);
        assert!(response
            .links
            .iter()
            .any(|l| l.rel.as_deref() == Some("self")));
    }
}
