//! Axum HTTP surface: fed discovery/actor/collection/inbox routes (§4.5, §6), the media gateway's
//! proxy/thumbnail routes (§4.3), and the chat-side application-service callback routes (§4.9, §6).
//!
//! Signature verification is wired as a pre-dispatch step ahead of the handler, with an
//! `Error`-to-status mapping at the response boundary, generalized to this bridge's closed
//! route set and two wire dialects.

use crate::{
    bridge::{intake, FedActor},
    config::Data,
    core::{object_id::ObjectId, signatures},
    db,
    error::Error,
    media,
    protocol::{
        activities::InboxActivity,
        context::WithContext,
        objects::{OrderedCollection, OrderedCollectionPage},
    },
    queue::TranslateInJob,
    traits::Object,
    webfinger,
};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{self, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::SocketAddr, time::Duration};
use url::Url;

const PAGE_SIZE: i64 = 20;

/// Builds the full route table and attaches `data` as shared axum state.
///
/// The server must be run with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// rate-limit middleware can fall back to the peer address (§4.5).
pub fn router(data: Data) -> Router {
    let inbox_routes = Router::new()
        .route("/inbox", post(post_shared_inbox))
        .route("/users/:username/inbox", post(post_user_inbox))
        .route_layer(axum::middleware::from_fn_with_state(data.clone(), rate_limit_mw));

    Router::new()
        .route("/.well-known/webfinger", get(get_webfinger))
        .route("/.well-known/host-meta", get(get_host_meta))
        .route("/.well-known/nodeinfo", get(get_nodeinfo_index))
        .route("/nodeinfo/2.1", get(get_nodeinfo))
        .route("/users/:username", get(get_actor))
        .route("/users/:username/outbox", get(get_outbox))
        .route("/users/:username/followers", get(get_followers))
        .route("/users/:username/following", get(get_following))
        .route("/media/:server/:id", get(get_media))
        .route("/media/:server/:id/thumbnail", get(get_media_thumbnail))
        .merge(inbox_routes)
        .route("/_matrix/app/v1/transactions/:txn_id", put(put_transaction))
        .route("/_matrix/app/v1/users/:user_id", get(get_claimed_user))
        .route("/_matrix/app/v1/rooms/:alias", get(get_claimed_room))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(data)
}

/// Spawns the background sweep that evicts idle rate-limit buckets (§4.5: "cleaned up every
/// minute"). Call once at startup alongside [`router`].
pub fn spawn_rate_limiter_cleanup(data: Data) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            data.rate_limiter.cleanup(Duration::from_secs(5 * 60));
        }
    });
}

/// Wraps [`Error`] for use as an axum handler's error type, externalizing it via
/// [`Error::status_code`]/[`Error::code`] (§7).
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = Json(serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

fn json_ld<T: Serialize>(value: T) -> impl IntoResponse {
    (
        [(http::header::CONTENT_TYPE, "application/activity+json")],
        Json(WithContext::new_default(value)),
    )
}

fn profile_url(data: &Data, username: &str) -> Url {
    let base = data.settings.fed_base_url.as_str().trim_end_matches('/');
    Url::parse(&format!("{base}/@{username}")).unwrap_or_else(|_| data.settings.fed_base_url.clone())
}

fn local_actor_ap_id(data: &Data, username: &str) -> Url {
    let base = data.settings.fed_base_url.as_str().trim_end_matches('/');
    Url::parse(&format!("{base}/users/{username}")).unwrap_or_else(|_| data.settings.fed_base_url.clone())
}

async fn load_local_actor_by_username(data: &Data, username: &str) -> Result<FedActor, Error> {
    FedActor::read_from_id(local_actor_ap_id(data, username), data)
        .await?
        .ok_or(Error::NotFound)
}

fn accepts_fed_json(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/activity+json") || accept.contains("application/ld+json"))
}

// ---- fed discovery & actor ----

#[derive(Debug, Deserialize)]
struct WebfingerQuery {
    resource: String,
}

async fn get_webfinger(
    State(data): State<Data>,
    Query(query): Query<WebfingerQuery>,
) -> Result<Response, ApiError> {
    let username = webfinger::extract_webfinger_name(&query.resource, &data.settings.local_domain)?;
    let actor = load_local_actor_by_username(&data, username).await?;
    let profile = profile_url(&data, username);
    let response = webfinger::build_webfinger_response(query.resource.clone(), actor.ap_id, profile);
    Ok((
        [(http::header::CONTENT_TYPE, "application/jrd+json"), (http::header::CACHE_CONTROL, "public, max-age=3600")],
        Json(response),
    )
        .into_response())
}

async fn get_host_meta(State(data): State<Data>) -> impl IntoResponse {
    let base = data.settings.fed_base_url.as_str().trim_end_matches('/');
    let template = format!("{base}/.well-known/webfinger?resource={{uri}}");
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><XRD xmlns=\"http://docs.oasis-open.org/ns/xri/xrd-1.0\">\
<Link rel=\"lrdd\" type=\"application/xrd+xml\" template=\"{template}\"/></XRD>"
    );
    ([(http::header::CONTENT_TYPE, "application/xrd+xml")], xml)
}

async fn get_nodeinfo_index(State(data): State<Data>) -> impl IntoResponse {
    let base = data.settings.fed_base_url.as_str().trim_end_matches('/');
    Json(serde_json::json!({
        "links": [{
            "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
            "href": format!("{base}/nodeinfo/2.1"),
        }]
    }))
}

async fn get_nodeinfo(State(data): State<Data>) -> Result<Json<serde_json::Value>, ApiError> {
    let (total_users, local_posts) = db::with_transaction(&data.db, |conn| {
        Ok((db::count_local_users(conn)?, db::count_local_posts(conn)?))
    })?;
    Ok(Json(serde_json::json!({
        "version": "2.1",
        "software": { "name": "fedbridge", "version": env!("CARGO_PKG_VERSION") },
        "protocols": ["activitypub"],
        "usage": { "users": { "total": total_users }, "localPosts": local_posts },
        "openRegistrations": false,
    })))
}

async fn get_actor(
    State(data): State<Data>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let actor = load_local_actor_by_username(&data, &username).await?;
    if !accepts_fed_json(&headers) {
        return Ok(Redirect::temporary(profile_url(&data, &username).as_str()).into_response());
    }
    let person = actor.into_protocol(&data).await?;
    Ok((
        [(http::header::CONTENT_TYPE, "application/activity+json"), (http::header::CACHE_CONTROL, "public, max-age=180")],
        Json(WithContext::new_default(person)),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<i64>,
}

fn paginate_urls(items: Vec<Url>, page: i64) -> (Vec<Url>, bool) {
    let start = (page.max(0) as usize) * PAGE_SIZE as usize;
    if start >= items.len() {
        return (Vec::new(), false);
    }
    let end = (start + PAGE_SIZE as usize).min(items.len());
    let has_more = end < items.len();
    (items[start..end].to_vec(), has_more)
}

fn collection_or_page(collection_id: Url, items: Vec<Url>, page: Option<i64>) -> Response {
    match page {
        None => {
            let mut first = collection_id.clone();
            first.query_pairs_mut().append_pair("page", "0");
            json_ld(OrderedCollection::new(collection_id, items.len() as i64, first)).into_response()
        }
        Some(page_num) => {
            let (page_items, has_more) = paginate_urls(items, page_num);
            page_response(collection_id, page_num, page_items, has_more)
        }
    }
}

fn page_response(collection_id: Url, page_num: i64, items: Vec<Url>, has_more: bool) -> Response {
    let mut page_url = collection_id.clone();
    page_url.query_pairs_mut().append_pair("page", &page_num.to_string());
    let next = has_more.then(|| {
        let mut next_url = collection_id.clone();
        next_url.query_pairs_mut().append_pair("page", &(page_num + 1).to_string());
        next_url
    });
    json_ld(OrderedCollectionPage {
        kind: "OrderedCollectionPage",
        id: page_url,
        part_of: collection_id,
        ordered_items: items,
        next,
    })
    .into_response()
}

async fn get_outbox(
    State(data): State<Data>,
    Path(username): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Response, ApiError> {
    let actor = load_local_actor_by_username(&data, &username).await?;
    let collection_id = actor.outbox_url()?;
    match page.page {
        None => {
            let total = db::with_transaction(&data.db, |conn| db::count_outbox(conn, actor.row_id))?;
            let mut first = collection_id.clone();
            first.query_pairs_mut().append_pair("page", "0");
            Ok(json_ld(OrderedCollection::new(collection_id, total, first)).into_response())
        }
        Some(page_num) => {
            let offset = page_num.max(0) * PAGE_SIZE;
            let ids = db::with_transaction(&data.db, |conn| db::list_outbox_page(conn, actor.row_id, PAGE_SIZE, offset))?;
            let has_more = ids.len() as i64 == PAGE_SIZE;
            let items: Vec<Url> = ids.iter().filter_map(|id| Url::parse(id).ok()).collect();
            Ok(page_response(collection_id, page_num, items, has_more))
        }
    }
}

async fn get_followers(
    State(data): State<Data>,
    Path(username): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Response, ApiError> {
    let actor = load_local_actor_by_username(&data, &username).await?;
    let collection_id = actor.followers_url()?;
    let rows = db::with_transaction(&data.db, |conn| db::list_accepted_followers(conn, actor.row_id))?;
    let items: Vec<Url> = rows
        .into_iter()
        .filter_map(|row| row.fed_actor_id.as_deref().and_then(|id| Url::parse(id).ok()))
        .collect();
    Ok(collection_or_page(collection_id, items, page.page))
}

async fn get_following(
    State(data): State<Data>,
    Path(username): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Response, ApiError> {
    let actor = load_local_actor_by_username(&data, &username).await?;
    let collection_id = actor.following_url()?;
    let rows = db::with_transaction(&data.db, |conn| db::list_accepted_following(conn, actor.row_id))?;
    let items: Vec<Url> = rows
        .into_iter()
        .filter_map(|row| row.fed_actor_id.as_deref().and_then(|id| Url::parse(id).ok()))
        .collect();
    Ok(collection_or_page(collection_id, items, page.page))
}

// ---- media gateway (§4.3) ----

/// Thumbnail bounding box when the caller doesn't specify one. Not pinned by spec, chosen as a
/// reasonable default for chat-sized previews (DESIGN.md Open Question).
const DEFAULT_THUMBNAIL_DIMENSION: u32 = 320;

#[derive(Debug, Deserialize)]
struct ThumbnailQuery {
    #[serde(default = "default_thumbnail_dimension")]
    width: u32,
    #[serde(default = "default_thumbnail_dimension")]
    height: u32,
}

fn default_thumbnail_dimension() -> u32 {
    DEFAULT_THUMBNAIL_DIMENSION
}

async fn get_media(State(data): State<Data>, Path((server, id)): Path<(String, String)>) -> Result<Response, ApiError> {
    let bytes = media::proxy_get(&server, &id, &data).await?;
    Ok(([(http::header::CACHE_CONTROL, "public, max-age=86400")], bytes).into_response())
}

async fn get_media_thumbnail(
    State(data): State<Data>,
    Path((server, id)): Path<(String, String)>,
    Query(query): Query<ThumbnailQuery>,
) -> Result<Response, ApiError> {
    let bytes = media::proxy_get(&server, &id, &data).await?;
    let thumbnail = media::thumbnail_jpeg(&bytes, query.width, query.height)?;
    Ok((
        [(http::header::CONTENT_TYPE, "image/jpeg"), (http::header::CACHE_CONTROL, "public, max-age=604800")],
        thumbnail,
    )
        .into_response())
}

// ---- fed inbox ----

/// Fields required to be present on every inbound activity before dispatch is even attempted
/// (§4.5 step 3).
#[derive(Debug, Deserialize)]
struct MinimalActivity {
    #[allow(dead_code)]
    id: Url,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
    #[allow(dead_code)]
    actor: serde_json::Value,
}

async fn post_shared_inbox(
    State(data): State<Data>,
    headers: HeaderMap,
    request_uri: http::Uri,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    handle_inbox_post(&data, &headers, &request_uri, &body).await
}

async fn post_user_inbox(
    State(data): State<Data>,
    Path(_username): Path<String>,
    headers: HeaderMap,
    request_uri: http::Uri,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    handle_inbox_post(&data, &headers, &request_uri, &body).await
}

async fn handle_inbox_post(
    data: &Data,
    headers: &HeaderMap,
    uri: &http::Uri,
    body: &[u8],
) -> Result<StatusCode, ApiError> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| uri.path());
    verify_inbox_signature(data, headers, path_and_query, body).await?;

    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| Error::Validation("malformed JSON body".to_string()))?;
    serde_json::from_value::<MinimalActivity>(value.clone())
        .map_err(|_| Error::Validation("activity missing id/type/actor".to_string()))?;

    let activity: InboxActivity = match serde_json::from_value(value) {
        Ok(activity) => activity,
        Err(error) => {
            tracing::debug!(%error, "ignoring activity of unrecognized type");
            return Ok(StatusCode::ACCEPTED);
        }
    };

    if data.dedupe.check_and_insert(activity.id().as_str()).await {
        return Ok(StatusCode::ACCEPTED);
    }

    data.queues.enqueue_translate_in(TranslateInJob { activity });
    Ok(StatusCode::ACCEPTED)
}

async fn verify_inbox_signature(
    data: &Data,
    headers: &HeaderMap,
    path_and_query: &str,
    body: &[u8],
) -> Result<(), Error> {
    let signature_header = headers
        .get("signature")
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::SignatureInvalid)?;
    let parsed = signatures::parse_signature_header(signature_header)?;

    let date_header = headers
        .get(http::header::DATE)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::SignatureInvalid)?;
    let date_system_time = httpdate::parse_http_date(date_header).map_err(|_| Error::SignatureInvalid)?;
    let date: DateTime<Utc> = date_system_time.into();
    signatures::check_clock_skew(date, Utc::now())?;

    let digest_header_value = headers.get("digest").and_then(|value| value.to_str().ok());
    signatures::verify_body_digest(digest_header_value, body)?;

    let host_header = headers
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let mut header_values = BTreeMap::new();
    header_values.insert("host".to_string(), host_header.to_string());
    header_values.insert("date".to_string(), date_header.to_string());
    if let Some(digest) = digest_header_value {
        header_values.insert("digest".to_string(), digest.to_string());
    }

    let public_key_pem = signer_public_key(data, &parsed.key_id).await?;
    let verify_input = signatures::VerifyRequestInput {
        method: "POST",
        path_and_query,
        header_values: &header_values,
    };
    match signatures::verify_signature(&parsed, &verify_input, &public_key_pem) {
        Ok(()) => Ok(()),
        Err(error) => {
            data.key_cache.evict(&parsed.key_id).await;
            Err(error)
        }
    }
}

async fn signer_public_key(data: &Data, key_id: &str) -> Result<String, Error> {
    if let Some(pem) = data.key_cache.get(key_id).await {
        return Ok(pem);
    }
    let actor_url = key_id.split('#').next().unwrap_or(key_id);
    let actor_url = Url::parse(actor_url).map_err(|_| Error::SignatureInvalid)?;
    let actor: FedActor = ObjectId::<FedActor>::new(actor_url).dereference(data).await?;
    let pem = actor.public_key_pem.ok_or(Error::SignatureInvalid)?;
    data.key_cache.insert(key_id.to_string(), pem.clone()).await;
    Ok(pem)
}

// ---- per-host rate limiting (§4.5) ----

fn inbound_host(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(signature) = headers.get("signature").and_then(|value| value.to_str().ok()) {
        if let Ok(parsed) = signatures::parse_signature_header(signature) {
            let actor_url = parsed.key_id.split('#').next().unwrap_or(&parsed.key_id);
            if let Some(host) = Url::parse(actor_url).ok().and_then(|url| url.host_str().map(str::to_string)) {
                return host;
            }
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|value| value.to_str().ok()) {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }
    peer.ip().to_string()
}

async fn rate_limit_mw(
    State(data): State<Data>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let host = inbound_host(&headers, peer);
    if !data.rate_limiter.try_acquire(&host) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }
    next.run(request).await
}

// ---- chat-side application-service routes (§4.9, §6) ----

fn require_hs_token(data: &Data, headers: &HeaderMap) -> Result<(), Error> {
    let provided = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if provided == Some(data.settings.homeserver_token.as_str()) {
        Ok(())
    } else {
        Err(Error::Authorization)
    }
}

async fn put_transaction(
    State(data): State<Data>,
    Path(txn_id): Path<String>,
    headers: HeaderMap,
    Json(txn): Json<intake::ChatTransaction>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_hs_token(&data, &headers)?;
    intake::process_transaction(&data, &txn_id, txn).await?;
    Ok(Json(serde_json::json!({})))
}

/// True if `mxid` belongs to a namespace this bridge's appservice registration claims
/// (ghost users `@_ap_*` or the bridge bot itself), mirroring the `registration` document's
/// namespace regexes (§6).
fn is_claimed_user(mxid: &str, local_domain: &str) -> bool {
    let suffix = format!(":{local_domain}");
    (mxid.starts_with("@_ap_") && mxid.ends_with(&suffix)) || mxid == format!("@fedbridge{suffix}")
}

fn is_claimed_room_alias(alias: &str, local_domain: &str) -> bool {
    alias.starts_with("#_ap_") && alias.ends_with(&format!(":{local_domain}"))
}

async fn get_claimed_user(
    State(data): State<Data>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_hs_token(&data, &headers)?;
    if is_claimed_user(&user_id, &data.settings.local_domain) {
        Ok(Json(serde_json::json!({})))
    } else {
        Err(ApiError(Error::NotFound))
    }
}

async fn get_claimed_room(
    State(data): State<Data>,
    Path(alias): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_hs_token(&data, &headers)?;
    if is_claimed_room_alias(&alias, &data.settings.local_domain) {
        Ok(Json(serde_json::json!({})))
    } else {
        Err(ApiError(Error::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_user_matches_ghost_and_bot_patterns() {
        assert!(is_claimed_user("@_ap_alice_example_com:chat.example", "chat.example"));
        assert!(is_claimed_user("@fedbridge:chat.example", "chat.example"));
        assert!(!is_claimed_user("@alice:chat.example", "chat.example"));
    }

    #[test]
    fn claimed_room_matches_namespace() {
        assert!(is_claimed_room_alias("#_ap_room1:chat.example", "chat.example"));
        assert!(!is_claimed_room_alias("#general:chat.example", "chat.example"));
    }

    #[test]
    fn inbound_host_prefers_signature_keyid_over_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "signature",
            "keyId=\"https://fed.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"AA==\""
                .parse()
                .unwrap(),
        );
        headers.insert("x-forwarded-for", "9.9.9.9".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(inbound_host(&headers, peer), "fed.example");
    }

    #[test]
    fn inbound_host_falls_back_to_forwarded_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "9.9.9.9, 1.1.1.1".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(inbound_host(&headers, peer), "9.9.9.9");

        let headers = HeaderMap::new();
        assert_eq!(inbound_host(&headers, peer), "127.0.0.1");
    }

    #[test]
    fn paginate_urls_reports_has_more_correctly() {
        let items: Vec<Url> = (0..25)
            .map(|i| Url::parse(&format!("https://fed.example/n/{i}")).unwrap())
            .collect();
        let (page0, more0) = paginate_urls(items.clone(), 0);
        assert_eq!(page0.len(), 20);
        assert!(more0);
        let (page1, more1) = paginate_urls(items, 1);
        assert_eq!(page1.len(), 5);
        assert!(!more1);
    }
}
