//! Media gateway (§4.3): translates opaque chat media handles to fetchable URLs and back,
//! fetches/validates/caches bytes, and derives thumbnails and blurhash placeholders.
//!
//! Uses a hand-rolled byte-capped LRU (see `media::lru`) rather than `moka`, since the policy is
//! "evict oldest until under a byte budget" rather than TTL/count-based, and a
//! `reqwest`-middleware client for fetches.

pub mod blurhash;
pub mod lru;

use crate::{config::Data, db, error::Error};
use image::{imageops::FilterType, ImageFormat};
use std::time::Duration;
use url::Url;

/// Default byte budget for the in-memory media LRU (§4.3: "default 100 MiB").
pub const DEFAULT_CACHE_CAPACITY_BYTES: usize = 100 * 1024 * 1024;
/// Maximum bytes accepted for a single media fetch, independent of the cache budget.
pub const MAX_FETCH_BYTES: usize = 25 * 1024 * 1024;

/// Byte-capped media cache plus the MIME allow-list media ingestion must satisfy.
pub struct MediaCache {
    lru: lru::MediaLruCache,
    allowed_mime_types: Vec<String>,
}

impl MediaCache {
    pub fn new(capacity_bytes: usize, allowed_mime_types: Vec<String>) -> Self {
        MediaCache {
            lru: lru::MediaLruCache::new(capacity_bytes),
            allowed_mime_types,
        }
    }

    fn mime_allowed(&self, mime_type: &str) -> bool {
        let wildcard_prefix = mime_type.split('/').next().map(|p| format!("{p}/*"));
        self.allowed_mime_types.iter().any(|allowed| {
            allowed == mime_type || wildcard_prefix.as_deref() == Some(allowed.as_str())
        })
    }
}

/// A parsed opaque chat media handle, `<scheme>://<server>/<id>`.
pub struct ParsedHandle {
    pub server: String,
    pub id: String,
}

/// Parses an opaque chat media handle into its server/id components.
pub fn parse_handle(handle: &str) -> Result<ParsedHandle, Error> {
    let without_scheme = handle
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| Error::Validation(format!("malformed media handle: {handle}")))?;
    let (server, id) = without_scheme
        .split_once('/')
        .ok_or_else(|| Error::Validation(format!("malformed media handle: {handle}")))?;
    if server.is_empty() || id.is_empty() {
        return Err(Error::Validation(format!("malformed media handle: {handle}")));
    }
    Ok(ParsedHandle {
        server: server.to_string(),
        id: id.to_string(),
    })
}

/// Builds the local proxy URL for a chat media handle, without fetching (§4.3 "handle→URL").
pub fn handle_to_local_url(handle: &str, base: &Url) -> Result<Url, Error> {
    let parsed = parse_handle(handle)?;
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| Error::other(anyhow::anyhow!("cannot-be-a-base url: {base}")))?
        .push("media")
        .push(&urlencoding_component(&parsed.server))
        .push(&urlencoding_component(&parsed.id));
    Ok(url)
}

fn urlencoding_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Metadata extracted from an image during ingestion (§4.3 "optionally extract image metadata").
#[derive(Debug, Clone, Default)]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub blurhash: Option<String>,
}

/// Downloads `url`, enforces the size and MIME allow-list, extracts image metadata when
/// applicable, uploads the bytes to the homeserver media API, and persists a mapping row
/// (§4.3 "URL→handle").
pub async fn url_to_handle(url: Url, mime_type: &str, data: &Data) -> Result<String, Error> {
    if !data.media_cache.mime_allowed(mime_type) {
        return Err(Error::MediaTypeNotAllowed(mime_type.to_string()));
    }

    let response = data.client.get(url.clone()).send().await.map_err(Error::other)?;
    if !response.status().is_success() {
        return Err(Error::Federation(format!(
            "media fetch failed with status {}",
            response.status()
        )));
    }
    let bytes = response.bytes().await.map_err(Error::other)?;
    if bytes.len() > MAX_FETCH_BYTES {
        return Err(Error::Validation("media exceeds maximum size".to_string()));
    }

    let metadata = extract_image_metadata(&bytes, mime_type);

    let upload_url = {
        let mut u = data.settings.homeserver_url.clone();
        u.set_path("/_matrix/media/v3/upload");
        u
    };
    let upload_response = data
        .client
        .post(upload_url)
        .bearer_auth(&data.settings.appservice_token)
        .header("content-type", mime_type)
        .body(bytes.to_vec())
        .send()
        .await
        .map_err(Error::other)?;
    if !upload_response.status().is_success() {
        return Err(Error::Federation(format!(
            "homeserver media upload failed with status {}",
            upload_response.status()
        )));
    }
    let uploaded: UploadResponse = upload_response.json().await.map_err(Error::other)?;

    let new_media = db::models::NewMedia {
        chat_media_handle: Some(uploaded.content_uri.clone()),
        fed_media_url: Some(url.to_string()),
        mime_type: mime_type.to_string(),
        file_size: bytes.len() as i64,
        width: metadata.width.map(|w| w as i32),
        height: metadata.height.map(|h| h as i32),
        duration_secs: None,
        blurhash: metadata.blurhash,
        alt_text: None,
    };
    db::with_transaction(&data.db, |conn| db::upsert_media(conn, &new_media))?;

    data.media_cache.lru.insert(format!("handle:{url}"), bytes.to_vec());
    Ok(uploaded.content_uri)
}

#[derive(serde::Deserialize)]
struct UploadResponse {
    content_uri: String,
}

/// Decodes `bytes` as an image (ignoring non-image MIME types), auto-rotates via EXIF
/// orientation, and computes dimensions plus a blurhash placeholder (§4.3).
pub fn extract_image_metadata(bytes: &[u8], mime_type: &str) -> ImageMetadata {
    if !mime_type.starts_with("image/") {
        return ImageMetadata::default();
    }
    let Ok(format) = image::guess_format(bytes) else {
        return ImageMetadata::default();
    };
    let Ok(mut decoded) = image::load_from_memory_with_format(bytes, format) else {
        return ImageMetadata::default();
    };
    if format == ImageFormat::Jpeg {
        if let Some(orientation) = jpeg_exif_orientation(bytes) {
            decoded = apply_orientation(decoded, orientation);
        }
    }
    ImageMetadata {
        width: Some(decoded.width()),
        height: Some(decoded.height()),
        blurhash: Some(blurhash::encode(&decoded, 4, 3)),
    }
}

/// Applies the 8 standard EXIF orientation values to `image` (§4.3 "auto-rotated via EXIF
/// orientation").
fn apply_orientation(image: image::DynamicImage, orientation: u16) -> image::DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Minimal EXIF orientation reader: scans JPEG APP1 (`Exif`) segments for the big/little-endian
/// TIFF header and the orientation tag (0x0112) without a full EXIF parser.
fn jpeg_exif_orientation(bytes: &[u8]) -> Option<u16> {
    let mut pos = 2; // skip SOI marker
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            break;
        }
        let marker = bytes[pos + 1];
        let segment_len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if marker == 0xE1 && segment_len >= 8 {
            let segment = &bytes[pos + 4..(pos + 2 + segment_len).min(bytes.len())];
            if segment.starts_with(b"Exif\0\0") {
                return parse_tiff_orientation(&segment[6..]);
            }
        }
        if marker == 0xDA {
            break; // start of scan, no more metadata segments
        }
        pos += 2 + segment_len;
    }
    None
}

fn parse_tiff_orientation(tiff: &[u8]) -> Option<u16> {
    if tiff.len() < 8 {
        return None;
    }
    let little_endian = &tiff[0..2] == b"II";
    let read_u16 = |b: &[u8]| if little_endian { u16::from_le_bytes([b[0], b[1]]) } else { u16::from_be_bytes([b[0], b[1]]) };
    let read_u32 = |b: &[u8]| {
        if little_endian {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        }
    };
    let ifd_offset = read_u32(&tiff[4..8]) as usize;
    if ifd_offset + 2 > tiff.len() {
        return None;
    }
    let entry_count = read_u16(&tiff[ifd_offset..ifd_offset + 2]) as usize;
    for i in 0..entry_count {
        let entry_offset = ifd_offset + 2 + i * 12;
        if entry_offset + 12 > tiff.len() {
            break;
        }
        let tag = read_u16(&tiff[entry_offset..entry_offset + 2]);
        if tag == 0x0112 {
            return Some(read_u16(&tiff[entry_offset + 8..entry_offset + 10]));
        }
    }
    None
}

/// Fit-inside resize (no upscale), re-encoded as JPEG (§4.3 "thumbnail endpoint").
pub fn thumbnail_jpeg(bytes: &[u8], max_width: u32, max_height: u32) -> Result<Vec<u8>, Error> {
    let image = image::load_from_memory(bytes).map_err(Error::other)?;
    let (width, height) = (image.width(), image.height());
    let resized = if width > max_width || height > max_height {
        image.resize(max_width, max_height, FilterType::Triangle)
    } else {
        image
    };
    let mut out = Vec::new();
    resized
        .write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Jpeg)
        .map_err(Error::other)?;
    Ok(out)
}

/// Proxy GET: fetches media bytes from the homeserver download API, serving from the LRU cache
/// when present (§4.3 "Proxy GET").
pub async fn proxy_get(server: &str, id: &str, data: &Data) -> Result<Vec<u8>, Error> {
    let cache_key = format!("handle:mxc://{server}/{id}");
    if let Some(cached) = data.media_cache.lru.get(&cache_key) {
        return Ok(cached);
    }
    let download_url = {
        let mut u = data.settings.homeserver_url.clone();
        u.set_path(&format!("/_matrix/media/v3/download/{server}/{id}"));
        u
    };
    let response = data
        .client
        .get(download_url)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(Error::other)?;
    if !response.status().is_success() {
        return Err(Error::NotFound);
    }
    let bytes = response.bytes().await.map_err(Error::other)?.to_vec();
    data.media_cache.lru.insert(cache_key, bytes.clone());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_handle() {
        let parsed = parse_handle("mxc://matrix.example/abc123").unwrap();
        assert_eq!(parsed.server, "matrix.example");
        assert_eq!(parsed.id, "abc123");
    }

    #[test]
    fn rejects_malformed_handle() {
        assert!(parse_handle("not-a-handle").is_err());
    }

    #[test]
    fn handle_to_local_url_encodes_segments() {
        let base = Url::parse("https://fed.example/").unwrap();
        let url = handle_to_local_url("mxc://matrix.example/abc 123", &base).unwrap();
        assert_eq!(url.as_str(), "https://fed.example/media/matrix.example/abc%20123");
    }

    #[test]
    fn mime_allow_list_supports_wildcard() {
        let cache = MediaCache::new(1024, vec!["image/*".to_string()]);
        assert!(cache.mime_allowed("image/png"));
        assert!(!cache.mime_allowed("video/mp4"));
    }
}
