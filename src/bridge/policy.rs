//! Policy & moderation (§4.8): block checks applied at ingress and egress, redaction
//! propagation, and report forwarding to a configured admin room.

use crate::{config::Data, db, error::Error};
use diesel::prelude::*;
use url::Url;

/// Per-host instance blocks from startup config plus any admin-wide block rows recorded in the
/// database, merged for egress fan-out filtering (§4.6: "skip delivery to blocked destinations").
pub fn effective_blocked_hosts(data: &Data) -> Result<Vec<String>, Error> {
    use crate::db::schema::blocks;
    let mut hosts = data.settings.blocked_instances.clone();
    let db_hosts: Vec<Option<String>> = db::with_transaction(&data.db, |conn| {
        Ok(blocks::table
            .filter(blocks::blocker_id.is_null())
            .filter(blocks::blocked_instance.is_not_null())
            .select(blocks::blocked_instance)
            .load(conn)?)
    })?;
    hosts.extend(db_hosts.into_iter().flatten());
    hosts.sort();
    hosts.dedup();
    Ok(hosts)
}

/// True if an inbound activity from `actor_host`, optionally addressed to
/// `addressed_local_user_id`, should be dropped (§4.8: "drop inbound activities whose actor host
/// is blocked, or whose actor is blocked by the addressed local user").
pub fn is_ingress_blocked(
    data: &Data,
    actor_host: &str,
    addressed_local_user_id: Option<i64>,
) -> Result<bool, Error> {
    db::with_transaction(&data.db, |conn| {
        db::is_blocked(conn, addressed_local_user_id, None, Some(actor_host))
    })
}

/// Forwards an incoming `Flag` report to the configured admin room, if any (§4.8). Silently a
/// no-op when no admin room is configured — reports aren't dropped from the federation side, just
/// not surfaced anywhere locally.
pub async fn forward_report_to_admin(
    data: &Data,
    reporter: &Url,
    target: &Url,
    object: Option<&Url>,
    reason: Option<&str>,
) -> Result<(), Error> {
    let Some(admin_room) = data.settings.admin_room_chat_id.clone() else {
        return Ok(());
    };

    let mut body = format!("Report from {reporter} against {target}");
    if let Some(object) = object {
        body.push_str(&format!(" (object {object})"));
    }
    if let Some(reason) = reason {
        body.push_str(&format!(": {reason}"));
    }

    crate::bridge::coordinator::send_admin_notice(data, &admin_room, &body).await
}
