//! Follower fan-out: collapses followers sharing a `sharedInbox` into a single delivery job,
//! shared-inbox jobs prioritized, instance-blocked hosts skipped (§4.6).

use std::collections::HashMap;
use url::Url;

/// One delivery target: either a follower's own inbox, or a `sharedInbox` standing in for
/// several followers on the same host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub inbox: Url,
    /// True if this target is a shared inbox collapsing multiple followers; such jobs are
    /// enqueued ahead of individual-inbox jobs (§4.6 "shared inboxes prioritized").
    pub is_shared: bool,
}

/// A follower's delivery-relevant fields, as read from the mapping store.
pub struct FollowerInbox {
    pub inbox: Url,
    pub shared_inbox: Option<Url>,
    pub host: String,
}

/// Collapses `followers` into the minimal set of delivery targets, dropping any whose host is in
/// `blocked_hosts` (§4.6, §4.8), and orders shared-inbox targets first.
pub fn plan_fanout(followers: Vec<FollowerInbox>, blocked_hosts: &[String]) -> Vec<DeliveryTarget> {
    let mut shared: HashMap<String, Url> = HashMap::new();
    let mut individual: Vec<Url> = Vec::new();

    for follower in followers {
        if blocked_hosts.iter().any(|h| h == &follower.host) {
            continue;
        }
        match follower.shared_inbox {
            Some(shared_url) => {
                shared.entry(shared_url.to_string()).or_insert(shared_url);
            }
            None => individual.push(follower.inbox),
        }
    }

    let mut targets: Vec<DeliveryTarget> = shared
        .into_values()
        .map(|inbox| DeliveryTarget {
            inbox,
            is_shared: true,
        })
        .collect();
    targets.extend(individual.into_iter().map(|inbox| DeliveryTarget {
        inbox,
        is_shared: false,
    }));
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbox(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn collapses_shared_inbox_and_prioritizes_it() {
        let followers = vec![
            FollowerInbox {
                inbox: inbox("https://a.example/u/a/inbox"),
                shared_inbox: Some(inbox("https://a.example/inbox")),
                host: "a.example".to_string(),
            },
            FollowerInbox {
                inbox: inbox("https://a.example/u/b/inbox"),
                shared_inbox: Some(inbox("https://a.example/inbox")),
                host: "a.example".to_string(),
            },
            FollowerInbox {
                inbox: inbox("https://c.example/u/c/inbox"),
                shared_inbox: None,
                host: "c.example".to_string(),
            },
        ];
        let targets = plan_fanout(followers, &[]);
        assert_eq!(targets.len(), 2);
        assert!(targets[0].is_shared);
        assert_eq!(targets[0].inbox, inbox("https://a.example/inbox"));
        assert!(!targets[1].is_shared);
        assert_eq!(targets[1].inbox, inbox("https://c.example/u/c/inbox"));
    }

    #[test]
    fn skips_blocked_hosts() {
        let followers = vec![FollowerInbox {
            inbox: inbox("https://blocked.example/u/a/inbox"),
            shared_inbox: None,
            host: "blocked.example".to_string(),
        }];
        let targets = plan_fanout(followers, &["blocked.example".to_string()]);
        assert!(targets.is_empty());
    }
}
