#![forbid(unsafe_code)]

//! Channel reference resolution. Callers hand over whatever they have
//! (a canonical `UC…` id, an `@handle`, or a channel URL) and get back
//! the canonical channel identity. Successes are cached under both the
//! canonical id and the original reference; concurrent resolves of the
//! same reference share one upstream lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::upstream::{UpstreamClient, encode_query_component};

/// Resolved channel identity as the mirrors report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalChannel {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

/// Canonical ids are `UC` plus 22 characters of the YouTube id alphabet.
pub fn is_canonical_channel_id(value: &str) -> bool {
    value.len() == 24
        && value.starts_with("UC")
        && value[2..]
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-')
}

/// Pulls a channel reference out of a URL: `/channel/<id>` yields the id,
/// `/@<handle>` yields the handle with its `@` prefix kept.
pub fn extract_channel_ref(url: &str) -> Option<String> {
    if let Some((_, rest)) = url.split_once("/channel/") {
        let id = rest.split(['/', '?', '#']).next().unwrap_or("");
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    if let Some((_, rest)) = url.split_once("/@") {
        let handle = rest.split(['/', '?', '#']).next().unwrap_or("");
        if !handle.is_empty() {
            return Some(format!("@{handle}"));
        }
    }
    None
}

type Settled = Option<Arc<CanonicalChannel>>;

#[derive(Debug, Deserialize)]
struct ChannelSearchPage {
    #[serde(default)]
    items: Vec<ChannelSearchItem>,
}

#[derive(Debug, Deserialize)]
struct ChannelSearchItem {
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
}

/// Resolver with a process-lifetime cache. Failed lookups are never
/// cached, so a mirror hiccup does not poison a reference.
pub struct ChannelResolver {
    upstream: Arc<UpstreamClient>,
    cache: RwLock<HashMap<String, Arc<CanonicalChannel>>>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<Settled>>>>,
}

enum Role {
    Owner(watch::Sender<Option<Settled>>),
    Follower(watch::Receiver<Option<Settled>>),
}

impl ChannelResolver {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self {
            upstream,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a channel reference to its canonical identity.
    pub async fn resolve(&self, reference: &str) -> Option<Arc<CanonicalChannel>> {
        let key = reference.trim();
        if key.is_empty() {
            return None;
        }
        if let Some(hit) = self.cache.read().get(key) {
            return Some(hit.clone());
        }

        let role = {
            let mut inflight = self.inflight.lock();
            // Another resolve may have settled while we waited for the lock.
            if let Some(hit) = self.cache.read().get(key) {
                return Some(hit.clone());
            }
            match inflight.get(key) {
                Some(receiver) => Role::Follower(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    inflight.insert(key.to_string(), receiver);
                    Role::Owner(sender)
                }
            }
        };

        match role {
            Role::Follower(mut receiver) => {
                // The guard handed back by `wait_for` borrows the receiver;
                // clone the settled value out so the failure arm can touch
                // the receiver again.
                let settled = receiver
                    .wait_for(Option::is_some)
                    .await
                    .map(|guard| guard.clone());
                match settled {
                    Ok(settled) => settled.flatten(),
                    Err(_) => {
                        // The owner went away without settling; drop the
                        // stale entry so the next resolve starts fresh.
                        let mut inflight = self.inflight.lock();
                        if inflight
                            .get(key)
                            .is_some_and(|current| current.same_channel(&receiver))
                        {
                            inflight.remove(key);
                        }
                        None
                    }
                }
            }
            Role::Owner(sender) => {
                let resolved = self.lookup(key).await.map(Arc::new);
                if let Some(channel) = &resolved {
                    let mut cache = self.cache.write();
                    cache.insert(channel.id.clone(), channel.clone());
                    cache.insert(key.to_string(), channel.clone());
                }
                self.inflight.lock().remove(key);
                let _ = sender.send(Some(resolved.clone()));
                resolved
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<CanonicalChannel> {
        if is_canonical_channel_id(key) {
            return self.fetch_detail(key).await;
        }

        let stripped = key.strip_prefix('@').unwrap_or(key);
        let query = encode_query_component(stripped);
        let page: ChannelSearchPage = self
            .upstream
            .fetch_json(&format!("/search?q={query}&filter=channels"))
            .await?;
        // First channel result whose URL carries a canonical id; results
        // with odd URLs are scanned past, not treated as failure.
        let id = page.items.iter().find_map(|item| {
            if item.kind.as_deref() != Some("channel") {
                return None;
            }
            let url = item.url.as_deref()?;
            if !url.contains("/channel/") {
                return None;
            }
            let id = extract_channel_ref(url)?;
            is_canonical_channel_id(&id).then_some(id)
        })?;
        self.fetch_detail(&id).await
    }

    async fn fetch_detail(&self, ucid: &str) -> Option<CanonicalChannel> {
        let detail: Value = self.upstream.fetch_json(&format!("/channel/{ucid}")).await?;
        // Some mirrors answer 200 with an error payload. The key alone
        // marks failure; its value may be null.
        if detail.get("error").is_some() {
            return None;
        }
        Some(CanonicalChannel {
            id: detail
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(ucid)
                .to_string(),
            name: detail
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            avatar_url: detail
                .get("avatarUrl")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}
