#![forbid(unsafe_code)]

//! Piped mirror pool and instance discovery. The pool is an atomically
//! swappable ranked list of base URLs; discovery periodically rebuilds it
//! from the public registry, health-checking every advertised instance
//! and always keeping the configured fallbacks at the tail.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::RwLock;
use reqwest::header;
use serde::Deserialize;
use tracing::{info, warn};

/// Some mirrors answer interstitial HTML unless the request looks like a
/// browser, so probes and fan-out attempts share these headers.
pub const PIPED_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; rv:131.0) Gecko/20100101 Firefox/131.0";

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(8);
const PROBE_TIMEOUT: Duration = Duration::from_secs(6);
const PROBE_PATH: &str = "/trending?region=US";

/// Shared, swappable list of mirror base URLs in failover order.
///
/// Readers take an `Arc` snapshot, so a discovery swap mid-request never
/// changes the list an in-progress fan-out is iterating.
pub struct MirrorPool {
    mirrors: RwLock<Arc<Vec<String>>>,
}

impl MirrorPool {
    pub fn new(initial: impl IntoIterator<Item = String>) -> Self {
        Self {
            mirrors: RwLock::new(Arc::new(normalize_mirrors(initial))),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.mirrors.read().clone()
    }

    pub fn replace(&self, mirrors: impl IntoIterator<Item = String>) {
        *self.mirrors.write() = Arc::new(normalize_mirrors(mirrors));
    }

    pub fn len(&self) -> usize {
        self.mirrors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trims entries, strips trailing slashes, drops blanks, and dedupes
/// while preserving first-seen order.
pub fn normalize_mirrors(mirrors: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut normalized = Vec::new();
    for mirror in mirrors {
        let trimmed = mirror.trim().trim_end_matches('/').to_string();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.clone()) {
            normalized.push(trimmed);
        }
    }
    normalized
}

/// One entry of the public instance registry. Uptime is only consulted
/// while ranking candidates; it is never stored in the pool.
#[derive(Debug, Deserialize)]
pub struct RegistryInstance {
    pub api_url: String,
    #[serde(default)]
    pub uptime_24h: Option<f64>,
}

/// HTTPS instances from the registry, best 24h uptime first. Instances
/// without an uptime figure sort last.
pub fn ranked_candidates(instances: Vec<RegistryInstance>) -> Vec<String> {
    let mut usable: Vec<RegistryInstance> = instances
        .into_iter()
        .filter(|instance| instance.api_url.starts_with("https://"))
        .collect();
    usable.sort_by(|a, b| {
        b.uptime_24h
            .unwrap_or(0.0)
            .total_cmp(&a.uptime_24h.unwrap_or(0.0))
    });
    usable.into_iter().map(|instance| instance.api_url).collect()
}

/// Periodic registry scan + health check that feeds the pool.
#[derive(Clone)]
pub struct MirrorDiscovery {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    pool: Arc<MirrorPool>,
    /// Registry fetches follow redirects like any ordinary API call.
    registry: reqwest::Client,
    /// Probes must not follow redirects: a redirecting mirror is broken.
    probe: reqwest::Client,
    registry_url: String,
    fallbacks: Vec<String>,
    busy: AtomicBool,
}

impl MirrorDiscovery {
    pub fn new(
        pool: Arc<MirrorPool>,
        probe: reqwest::Client,
        registry_url: String,
        fallbacks: Vec<String>,
    ) -> Result<Self> {
        let registry = reqwest::Client::builder()
            .build()
            .context("building registry HTTP client")?;
        Ok(Self {
            inner: Arc::new(DiscoveryInner {
                pool,
                registry,
                probe,
                registry_url,
                fallbacks,
                busy: AtomicBool::new(false),
            }),
        })
    }

    /// Runs one discovery cycle. A failure keeps the previous pool; a
    /// cycle already in progress makes this call return immediately.
    pub async fn refresh(&self) {
        if self.inner.busy.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.discover().await {
            Ok(healthy) => {
                info!(
                    healthy,
                    pool = self.inner.pool.len(),
                    "discovered healthy piped instances"
                );
            }
            Err(err) => {
                warn!(error = %err, "instance discovery failed, keeping previous mirrors");
            }
        }
        self.inner.busy.store(false, Ordering::SeqCst);
    }

    async fn discover(&self) -> Result<usize> {
        let inner = &self.inner;
        let response = inner
            .registry
            .get(&inner.registry_url)
            .timeout(REGISTRY_TIMEOUT)
            .send()
            .await
            .context("fetching instance registry")?;
        if !response.status().is_success() {
            bail!("instance registry answered {}", response.status());
        }
        let instances: Vec<RegistryInstance> = response
            .json()
            .await
            .context("decoding instance registry")?;
        let candidates = ranked_candidates(instances);

        // Probe everything concurrently but collect in candidate order so
        // healthy mirrors keep their uptime ranking.
        let mut probes = Vec::with_capacity(candidates.len());
        for url in candidates {
            let client = inner.probe.clone();
            probes.push(tokio::spawn(async move {
                if probe_mirror(&client, &url).await {
                    Some(url)
                } else {
                    None
                }
            }));
        }
        let mut working = Vec::new();
        for probe in probes {
            if let Ok(Some(url)) = probe.await {
                working.push(url);
            }
        }

        let healthy = working.len();
        let mut merged = working;
        merged.extend(inner.fallbacks.iter().cloned());
        if !merged.is_empty() {
            inner.pool.replace(merged);
        }
        Ok(healthy)
    }

    /// Initial refresh plus periodic re-runs on a background task.
    /// `interval` of `None` means a single startup scan.
    pub fn spawn(self, interval: Option<Duration>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.refresh().await;
            let Some(every) = interval else {
                return;
            };
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the startup refresh
            // above already covered it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.refresh().await;
            }
        })
    }
}

/// A mirror is healthy when the probe endpoint answers 2xx JSON without
/// redirecting.
async fn probe_mirror(client: &reqwest::Client, base: &str) -> bool {
    let url = format!("{}{}", base.trim_end_matches('/'), PROBE_PATH);
    let response = match client
        .get(&url)
        .timeout(PROBE_TIMEOUT)
        .header(header::USER_AGENT, PIPED_USER_AGENT)
        .header(header::ACCEPT, "application/json")
        .send()
        .await
    {
        Ok(response) => response,
        Err(_) => return false,
    };
    if !response.status().is_success() {
        return false;
    }
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .contains("json")
}
