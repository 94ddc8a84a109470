//! Geolocation cache for remote addresses.
//!
//! Wraps an external lookup provider with an address-keyed cache (long TTL
//! for hits, short TTL for failures so transient errors retry sooner), a
//! token-bucket limiter that bounds external calls independently of the
//! poll cadence, and in-flight deduplication so a burst of connections to
//! one remote IP costs a single provider call. Resolution never fails
//! outward: rate-limit exhaustion, provider errors, and timeouts all
//! degrade to a negative entry.

use crate::config::GeoConfig;
use crate::errors::GeoError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};

/// Resolved geography/ownership for one remote address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country_code: String,
    pub country_name: String,
    pub city: String,
    pub isp: String,
    pub resolved_at: DateTime<Local>,
    /// True when this entry records a failed or ratelimited lookup, cached
    /// to avoid hammering the provider.
    pub is_negative: bool,
}

impl GeoInfo {
    /// Synthetic entry for private/loopback/link-local remotes. Never the
    /// result of an external call.
    pub fn local() -> GeoInfo {
        GeoInfo {
            country_code: "LOCAL".to_string(),
            country_name: "Local Network".to_string(),
            city: "Local".to_string(),
            isp: "Local Network".to_string(),
            resolved_at: Local::now(),
            is_negative: false,
        }
    }

    fn negative() -> GeoInfo {
        GeoInfo {
            country_code: String::new(),
            country_name: String::new(),
            city: String::new(),
            isp: String::new(),
            resolved_at: Local::now(),
            is_negative: true,
        }
    }

    fn from_data(data: GeoData) -> GeoInfo {
        GeoInfo {
            country_code: data.country_code,
            country_name: data.country_name,
            city: data.city,
            isp: data.isp,
            resolved_at: Local::now(),
            is_negative: false,
        }
    }
}

/// What a provider returns on success.
#[derive(Debug, Clone)]
pub struct GeoData {
    pub country_code: String,
    pub country_name: String,
    pub city: String,
    pub isp: String,
}

/// External geolocation lookup collaborator.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, addr: IpAddr) -> Result<GeoData, GeoError>;
}

// Token bucket: capacity and refill both come from the configured
// calls-per-second budget, so a burst may spend the whole budget at once
// but the sustained rate stays bounded.
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        TokenBucket {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

struct CacheEntry {
    info: GeoInfo,
    expires_at: Instant,
}

pub struct GeoCache {
    cache: RwLock<HashMap<IpAddr, CacheEntry>>,
    // One watch channel per address with a lookup outstanding. Waiters hold
    // the receiver; the winner's sender drop wakes them to re-read the cache.
    inflight: tokio::sync::Mutex<HashMap<IpAddr, watch::Receiver<()>>>,
    limiter: Mutex<TokenBucket>,
    provider: std::sync::Arc<dyn GeoProvider>,
    positive_ttl: Duration,
    negative_ttl: Duration,
    lookup_timeout: Duration,
}

impl GeoCache {
    pub fn new(config: &GeoConfig, provider: std::sync::Arc<dyn GeoProvider>) -> Self {
        let rate = f64::from(config.rate_limit_per_second);
        GeoCache {
            cache: RwLock::new(HashMap::new()),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            limiter: Mutex::new(TokenBucket::new(rate, rate)),
            provider,
            positive_ttl: Duration::from_secs(config.positive_ttl_seconds),
            negative_ttl: Duration::from_secs(config.negative_ttl_seconds),
            lookup_timeout: Duration::from_millis(config.lookup_timeout_ms),
        }
    }

    /// Resolve one remote address. Local addresses short-circuit to the
    /// synthetic LOCAL entry without touching cache, limiter, or provider.
    /// Bounded by the configured lookup timeout; never fails.
    pub async fn resolve(&self, addr: IpAddr, is_local: bool) -> GeoInfo {
        if is_local {
            return GeoInfo::local();
        }

        loop {
            if let Some(info) = self.cached(addr).await {
                return info;
            }

            // Claim the address, or pick up the receiver for whoever has it.
            let claim = {
                let mut inflight = self.inflight.lock().await;
                match inflight.get(&addr) {
                    Some(rx) => Err(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(());
                        inflight.insert(addr, rx);
                        Ok(tx)
                    }
                }
            };

            match claim {
                Ok(_tx) => {
                    let info = self.resolve_uncached(addr).await;
                    self.store(addr, info.clone()).await;
                    self.inflight.lock().await.remove(&addr);
                    // _tx drops here; waiters wake and re-read the cache.
                    return info;
                }
                Err(mut rx) => {
                    let _ = rx.changed().await;
                }
            }
        }
    }

    async fn resolve_uncached(&self, addr: IpAddr) -> GeoInfo {
        let allowed = self
            .limiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_consume(1.0);
        if !allowed {
            debug!("geo lookup for {} dropped: rate limit exhausted", addr);
            return GeoInfo::negative();
        }

        match tokio::time::timeout(self.lookup_timeout, self.provider.lookup(addr)).await {
            Ok(Ok(data)) => GeoInfo::from_data(data),
            Ok(Err(e)) => {
                debug!("geo lookup for {} failed: {}", addr, e);
                GeoInfo::negative()
            }
            Err(_) => {
                debug!(
                    "geo lookup for {} timed out after {:?}",
                    addr, self.lookup_timeout
                );
                GeoInfo::negative()
            }
        }
    }

    async fn cached(&self, addr: IpAddr) -> Option<GeoInfo> {
        let cache = self.cache.read().await;
        cache.get(&addr).and_then(|entry| {
            if Instant::now() < entry.expires_at {
                Some(entry.info.clone())
            } else {
                None
            }
        })
    }

    async fn store(&self, addr: IpAddr, info: GeoInfo) {
        let ttl = if info.is_negative {
            self.negative_ttl
        } else {
            self.positive_ttl
        };
        let mut cache = self.cache.write().await;
        cache.insert(
            addr,
            CacheEntry {
                info,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
        debug!("geo cache cleared");
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ── ip-api.com provider ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    country_code: Option<String>,
    country: Option<String>,
    city: Option<String>,
    isp: Option<String>,
}

/// Lookup against the free `ip-api.com` JSON endpoint. The provider
/// enforces its own global rate limit; the cache's limiter is what keeps
/// us under it.
pub struct IpApiProvider {
    client: reqwest::Client,
}

impl IpApiProvider {
    pub fn new() -> Self {
        IpApiProvider {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for IpApiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    async fn lookup(&self, addr: IpAddr) -> Result<GeoData, GeoError> {
        let url = format!(
            "http://ip-api.com/json/{}?fields=status,message,countryCode,country,city,isp",
            addr
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GeoError::Request(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GeoError::Request("provider ratelimited (HTTP 429)".to_string()));
        }
        if !resp.status().is_success() {
            return Err(GeoError::Request(format!("HTTP {}", resp.status())));
        }
        let body: IpApiResponse = resp
            .json()
            .await
            .map_err(|e| GeoError::Request(e.to_string()))?;
        if body.status != "success" {
            return Err(GeoError::NotFound(addr));
        }
        Ok(GeoData {
            country_code: body.country_code.unwrap_or_default(),
            country_name: body.country.unwrap_or_default(),
            city: body.city.unwrap_or_default(),
            isp: body.isp.unwrap_or_default(),
        })
    }
}
