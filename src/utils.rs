use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::error::{RateLimitError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Separator between the parts of a store key
pub const KEY_SEPARATOR: char = ':';

/// Source of the current time in epoch milliseconds
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall-clock time source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Time source that only moves when told to. Used by tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Logical route identifier that namespaces an independent limit.
///
/// Route names end up inside store keys, so they must be non-empty and may not
/// contain the key separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteName(String);

impl RouteName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RateLimitError::InvalidRoute(
                "route name must not be empty".to_string(),
            ));
        }
        if name.contains(KEY_SEPARATOR) || name.chars().any(char::is_whitespace) {
            return Err(RateLimitError::InvalidRoute(format!(
                "route name {:?} must not contain whitespace or '{}'",
                name, KEY_SEPARATOR
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RouteName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RouteName {
    type Error = RateLimitError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RouteName> for String {
    fn from(route: RouteName) -> Self {
        route.0
    }
}

/// Keyed one-way digest of (client, route) pairs.
///
/// Raw client addresses never reach the store; only this digest does.
#[derive(Clone)]
pub struct KeyHasher {
    mac: HmacSha256,
}

impl KeyHasher {
    pub fn new(salt: &str) -> Result<Self> {
        if salt.is_empty() {
            return Err(RateLimitError::Config(
                "rate limit salt must not be empty".to_string(),
            ));
        }
        let mac = HmacSha256::new_from_slice(salt.as_bytes())
            .map_err(|e| RateLimitError::Config(format!("Invalid salt: {}", e)))?;
        Ok(Self { mac })
    }

    /// Digest of `client_address + route`, URL-safe base64 without padding
    pub fn digest(&self, client_address: &str, route: &RouteName) -> String {
        let mut mac = self.mac.clone();
        mac.update(client_address.as_bytes());
        mac.update(route.as_str().as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for KeyHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyHasher(..)")
    }
}

/// Generate the store key for a (route, digest) pair
pub fn generate_cache_key(prefix: &str, route: &RouteName, digest: &str) -> String {
    if prefix.is_empty() {
        format!("{}{}{}", route, KEY_SEPARATOR, digest)
    } else {
        format!("{}{}{}{}{}", prefix, KEY_SEPARATOR, route, KEY_SEPARATOR, digest)
    }
}

/// Pattern matching every key under `prefix`
pub fn key_pattern(prefix: &str) -> String {
    if prefix.is_empty() {
        "*".to_string()
    } else {
        format!("{}{}*", prefix, KEY_SEPARATOR)
    }
}

/// Sorted-set member for an event recorded at `now_millis`.
///
/// Two events in the same millisecond must not collapse into one member.
pub fn event_member(now_millis: u64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("{}-{}", now_millis, suffix)
}

/// Whole seconds until `reset_time`, rounded up and never below one
pub fn retry_after_secs(reset_time: u64, now_millis: u64) -> u64 {
    let millis = reset_time.saturating_sub(now_millis);
    millis.div_ceil(1000).max(1)
}
