//! Network difficulty, for capping worker difficulty.
//!
//! Asking the node on every share would be wasteful and would put a network
//! round trip on the share path. Instead [`NetworkDifficultyCache`] keeps the
//! last value it fetched and refreshes it in a detached task once it is older
//! than the configured interval. Readers only ever see the cached value,
//! which may be stale (or absent right after startup).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::runtime::Handle;

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::Timestamp;

/// Seconds to wait after a failed fetch before trying again.
pub const FAILURE_BACKOFF_SECS: i64 = 30;

/// Supplier of the current network difficulty.
#[async_trait]
pub trait NetworkDifficultySource: Send + Sync {
    async fn network_difficulty(&self) -> Result<f64>;
}

/// A fetched network difficulty and when it was fetched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedDifficulty {
    pub difficulty: f64,
    pub fetched_at: Timestamp,
}

#[derive(Debug, Default)]
struct CacheState {
    value: Option<CachedDifficulty>,
    in_flight: bool,
    last_failure: Option<Timestamp>,
}

struct InFlight(Arc<Mutex<CacheState>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.lock().in_flight = false;
    }
}

impl CacheState {
    fn is_stale(&self, now: Timestamp, refresh_interval: i64) -> bool {
        match self.value {
            None => true,
            Some(cached) => cached.fetched_at < now - refresh_interval,
        }
    }
}

/// Shared, lazily refreshed network difficulty.
///
/// Cheap to clone; clones share the cached value.
#[derive(Clone)]
pub struct NetworkDifficultyCache {
    source: Arc<dyn NetworkDifficultySource>,
    refresh_interval: i64,
    state: Arc<Mutex<CacheState>>,
}

impl NetworkDifficultyCache {
    pub fn new(source: Arc<dyn NetworkDifficultySource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            refresh_interval: refresh_interval.as_secs() as i64,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Cached network difficulty, if one has ever been fetched.
    pub fn current(&self) -> Option<f64> {
        self.state.lock().value.map(|v| v.difficulty)
    }

    pub fn cached(&self) -> Option<CachedDifficulty> {
        self.state.lock().value
    }

    /// Whether a fetch is in progress.
    pub fn is_refreshing(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Whether the cached value is missing or older than the refresh interval.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.state.lock().is_stale(now, self.refresh_interval)
    }

    /// Start a background fetch if the cached value is stale.
    ///
    /// Returns immediately; the result only benefits later readers. At most
    /// one fetch runs at a time, and none starts within
    /// [`FAILURE_BACKOFF_SECS`] of a failed one. Returns whether a fetch was
    /// started.
    pub fn refresh_if_stale(&self, now: Timestamp) -> bool {
        let runtime = {
            let mut state = self.state.lock();
            if state.in_flight {
                return false;
            }
            if !state.is_stale(now, self.refresh_interval) {
                return false;
            }
            if let Some(failed_at) = state.last_failure {
                if (0..FAILURE_BACKOFF_SECS).contains(&(now - failed_at)) {
                    return false;
                }
            }
            let Ok(runtime) = Handle::try_current() else {
                drop(state);
                warn!("No async runtime, cannot refresh network difficulty");
                return false;
            };
            state.in_flight = true;
            runtime
        };

        // Cleared however the task ends, including a panicking source.
        let in_flight = InFlight(self.state.clone());
        let cache = self.clone();
        runtime.spawn(async move {
            let _in_flight = in_flight;
            let result = cache.source.network_difficulty().await.and_then(usable);
            cache.store_result(now, &result);
        });
        true
    }

    /// Fetch now and wait for the result.
    ///
    /// Used to prime the cache at startup. Does not go through the
    /// staleness or backoff checks.
    pub async fn refresh(&self, now: Timestamp) -> Result<f64> {
        let result = self.source.network_difficulty().await.and_then(usable);
        self.store_result(now, &result);
        result
    }

    fn store_result(&self, now: Timestamp, result: &Result<f64>) {
        let previous = {
            let mut state = self.state.lock();
            match result {
                Ok(difficulty) => {
                    state.value = Some(CachedDifficulty {
                        difficulty: *difficulty,
                        fetched_at: now,
                    });
                    state.last_failure = None;
                }
                Err(_) => state.last_failure = Some(now),
            }
            state.value
        };

        match result {
            Ok(difficulty) => debug!(difficulty, "Updated network difficulty"),
            Err(e) => warn!(
                error = %e,
                cached = ?previous.map(|v| v.difficulty),
                "Failed to refresh network difficulty, keeping cached value"
            ),
        }
    }
}

fn usable(difficulty: f64) -> Result<f64> {
    if difficulty.is_finite() && difficulty > 0.0 {
        Ok(difficulty)
    } else {
        Err(Error::Rpc(format!("unusable network difficulty {}", difficulty)))
    }
}

/// JSON-RPC client for a bitcoind-style node's `getdifficulty`.
#[derive(Debug, Clone)]
pub struct BitcoinRpc {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
}

impl BitcoinRpc {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl NetworkDifficultySource for BitcoinRpc {
    async fn network_difficulty(&self) -> Result<f64> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "vardiff",
            "method": "getdifficulty",
            "params": [],
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        trace!(%status, body = %text, "getdifficulty response");

        // Nodes report RPC errors with a non-2xx status but a JSON body, so
        // try the body first.
        parse_difficulty_response(&text).map_err(|e| match e {
            Error::Rpc(msg) if !status.is_success() => {
                Error::Rpc(format!("HTTP {}: {}", status, msg))
            }
            other => other,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<DifficultyResult>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DifficultyResult {
    Plain(f64),
    // Multi-algorithm chains report one difficulty per algorithm.
    PerAlgorithm {
        #[serde(rename = "proof-of-work")]
        proof_of_work: f64,
    },
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

fn parse_difficulty_response(text: &str) -> Result<f64> {
    let response: RpcResponse = serde_json::from_str(text)
        .map_err(|e| Error::Rpc(format!("unparseable getdifficulty response: {}", e)))?;

    if let Some(error) = response.error {
        return Err(Error::Rpc(format!(
            "getdifficulty failed ({}): {}",
            error.code, error.message
        )));
    }

    match response.result {
        Some(DifficultyResult::Plain(difficulty)) => Ok(difficulty),
        Some(DifficultyResult::PerAlgorithm { proof_of_work }) => Ok(proof_of_work),
        None => Err(Error::Rpc("getdifficulty returned no result".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Source that replays canned answers, optionally waiting on a gate.
    #[derive(Default)]
    struct ScriptedSource {
        answers: Mutex<VecDeque<Result<f64>>>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedSource {
        fn new(answers: Vec<Result<f64>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NetworkDifficultySource for ScriptedSource {
        async fn network_difficulty(&self) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Rpc("no more answers".into())))
        }
    }

    async fn settle(cache: &NetworkDifficultyCache) {
        while cache.is_refreshing() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_first_refresh_populates_cache() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(5000.0)]));
        let cache = NetworkDifficultyCache::new(source.clone(), Duration::from_secs(600));

        assert_eq!(cache.current(), None);
        assert!(cache.is_stale(1_000));
        assert!(cache.refresh_if_stale(1_000));
        settle(&cache).await;

        assert_eq!(
            cache.cached(),
            Some(CachedDifficulty {
                difficulty: 5000.0,
                fetched_at: 1_000
            })
        );
        assert!(!cache.is_stale(1_600));
        assert!(cache.is_stale(1_601));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_fresh_value_is_not_refetched() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(5000.0), Ok(6000.0)]));
        let cache = NetworkDifficultyCache::new(source.clone(), Duration::from_secs(600));

        cache.refresh_if_stale(1_000);
        settle(&cache).await;
        assert!(!cache.refresh_if_stale(1_300));
        assert_eq!(source.calls(), 1);

        assert!(cache.refresh_if_stale(1_700));
        settle(&cache).await;
        assert_eq!(cache.current(), Some(6000.0));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_single_fetch_in_flight() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(ScriptedSource {
            answers: Mutex::new(vec![Ok(7000.0)].into()),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let cache = NetworkDifficultyCache::new(source.clone(), Duration::from_secs(600));

        assert!(cache.refresh_if_stale(1_000));
        assert!(!cache.refresh_if_stale(1_001));
        assert!(!cache.refresh_if_stale(1_002));

        // Let the fetch start and park on the gate.
        while source.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(cache.is_refreshing());
        assert_eq!(cache.current(), None);

        gate.notify_one();
        settle(&cache).await;
        assert_eq!(cache.current(), Some(7000.0));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_stale_value_and_backs_off() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(5000.0),
            Err(Error::Rpc("connection refused".into())),
            Ok(8000.0),
        ]));
        let cache = NetworkDifficultyCache::new(source.clone(), Duration::from_secs(600));

        cache.refresh_if_stale(1_000);
        settle(&cache).await;

        assert!(cache.refresh_if_stale(2_000));
        settle(&cache).await;
        assert_eq!(cache.current(), Some(5000.0));

        // Within the backoff nothing is attempted.
        assert!(!cache.refresh_if_stale(2_000 + FAILURE_BACKOFF_SECS - 1));
        assert_eq!(source.calls(), 2);

        assert!(cache.refresh_if_stale(2_000 + FAILURE_BACKOFF_SECS));
        settle(&cache).await;
        assert_eq!(cache.current(), Some(8000.0));
    }

    #[tokio::test]
    async fn test_unusable_value_is_rejected() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(0.0), Ok(f64::NAN)]));
        let cache = NetworkDifficultyCache::new(source, Duration::from_secs(600));

        cache.refresh_if_stale(1_000);
        settle(&cache).await;
        assert_eq!(cache.current(), None);

        assert!(cache.refresh(1_001).await.is_err());
        assert_eq!(cache.current(), None);
    }

    #[tokio::test]
    async fn test_refresh_waits_for_value() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(1234.5)]));
        let cache = NetworkDifficultyCache::new(source, Duration::from_secs(600));
        assert_eq!(cache.refresh(50).await.unwrap(), 1234.5);
        assert_eq!(cache.current(), Some(1234.5));
    }

    /// Source whose first fetch panics.
    #[derive(Default)]
    struct PanicOnceSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NetworkDifficultySource for PanicOnceSource {
        async fn network_difficulty(&self) -> Result<f64> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("node client bug");
            }
            Ok(4096.0)
        }
    }

    #[tokio::test]
    async fn test_panicking_fetch_does_not_wedge_refresh() {
        let source = Arc::new(PanicOnceSource::default());
        let cache = NetworkDifficultyCache::new(source.clone(), Duration::from_secs(600));

        assert!(cache.refresh_if_stale(1_000));
        settle(&cache).await;
        assert_eq!(cache.current(), None);

        assert!(cache.refresh_if_stale(1_001));
        settle(&cache).await;
        assert_eq!(cache.current(), Some(4096.0));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fresh_cache_needs_no_runtime() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(5000.0)]));
        let cache = NetworkDifficultyCache::new(source.clone(), Duration::from_secs(600));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(cache.refresh(1_000)).unwrap();
        drop(runtime);

        assert!(!cache.refresh_if_stale(1_100));
        assert!(!cache.is_refreshing());
        assert_eq!(cache.current(), Some(5000.0));
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_refresh_without_runtime() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(1.0)]));
        let cache = NetworkDifficultyCache::new(source.clone(), Duration::from_secs(600));
        assert!(!cache.refresh_if_stale(1_000));
        assert!(!cache.is_refreshing());
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn test_parse_plain_result() {
        let text = r#"{"result":88104191118793.0,"error":null,"id":"vardiff"}"#;
        assert_eq!(parse_difficulty_response(text).unwrap(), 88104191118793.0);
    }

    #[test]
    fn test_parse_per_algorithm_result() {
        let text = r#"{"result":{"proof-of-work":1534.5,"proof-of-stake":2.1},"error":null,"id":"vardiff"}"#;
        assert_eq!(parse_difficulty_response(text).unwrap(), 1534.5);
    }

    #[test]
    fn test_parse_rpc_error() {
        let text = r#"{"result":null,"error":{"code":-28,"message":"Loading block index..."},"id":"vardiff"}"#;
        let err = parse_difficulty_response(text).unwrap_err();
        assert!(err.to_string().contains("Loading block index"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_difficulty_response("<html>502 Bad Gateway</html>"),
            Err(Error::Rpc(_))
        ));
    }
}
