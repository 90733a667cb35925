use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::address::Address;
use crate::config::CacheConfig;
use crate::error::Error;
use crate::query::retry::RetryPolicy;

/// Identifies a cached query.
///
/// `scope` ties an entry to a wallet address so that switching accounts can
/// drop everything fetched for the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    name: String,
    params: Vec<String>,
    scope: Option<String>,
}

impl QueryKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            scope: None,
        }
    }

    pub fn param(mut self, value: impl ToString) -> Self {
        self.params.push(value.to_string());
        self
    }

    pub fn scoped(mut self, address: &Address) -> Self {
        self.scope = Some(address.to_lower_hex());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.params.is_empty() {
            write!(f, "[{}]", self.params.join(","))?;
        }
        if let Some(scope) = &self.scope {
            write!(f, "@{scope}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Age after which cached data is served but refreshed in the background.
    pub stale_time: Duration,
    /// Period of the background refetch, if any.
    pub refetch_interval: Option<Duration>,
    /// How long an unused entry survives [`QueryClient::collect_garbage`].
    pub gc_time: Duration,
    pub enabled: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl QueryOptions {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            stale_time: Duration::from_secs(config.stale_time_secs),
            refetch_interval: (config.refetch_interval_secs > 0)
                .then(|| Duration::from_secs(config.refetch_interval_secs)),
            gc_time: Duration::from_secs(config.gc_time_secs),
            enabled: true,
        }
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn refetch_interval(mut self, interval: Option<Duration>) -> Self {
        self.refetch_interval = interval;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Fetching,
    Success,
    Stale,
    Error,
}

/// What a caller gets back from [`QueryClient::query`].
#[derive(Debug, Clone)]
pub struct QueryResult<V> {
    pub data: Option<V>,
    pub status: QueryStatus,
    pub error: Option<Error>,
    pub is_loading: bool,
}

impl<V> QueryResult<V> {
    fn idle() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            is_loading: false,
        }
    }

    /// Data when there is any, otherwise the error. A disabled query yields
    /// `Ok(None)`.
    pub fn into_result(self) -> Result<Option<V>, Error> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(Some(data)),
            (None, Some(err)) => Err(err),
            (None, None) => Ok(None),
        }
    }
}

type Erased = Arc<dyn Any + Send + Sync>;
type ErrorObserver = dyn Fn(&QueryKey, &Error) + Send + Sync;

struct Entry {
    value: Option<Erased>,
    status: QueryStatus,
    fetched_at: Option<Instant>,
    last_error: Option<Error>,
    last_access: Instant,
    options: QueryOptions,
    refreshing: bool,
}

impl Entry {
    fn new(options: QueryOptions, now: Instant) -> Self {
        Self {
            value: None,
            status: QueryStatus::Idle,
            fetched_at: None,
            last_error: None,
            last_access: now,
            options,
            refreshing: false,
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        match self.fetched_at {
            Some(at) => now.saturating_duration_since(at) >= self.options.stale_time,
            None => true,
        }
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<QueryKey, Entry>,
    /// Bumped on every invalidation. Never shrinks, so a key dropped and
    /// re-created still rejects results from before the drop.
    generations: HashMap<QueryKey, u64>,
}

impl State {
    fn generation(&self, key: &QueryKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &QueryKey) {
        *self.generations.entry(key.clone()).or_insert(0) += 1;
    }

    fn invalidate_where(&mut self, pred: impl Fn(&QueryKey) -> bool) -> usize {
        let keys: HashSet<QueryKey> = self
            .entries
            .keys()
            .chain(self.generations.keys())
            .filter(|k| pred(k))
            .cloned()
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
            self.bump(&key);
        }
        removed
    }
}

struct Inner {
    state: Mutex<State>,
    retry: RetryPolicy,
    observer: Mutex<Option<Arc<ErrorObserver>>>,
}

impl Inner {
    async fn run_fetch<V, F, Fut>(&self, key: &QueryKey, fetcher: &F) -> Result<V, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, Error>>,
    {
        let label = key.to_string();
        self.retry.run(&label, fetcher).await
    }

    /// Store a fetch result unless the key was invalidated since `generation`.
    fn settle<V>(&self, key: &QueryKey, generation: u64, options: QueryOptions, result: &Result<V, Error>)
    where
        V: Clone + Send + Sync + 'static,
    {
        if let Err(e) = result {
            let observer = self.observer.lock().clone();
            if let Some(observer) = observer {
                observer(key, e);
            }
        }

        let mut state = self.state.lock();
        if state.generation(key) != generation {
            tracing::debug!(key = %key, "discarding result for invalidated query");
            return;
        }
        let now = Instant::now();
        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(options, now));
        entry.refreshing = false;
        match result {
            Ok(value) => {
                entry.value = Some(Arc::new(value.clone()));
                entry.status = QueryStatus::Success;
                entry.fetched_at = Some(now);
                entry.last_error = None;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "query failed");
                entry.status = QueryStatus::Error;
                entry.last_error = Some(e.clone());
            }
        }
    }
}

/// Cache for async queries with stale-while-revalidate semantics.
///
/// Every fetch goes through the [`RetryPolicy`]. Rate limiting happens one
/// level down, per outbound request (see
/// [`RateLimited`](crate::query::rate_limiter::RateLimited)). Cloning shares
/// the cache.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<Inner>,
}

impl QueryClient {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                retry,
                observer: Mutex::new(None),
            }),
        }
    }

    /// Called with every failed fetch, foreground or background.
    pub fn set_error_observer<F>(&self, observer: F)
    where
        F: Fn(&QueryKey, &Error) + Send + Sync + 'static,
    {
        *self.inner.observer.lock() = Some(Arc::new(observer));
    }

    /// Serve `key` from cache or fetch it.
    ///
    /// Cached data is returned immediately; if it is older than the stale
    /// time one background refresh is started. Without cached data the
    /// fetch runs now and its outcome is returned.
    pub async fn query<V, F, Fut>(&self, key: QueryKey, options: QueryOptions, fetcher: F) -> QueryResult<V>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        if !options.enabled {
            return QueryResult::idle();
        }

        let generation = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            let generation = state.generation(&key);
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(options, now));
            entry.last_access = now;
            entry.options = options;

            let cached = entry
                .value
                .clone()
                .and_then(|v| v.downcast::<V>().ok())
                .map(|v| (*v).clone());

            if let Some(data) = cached {
                let stale = entry.is_stale(now);
                if stale && !entry.refreshing {
                    entry.refreshing = true;
                    entry.status = QueryStatus::Stale;
                    self.spawn_refresh(key.clone(), generation, options, fetcher);
                }
                return QueryResult {
                    data: Some(data),
                    status: if stale { QueryStatus::Stale } else { QueryStatus::Success },
                    error: entry.last_error.clone(),
                    is_loading: false,
                };
            }

            entry.status = QueryStatus::Fetching;
            generation
        };

        let result = self.inner.run_fetch(&key, &fetcher).await;
        self.inner.settle(&key, generation, options, &result);

        match result {
            Ok(data) => QueryResult {
                data: Some(data),
                status: QueryStatus::Success,
                error: None,
                is_loading: false,
            },
            Err(e) => QueryResult {
                data: None,
                status: QueryStatus::Error,
                error: Some(e),
                is_loading: false,
            },
        }
    }

    fn spawn_refresh<V, F, Fut>(&self, key: QueryKey, generation: u64, options: QueryOptions, fetcher: F)
    where
        V: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        let inner = self.inner.clone();
        tracing::debug!(key = %key, "refreshing stale query");
        tokio::spawn(async move {
            let result = inner.run_fetch(&key, &fetcher).await;
            inner.settle(&key, generation, options, &result);
        });
    }

    /// Cached data for `key`, regardless of age.
    pub fn get_cached<V: Clone + 'static>(&self, key: &QueryKey) -> Option<V> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.downcast_ref::<V>())
            .cloned()
    }

    /// Replace cached data, e.g. after an optimistic local update.
    ///
    /// Fetches already in flight for `key` will not overwrite it.
    pub fn set_data<V: Send + Sync + 'static>(&self, key: QueryKey, options: QueryOptions, data: V) {
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        state.bump(&key);
        let entry = state
            .entries
            .entry(key)
            .or_insert_with(|| Entry::new(options, now));
        entry.value = Some(Arc::new(data));
        entry.status = QueryStatus::Success;
        entry.fetched_at = Some(now);
        entry.last_access = now;
        entry.last_error = None;
        entry.refreshing = false;
    }

    pub fn status(&self, key: &QueryKey) -> Option<QueryStatus> {
        self.inner.state.lock().entries.get(key).map(|e| e.status)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `key`. Fetches already in flight for it will not be stored.
    pub fn invalidate(&self, key: &QueryKey) {
        let mut state = self.inner.state.lock();
        state.entries.remove(key);
        state.bump(key);
    }

    /// Drop every key whose name starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.inner
            .state
            .lock()
            .invalidate_where(|k| k.name.starts_with(prefix))
    }

    /// Drop every key scoped to `address`.
    pub fn invalidate_scope(&self, address: &Address) -> usize {
        let scope = address.to_lower_hex();
        let removed = self
            .inner
            .state
            .lock()
            .invalidate_where(|k| k.scope.as_deref() == Some(scope.as_str()));
        tracing::debug!(scope = %scope, removed, "invalidated scoped queries");
        removed
    }

    pub fn clear(&self) -> usize {
        self.inner.state.lock().invalidate_where(|_| true)
    }

    /// Evict entries unused for longer than their gc time.
    pub fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| {
            e.status == QueryStatus::Fetching
                || e.refreshing
                || now.saturating_duration_since(e.last_access) <= e.options.gc_time
        });
        let evicted = before - state.entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, "collected idle queries");
        }
        evicted
    }

    /// Refetch `key` every `options.refetch_interval` until the handle is
    /// dropped. Returns `None` when the query is disabled or has no interval.
    pub fn schedule_refetch<V, F, Fut>(&self, key: QueryKey, options: QueryOptions, fetcher: F) -> Option<RefetchHandle>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        let period = options.refetch_interval.filter(|p| !p.is_zero())?;
        if !options.enabled {
            return None;
        }
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let generation = inner.state.lock().generation(&key);
                let result = inner.run_fetch(&key, &fetcher).await;
                inner.settle(&key, generation, options, &result);
            }
        });
        Some(RefetchHandle { task })
    }
}

/// Stops a scheduled refetch when dropped.
#[derive(Debug)]
pub struct RefetchHandle {
    task: JoinHandle<()>,
}

impl RefetchHandle {
    pub fn cancel(self) {}
}

impl Drop for RefetchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::TransportError;

    fn client() -> QueryClient {
        QueryClient::new(RetryPolicy::none())
    }

    fn options() -> QueryOptions {
        QueryOptions {
            stale_time: Duration::from_secs(30),
            refetch_interval: None,
            gc_time: Duration::from_secs(300),
            enabled: true,
        }
    }

    /// A fetcher returning `value` and counting calls.
    fn counting<V: Clone + Send + Sync + 'static>(
        calls: &Arc<AtomicU32>,
        value: V,
    ) -> impl Fn() -> std::future::Ready<Result<V, Error>> + Send + Sync + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value.clone()))
        }
    }

    fn addr(n: u8) -> Address {
        format!("0x{:040x}", n).parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_data_served_from_cache() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let key = QueryKey::new("blockNumber");

        let first = client.query(key.clone(), options(), counting(&calls, 10u64)).await;
        let second = client.query(key.clone(), options(), counting(&calls, 11u64)).await;

        assert_eq!(first.data, Some(10));
        assert_eq!(second.data, Some(10));
        assert_eq!(second.status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_data_served_then_refreshed() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let key = QueryKey::new("gasPrice");

        client.query(key.clone(), options(), counting(&calls, 1u64)).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        let stale = client.query(key.clone(), options(), counting(&calls, 2u64)).await;
        assert_eq!(stale.data, Some(1));
        assert_eq!(stale.status, QueryStatus::Stale);

        // Only one refresh while the first is pending.
        client.query(key.clone(), options(), counting(&calls, 3u64)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.get_cached::<u64>(&key), Some(2));
        assert_eq!(client.status(&key), Some(QueryStatus::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_data_wins_over_inflight_refresh() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let key = QueryKey::new("proposals");

        client.query(key.clone(), options(), counting(&calls, 1u64)).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        let slow = || async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, Error>(2u64)
        };
        let stale = client.query(key.clone(), options(), slow).await;
        assert_eq!(stale.data, Some(1));

        client.set_data(key.clone(), options(), 99u64);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(client.get_cached::<u64>(&key), Some(99));
        assert_eq!(client.status(&key), Some(QueryStatus::Success));
    }

    #[tokio::test]
    async fn test_disabled_query_does_not_fetch() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let result = client
            .query(QueryKey::new("x"), options().enabled(false), counting(&calls, 1u8))
            .await;
        assert_eq!(result.status, QueryStatus::Idle);
        assert!(result.data.is_none());
        assert!(!result.is_loading);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(result.into_result().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_is_reported_and_observed() {
        let client = client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.set_error_observer(move |key, err| {
            sink.lock().push((key.to_string(), err.http_status()));
        });

        let result: QueryResult<u8> = client
            .query(QueryKey::new("balances").param(1), options(), || async {
                Err(Error::Transport(TransportError::Status {
                    status: 401,
                    body: String::new(),
                }))
            })
            .await;

        assert_eq!(result.status, QueryStatus::Error);
        assert!(result.into_result().is_err());
        assert_eq!(*seen.lock(), vec![("balances[1]".to_string(), Some(401))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_fetch_is_discarded() {
        let client = client();
        let key = QueryKey::new("portfolio").scoped(&addr(0xa));

        let slow = {
            let client = client.clone();
            let key = key.clone();
            tokio::spawn(async move {
                client
                    .query(key, options(), || async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok::<_, Error>("late A".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.status(&key), Some(QueryStatus::Fetching));

        assert_eq!(client.invalidate_scope(&addr(0xa)), 1);
        let returned = slow.await.unwrap();

        // The caller still sees its answer, but the cache does not keep it.
        assert_eq!(returned.data.as_deref(), Some("late A"));
        assert_eq!(client.get_cached::<String>(&key), None);
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_prefix_and_scope() {
        let client = client();
        client.set_data(QueryKey::new("validators").param(1), options(), 1u8);
        client.set_data(QueryKey::new("validators").param(2), options(), 2u8);
        client.set_data(QueryKey::new("proposals"), options(), 3u8);
        client.set_data(QueryKey::new("portfolio").scoped(&addr(1)), options(), 4u8);
        client.set_data(QueryKey::new("portfolio").scoped(&addr(2)), options(), 5u8);

        assert_eq!(client.invalidate_prefix("validators"), 2);
        assert_eq!(client.invalidate_scope(&addr(1)), 1);
        assert_eq!(client.len(), 2);
        assert_eq!(
            client.get_cached::<u8>(&QueryKey::new("portfolio").scoped(&addr(2))),
            Some(5)
        );

        client.invalidate(&QueryKey::new("proposals"));
        assert_eq!(client.clear(), 1);
        assert!(client.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_garbage_evicts_idle_entries() {
        let client = client();
        let short = QueryOptions {
            gc_time: Duration::from_secs(5),
            ..options()
        };
        client.set_data(QueryKey::new("old"), short, 1u8);
        tokio::time::sleep(Duration::from_secs(3)).await;
        client.set_data(QueryKey::new("new"), short, 2u8);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(client.collect_garbage(), 1);
        assert_eq!(client.get_cached::<u8>(&QueryKey::new("new")), Some(2));
        assert_eq!(client.get_cached::<u8>(&QueryKey::new("old")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refetch_stops_on_drop() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let key = QueryKey::new("blockNumber");
        let opts = options().refetch_interval(Some(Duration::from_secs(10)));

        let handle = client
            .schedule_refetch(key.clone(), opts, counting(&calls, 5u64))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.get_cached::<u64>(&key), Some(5));

        drop(handle);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(client
            .schedule_refetch(key, options(), counting(&calls, 5u64))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_go_through_retry() {
        let client = QueryClient::new(RetryPolicy::new(2, Duration::from_millis(100)));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = client
            .query(QueryKey::new("flaky"), options(), move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::Transport(TransportError::Timeout))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.data, Some(1));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
