//! Bounded pool of reusable connections, partitioned by route.
//!
//! Each [`PooledConnection`] wraps a dedicated `reqwest::Client` that keeps at
//! most one idle keep-alive socket to its route. Dropping the last handle to
//! that client closes the socket, which is how expired connections are
//! discarded.
//!
//! Capacity is enforced with two layers of semaphore permits: one per route
//! (`max_connections_per_route`) and one shared by all routes
//! (`max_connections_total`). A caller holds both permits for as long as it
//! holds the lease. A route's bookkeeping is dropped once it has no idle
//! connections and no leases or waiters, so the pool only tracks routes that
//! are in use.

use crate::ClientConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use url::Url;

/// The `(scheme, host, port)` triple a connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: String,
    host: String,
    port: u16,
}

impl Route {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Derives the route of a URL, filling in the scheme's default port.
    ///
    /// # Examples
    ///
    /// ```
    /// use steadfetch::pool::Route;
    /// use url::Url;
    ///
    /// let url = Url::parse("https://api.example.com/v1/items").unwrap();
    /// let route = Route::from_url(&url).unwrap();
    /// assert_eq!(route.to_string(), "https://api.example.com:443");
    /// ```
    pub fn from_url(url: &Url) -> Result<Self, url::ParseError> {
        let host = url.host_str().ok_or(url::ParseError::EmptyHost)?;
        let port = url
            .port_or_known_default()
            .ok_or(url::ParseError::InvalidPort)?;
        Ok(Self::new(url.scheme(), host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Errors raised while acquiring a connection.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No connection to {route} available within {waited:?}")]
    Exhausted { route: Route, waited: Duration },

    #[error("Connection pool is closed")]
    Closed,

    #[error("Failed to create connection: {0}")]
    Build(#[source] reqwest::Error),
}

impl From<AcquireError> for PoolError {
    fn from(_: AcquireError) -> Self {
        PoolError::Closed
    }
}

/// A point-in-time view of pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the pool for reuse.
    pub idle: usize,
    /// Connections currently handed out.
    pub leased: usize,
    /// Connections created since the pool was built.
    pub created: u64,
    /// Acquisitions served by an idle connection.
    pub reused: u64,
    /// Connections dropped because they expired, broke, were evicted, or
    /// the pool closed.
    pub discarded: u64,
}

#[derive(Debug, Clone, Copy)]
struct PoolSettings {
    max_total: usize,
    max_per_route: usize,
    connect_timeout: Duration,
    socket_timeout: Duration,
    request_timeout: Duration,
    ttl: Duration,
}

struct Shared {
    settings: PoolSettings,
    global: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct PoolState {
    routes: HashMap<Route, RouteEntry>,
    /// Idle plus leased connections.
    live: usize,
    leased: usize,
    created: u64,
    reused: u64,
    discarded: u64,
}

impl PoolState {
    fn discard(&mut self, count: usize) {
        self.live -= count;
        self.discarded += count as u64;
    }

    /// Drops the oldest idle connection of any route.
    fn evict_oldest_idle(&mut self) -> Option<Route> {
        let (route, index) = self
            .routes
            .iter()
            .flat_map(|(route, entry)| {
                entry
                    .idle
                    .iter()
                    .enumerate()
                    .map(move |(index, conn)| (route, index, conn.created_at))
            })
            .min_by_key(|(_, _, created_at)| *created_at)
            .map(|(route, index, _)| (route.clone(), index))?;

        self.routes.get_mut(&route)?.idle.remove(index);
        self.discard(1);
        self.prune(&route);
        Some(route)
    }

    /// Forgets `route` if nothing is idle on it and nobody holds or awaits
    /// one of its permits.
    fn prune(&mut self, route: &Route) {
        let unused = self
            .routes
            .get(route)
            .is_some_and(|entry| entry.idle.is_empty() && Arc::strong_count(&entry.permits) == 1);
        if unused {
            self.routes.remove(route);
        }
    }
}

struct RouteEntry {
    permits: Arc<Semaphore>,
    idle: Vec<IdleConnection>,
}

struct IdleConnection {
    client: reqwest::Client,
    created_at: Instant,
}

/// The shared, bounded connection pool.
///
/// Cloning is cheap; clones share capacity and idle connections.
///
/// # Example
///
/// ```rust,no_run
/// use steadfetch::pool::{ConnectionPool, Route};
/// use steadfetch::ClientConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::new(&ClientConfig::builder().max_connections(4).build()?);
/// let route = Route::new("http", "localhost", 8080);
///
/// let conn = pool.acquire(&route).await?;
/// let response = conn.client().get("http://localhost:8080/health").send().await?;
/// println!("{}", response.status());
///
/// // Dropping the lease returns the connection to the pool.
/// drop(conn);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    pub fn new(config: &ClientConfig) -> Self {
        let settings = PoolSettings {
            max_total: config.max_connections_total(),
            max_per_route: config.max_connections_per_route(),
            connect_timeout: config.connect_timeout(),
            socket_timeout: config.socket_timeout(),
            request_timeout: config.connection_request_timeout(),
            ttl: config.connection_ttl(),
        };

        Self {
            shared: Arc::new(Shared {
                settings,
                global: Arc::new(Semaphore::new(settings.max_total)),
                state: Mutex::new(PoolState::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Leases a connection to `route`.
    ///
    /// Reuses the most recently released idle connection that has not
    /// outlived the TTL, creating a new one otherwise. When either capacity
    /// ceiling is reached, waits up to the connection request timeout for a
    /// lease to be released.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Exhausted`] if no capacity frees up in time
    /// - [`PoolError::Closed`] if the pool is shut down before or while waiting
    /// - [`PoolError::Build`] if the underlying client cannot be created
    pub async fn acquire(&self, route: &Route) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let route_permits = {
            let mut state = self.shared.lock();
            let max_per_route = self.shared.settings.max_per_route;
            state
                .routes
                .entry(route.clone())
                .or_insert_with(|| RouteEntry {
                    permits: Arc::new(Semaphore::new(max_per_route)),
                    idle: Vec::new(),
                })
                .permits
                .clone()
        };
        let global = self.shared.global.clone();
        let waited = self.shared.settings.request_timeout;

        // Route permit first, then global, so no holder of a global permit
        // ever waits on a route permit.
        let permits = tokio::time::timeout(waited, async move {
            let route_permit = route_permits.acquire_owned().await?;
            let global_permit = global.acquire_owned().await?;
            Ok::<_, PoolError>((route_permit, global_permit))
        })
        .await;

        let (route_permit, global_permit) = match permits {
            Ok(permits) => permits?,
            Err(_) => {
                tracing::debug!(route = %route, waited_ms = waited.as_millis(), "Connection pool exhausted");
                return Err(PoolError::Exhausted {
                    route: route.clone(),
                    waited,
                });
            }
        };

        self.checkout(route, route_permit, global_permit)
    }

    fn checkout(
        &self,
        route: &Route,
        route_permit: OwnedSemaphorePermit,
        global_permit: OwnedSemaphorePermit,
    ) -> Result<PooledConnection, PoolError> {
        let settings = self.shared.settings;
        let mut state = self.shared.lock();
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let mut expired = 0;
        let mut reusable = None;
        if let Some(entry) = state.routes.get_mut(route) {
            while let Some(idle) = entry.idle.pop() {
                if idle.created_at.elapsed() < settings.ttl {
                    reusable = Some(idle);
                    break;
                }
                expired += 1;
            }
        }
        if expired > 0 {
            state.discard(expired);
            tracing::debug!(route = %route, expired, "Discarded expired idle connections");
        }

        if let Some(idle) = reusable {
            state.reused += 1;
            state.leased += 1;
            tracing::debug!(route = %route, "Reusing pooled connection");
            drop(state);
            return Ok(self.lease(route, idle.client, idle.created_at, true, route_permit, global_permit));
        }

        if state.live >= settings.max_total {
            if let Some(evicted) = state.evict_oldest_idle() {
                tracing::debug!(route = %route, evicted = %evicted, "Evicted idle connection to stay within capacity");
            }
        }
        state.live += 1;
        state.leased += 1;
        drop(state);

        let client = match build_client(&settings) {
            Ok(client) => client,
            Err(e) => {
                let mut state = self.shared.lock();
                state.live -= 1;
                state.leased -= 1;
                drop(route_permit);
                state.prune(route);
                return Err(PoolError::Build(e));
            }
        };

        self.shared.lock().created += 1;
        tracing::debug!(route = %route, "Created pooled connection");
        Ok(self.lease(route, client, Instant::now(), false, route_permit, global_permit))
    }

    fn lease(
        &self,
        route: &Route,
        client: reqwest::Client,
        created_at: Instant,
        reused: bool,
        route_permit: OwnedSemaphorePermit,
        global_permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        PooledConnection {
            client,
            route: route.clone(),
            created_at,
            reused,
            broken: false,
            shared: self.shared.clone(),
            route_permit: Some(route_permit),
            _global_permit: global_permit,
        }
    }

    /// Shuts the pool down.
    ///
    /// Idle connections are discarded, waiting and future acquisitions fail
    /// with [`PoolError::Closed`], and outstanding leases are discarded when
    /// they are dropped.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.global.close();

        let mut state = self.shared.lock();
        let mut dropped = 0;
        for entry in state.routes.values_mut() {
            entry.permits.close();
            dropped += entry.idle.len();
            entry.idle.clear();
        }
        state.discard(dropped);
        tracing::info!(discarded = dropped, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            idle: state.routes.values().map(|e| e.idle.len()).sum(),
            leased: state.leased,
            created: state.created,
            reused: state.reused,
            discarded: state.discarded,
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.shared.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

fn build_client(settings: &PoolSettings) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(1)
        .connect_timeout(settings.connect_timeout)
        .read_timeout(settings.socket_timeout)
        .build()
}

/// An exclusive lease on a pooled connection.
///
/// Dropping the lease releases it: the connection goes back to its route
/// unless it has outlived the TTL, was marked broken, or the pool closed.
pub struct PooledConnection {
    client: reqwest::Client,
    route: Route,
    created_at: Instant,
    reused: bool,
    broken: bool,
    shared: Arc<Shared>,
    // Both released only once `drop` has returned the connection to the
    // idle list.
    route_permit: Option<OwnedSemaphorePermit>,
    _global_permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// The client bound to this connection.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns `true` if this lease was served from an idle connection.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Prevents the connection from being reused after release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("route", &self.route)
            .field("age", &self.age())
            .field("reused", &self.reused)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let expired = self.created_at.elapsed() >= self.shared.settings.ttl;
        let closed = self.shared.closed.load(Ordering::Acquire);

        let mut state = self.shared.lock();
        state.leased -= 1;
        let mut returned = false;
        if !expired && !closed && !self.broken {
            if let Some(entry) = state.routes.get_mut(&self.route) {
                entry.idle.push(IdleConnection {
                    client: self.client.clone(),
                    created_at: self.created_at,
                });
                returned = true;
            }
        }
        if !returned {
            state.discard(1);
            tracing::debug!(
                route = %self.route,
                expired,
                broken = self.broken,
                closed,
                "Discarded released connection"
            );
        }

        drop(self.route_permit.take());
        state.prune(&self.route);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_total: usize, max_per_route: usize, ttl: Duration) -> ConnectionPool {
        let config = ClientConfig::builder()
            .max_connections_total(max_total)
            .max_connections_per_route(max_per_route)
            .connection_request_timeout(Duration::from_millis(100))
            .connection_ttl(ttl)
            .build()
            .unwrap();
        ConnectionPool::new(&config)
    }

    fn route(port: u16) -> Route {
        Route::new("http", "127.0.0.1", port)
    }

    #[test]
    fn test_route_from_url() {
        let url = Url::parse("http://example.com:8080/a?b=c").unwrap();
        assert_eq!(Route::from_url(&url).unwrap(), Route::new("http", "example.com", 8080));

        let url = Url::parse("http://example.com/").unwrap();
        assert_eq!(Route::from_url(&url).unwrap().port(), 80);

        let url = Url::parse("data:text/plain,hello").unwrap();
        assert!(Route::from_url(&url).is_err());
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let pool = pool(2, 2, Duration::from_secs(60));

        let conn = pool.acquire(&route(1)).await.unwrap();
        assert!(!conn.is_reused());
        drop(conn);

        let conn = pool.acquire(&route(1)).await.unwrap();
        assert!(conn.is_reused());
        drop(conn);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.leased, 0);
    }

    #[tokio::test]
    async fn test_expired_connection_is_not_reused() {
        let pool = pool(2, 2, Duration::from_millis(30));

        drop(pool.acquire(&route(1)).await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let conn = pool.acquire(&route(1)).await.unwrap();
        assert!(!conn.is_reused());

        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.discarded, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_discarded_on_release() {
        let pool = pool(2, 2, Duration::from_millis(20));

        let conn = pool.acquire(&route(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        drop(conn);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_discarded() {
        let pool = pool(2, 2, Duration::from_secs(60));

        let mut conn = pool.acquire(&route(1)).await.unwrap();
        conn.mark_broken();
        drop(conn);

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_total_capacity_times_out() {
        let pool = pool(1, 1, Duration::from_secs(60));

        let _held = pool.acquire(&route(1)).await.unwrap();
        let err = pool.acquire(&route(1)).await.unwrap_err();

        match err {
            PoolError::Exhausted { route: r, waited } => {
                assert_eq!(r, route(1));
                assert_eq!(waited, Duration::from_millis(100));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let pool = pool(1, 1, Duration::from_secs(60));

        let held = pool.acquire(&route(1)).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(held);
        });

        let conn = pool.acquire(&route(1)).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn test_per_route_ceiling() {
        let pool = pool(4, 1, Duration::from_secs(60));

        let _a = pool.acquire(&route(1)).await.unwrap();
        let _b = pool.acquire(&route(2)).await.unwrap();

        assert!(matches!(
            pool.acquire(&route(1)).await,
            Err(PoolError::Exhausted { .. })
        ));
        assert_eq!(pool.stats().leased, 2);
    }

    #[tokio::test]
    async fn test_idle_connection_of_other_route_is_evicted() {
        let pool = pool(1, 1, Duration::from_secs(60));

        drop(pool.acquire(&route(1)).await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        let _conn = pool.acquire(&route(2)).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.created, 2);
    }

    #[tokio::test]
    async fn test_close_rejects_acquisitions_and_waiters() {
        let pool = pool(1, 1, Duration::from_secs(60));

        let held = pool.acquire(&route(1)).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&route(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.close();

        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert!(matches!(pool.acquire(&route(1)).await, Err(PoolError::Closed)));

        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[tokio::test]
    async fn test_unused_routes_are_forgotten() {
        let pool = pool(2, 1, Duration::from_secs(60));
        let tracked = |pool: &ConnectionPool| pool.shared.lock().routes.len();

        for port in 1..=50 {
            let mut conn = pool.acquire(&route(port)).await.unwrap();
            conn.mark_broken();
        }
        assert_eq!(tracked(&pool), 0);

        // An idle connection keeps its route until it is evicted.
        drop(pool.acquire(&route(1)).await.unwrap());
        assert_eq!(tracked(&pool), 1);
        drop(pool.acquire(&route(2)).await.unwrap());
        let _a = pool.acquire(&route(3)).await.unwrap();
        assert_eq!(tracked(&pool), 2);
        assert!(!pool.shared.lock().routes.contains_key(&route(1)));
    }

    #[tokio::test]
    async fn test_route_with_waiter_is_kept() {
        let pool = pool(1, 1, Duration::from_secs(60));

        let mut held = pool.acquire(&route(1)).await.unwrap();
        held.mark_broken();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&route(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        let conn = waiter.await.unwrap().unwrap();
        assert!(!conn.is_reused());
        assert_eq!(pool.shared.lock().routes.len(), 1);
        assert_eq!(pool.stats().leased, 1);
    }
}
