//! Process-wide registry of service connections.
//!
//! The manager hands out one serving connection per `(identity, version)`,
//! collapses concurrent requests for the same key onto a single connect
//! attempt, and removes connections once they have fully drained. Locator
//! traffic is routed through a distinguished connection keyed by a reserved
//! sentinel identity, which is what breaks the resolve/connect recursion.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::connection::{ConnectTarget, ServiceConnection};
use crate::errors::{Error, ServiceStatus};
use crate::executor::Executor;
use crate::resolver::{Resolution, Resolver};

/// Backoff configuration for reconnect attempts after a transport error.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Ceiling on the delay between attempts.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The backoff before retrying after `attempt` failures (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let backoff = self.initial_backoff.mul_f64(multiplier);
        backoff.min(self.max_backoff)
    }
}

/// Configuration for a [`ServiceManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Locator endpoints, tried in order. Defaults to `[::]:10053`.
    pub locator_endpoints: Vec<SocketAddr>,
    /// Deadline for one locator resolve; doubles as the per-endpoint connect
    /// timeout.
    pub resolve_timeout: Duration,
    /// Reconnect backoff after transport errors.
    pub retry: RetryPolicy,
    /// Run handler callbacks on the manager's serialized executor instead of
    /// each connection's dispatch loop.
    pub use_default_executor: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            locator_endpoints: crate::resolver::default_locator_endpoints(),
            resolve_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            use_default_executor: true,
        }
    }
}

/// Registry key: a service identity plus the protocol version required of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConnectionKey {
    /// Reserved identity for the locator link. Never routed through resolve.
    Locator,
    Name(String, u32),
    Endpoint(SocketAddr, u32),
}

#[derive(Default)]
struct Registry {
    map: HashMap<ConnectionKey, ServiceConnection>,
    /// Connections displaced from the map while they finish draining. They
    /// are dropped from here by `release`.
    draining: Vec<ServiceConnection>,
}

/// The process-wide service connection manager.
///
/// Cheap to clone; all clones share one registry. Connections hold only a
/// weak reference back, so dropping the last manager clone tears the
/// registry down even while connections are still referenced elsewhere.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    config: ManagerConfig,
    resolver: Resolver,
    executor: Executor,
    registry: Mutex<Registry>,
}

impl ServiceManager {
    /// Create a manager with default configuration. Must be called inside a
    /// tokio runtime.
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let resolver = Resolver::with(config.locator_endpoints.clone(), config.resolve_timeout);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                resolver,
                executor: Executor::spawn(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Connection to the named service at `version`, resolved through the
    /// locator. Returns the cached serving connection when one exists.
    pub async fn get(&self, name: &str, version: u32) -> Result<ServiceConnection, Error> {
        let key = ConnectionKey::Name(name.to_owned(), version);
        let conn = ManagerInner::obtain(&self.inner, &key, |inner| {
            ServiceConnection::new(
                name.to_owned(),
                ConnectTarget::Resolve(name.to_owned()),
                version,
                Arc::downgrade(inner),
                inner.config.resolve_timeout,
                inner.config.retry.clone(),
                inner.config.use_default_executor,
                inner.executor.clone(),
            )
        });
        self.drive(key, conn).await
    }

    /// Connection to a literal endpoint, bypassing the locator.
    pub async fn get_endpoint(
        &self,
        endpoint: SocketAddr,
        version: u32,
    ) -> Result<ServiceConnection, Error> {
        let key = ConnectionKey::Endpoint(endpoint, version);
        let conn = ManagerInner::obtain(&self.inner, &key, |inner| {
            ServiceConnection::new(
                endpoint.to_string(),
                ConnectTarget::Direct(vec![endpoint]),
                version,
                Arc::downgrade(inner),
                inner.config.resolve_timeout,
                inner.config.retry.clone(),
                inner.config.use_default_executor,
                inner.executor.clone(),
            )
        });
        self.drive(key, conn).await
    }

    /// Resolve a service name through the locator.
    pub async fn resolve(&self, name: &str) -> Result<Resolution, Error> {
        ManagerInner::resolve_name(&self.inner, name).await
    }

    /// Number of registered connections, draining ones included.
    pub fn registered(&self) -> usize {
        let reg = self.inner.registry.lock();
        reg.map.len() + reg.draining.len()
    }

    async fn drive(
        &self,
        key: ConnectionKey,
        conn: ServiceConnection,
    ) -> Result<ServiceConnection, Error> {
        match conn.connect().await {
            Ok(()) => Ok(conn),
            Err(error) => {
                // A connection that never came up must not shadow the key.
                self.inner.evict_failed(&key, &conn);
                Err(error)
            }
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerInner {
    /// Cached serving connection for `key`, or a freshly registered one.
    /// Draining connections are displaced, never returned.
    fn obtain(
        this: &Arc<Self>,
        key: &ConnectionKey,
        make: impl FnOnce(&Arc<Self>) -> ServiceConnection,
    ) -> ServiceConnection {
        let mut reg = this.registry.lock();
        if let Some(existing) = reg.map.get(key) {
            if existing.status() != ServiceStatus::Draining {
                return existing.clone();
            }
            let draining = existing.clone();
            reg.map.remove(key);
            reg.draining.push(draining);
        }
        let conn = make(this);
        reg.map.insert(key.clone(), conn.clone());
        conn
    }

    pub(crate) async fn resolve_name(this: &Arc<Self>, name: &str) -> Result<Resolution, Error> {
        let key = ConnectionKey::Locator;
        let locator = Self::obtain(this, &key, |inner| {
            ServiceConnection::new(
                "locator".to_owned(),
                ConnectTarget::Direct(inner.resolver.endpoints().to_vec()),
                0,
                Arc::downgrade(inner),
                inner.config.resolve_timeout,
                inner.config.retry.clone(),
                inner.config.use_default_executor,
                inner.executor.clone(),
            )
        });
        if let Err(error) = locator.connect().await {
            debug!(%error, "locator connection failed");
            this.evict_failed(&key, &locator);
            return Err(Error::LocatorUnavailable);
        }
        this.resolver.resolve_via(&locator, name).await
    }

    /// Called by a connection whose session table has fully drained.
    pub(crate) fn release(&self, conn: &ServiceConnection) {
        let mut reg = self.registry.lock();
        reg.map.retain(|_, c| !ServiceConnection::ptr_eq(c, conn));
        reg.draining.retain(|c| !ServiceConnection::ptr_eq(c, conn));
        debug!(service = %conn.name(), "released drained connection");
    }

    fn evict_failed(&self, key: &ConnectionKey, conn: &ServiceConnection) {
        let mut reg = self.registry.lock();
        if let Some(current) = reg.map.get(key) {
            if ServiceConnection::ptr_eq(current, conn)
                && current.status() != ServiceStatus::Connected
            {
                reg.map.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_calculation() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(400));
        // Eventually capped at max_backoff.
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(5));
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn default_config_points_at_the_default_locator() {
        let config = ManagerConfig::default();
        assert_eq!(config.locator_endpoints.len(), 1);
        assert_eq!(config.locator_endpoints[0].port(), 10053);
        assert_eq!(config.resolve_timeout, Duration::from_secs(1));
        assert!(config.use_default_executor);
    }
}
