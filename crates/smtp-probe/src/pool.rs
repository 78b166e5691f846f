#![cfg(feature = "client")]
use crate::client::SmtpSession;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub enabled: bool,
    /// Pooled connections per host:port target. Overflow callers get
    /// ephemeral sessions that never enter the pool.
    pub max_per_target: usize,
    /// Idle sessions older than this are reaped.
    pub idle_timeout: Duration,
    /// Sessions idle for less than this are handed out without a
    /// health-check round trip.
    pub health_check_after: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_target: 3,
            idle_timeout: Duration::from_secs(60),
            health_check_after: Duration::from_secs(30),
            reap_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Shard {
    /// Stack: the most recently returned session is reused first.
    available: Vec<SmtpSession>,
    in_use: usize,
    created: usize,
}

struct PoolInner {
    config: PoolConfig,
    shards: Mutex<HashMap<String, Shard>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Reusable session pool keyed by `host:port`.
///
/// `acquire` never blocks waiting for a slot: when the per-target cap
/// is reached the caller is told to open an ephemeral connection
/// instead, which is not counted against the pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

/// What `acquire` handed out.
pub enum Checkout {
    /// A healthy idle session; already past banner and EHLO.
    Reused(SmtpSession),
    /// The caller must connect a new session. When `pooled` is true a
    /// pool slot has been reserved for it: tag the connected session
    /// with the key, or call `abandon` if the connect fails.
    Fresh { pooled: bool, key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_pools: usize,
    pub total_connections: usize,
    pub available: usize,
    pub in_use: usize,
}

pub fn pool_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                shards: Mutex::new(HashMap::new()),
                reaper: Mutex::new(None),
            }),
        }
    }

    pub async fn acquire(&self, host: &str, port: u16) -> Checkout {
        let key = pool_key(host, port);
        if !self.inner.config.enabled {
            return Checkout::Fresh { pooled: false, key };
        }

        loop {
            let candidate = {
                let mut shards = self.inner.shards.lock();
                let shard = shards.entry(key.clone()).or_default();
                shard.available.pop()
            };

            let Some(mut session) = candidate else { break };

            if self.health_check(&mut session).await {
                let mut shards = self.inner.shards.lock();
                if let Some(shard) = shards.get_mut(&key) {
                    shard.in_use += 1;
                }
                session.stamp_used();
                tracing::debug!("reusing pooled session for {key}");
                return Checkout::Reused(session);
            }

            tracing::debug!("discarding unhealthy pooled session for {key}");
            session.close();
            let mut shards = self.inner.shards.lock();
            if let Some(shard) = shards.get_mut(&key) {
                shard.created = shard.created.saturating_sub(1);
            }
        }

        let mut shards = self.inner.shards.lock();
        let shard = shards.entry(key.clone()).or_default();
        if shard.created < self.inner.config.max_per_target {
            shard.created += 1;
            shard.in_use += 1;
            Checkout::Fresh { pooled: true, key }
        } else {
            Checkout::Fresh { pooled: false, key }
        }
    }

    async fn health_check(&self, session: &mut SmtpSession) -> bool {
        if !session.is_connected() {
            return false;
        }
        if session.idle_for() <= self.inner.config.health_check_after {
            return true;
        }
        match session.noop().await {
            Ok(resp) => resp.code >= 200 && resp.code < 400,
            Err(_) => false,
        }
    }

    /// Return a session after use. Broken or ephemeral sessions are
    /// dropped; healthy pooled sessions go back on the stack.
    pub fn release(&self, mut session: SmtpSession) {
        let Some(key) = session.pool_key().map(|k| k.to_string()) else {
            session.close();
            return;
        };

        let mut shards = self.inner.shards.lock();
        let Some(shard) = shards.get_mut(&key) else {
            session.close();
            return;
        };
        shard.in_use = shard.in_use.saturating_sub(1);

        if session.is_connected() {
            session.stamp_used();
            shard.available.push(session);
        } else {
            shard.created = shard.created.saturating_sub(1);
        }
    }

    /// Give back a reserved slot after a fresh pooled checkout failed
    /// to connect.
    pub fn abandon(&self, key: &str) {
        let mut shards = self.inner.shards.lock();
        if let Some(shard) = shards.get_mut(key) {
            shard.in_use = shard.in_use.saturating_sub(1);
            shard.created = shard.created.saturating_sub(1);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let shards = self.inner.shards.lock();
        let mut stats = PoolStats {
            total_pools: shards.len(),
            total_connections: 0,
            available: 0,
            in_use: 0,
        };
        for shard in shards.values() {
            stats.total_connections += shard.created;
            stats.available += shard.available.len();
            stats.in_use += shard.in_use;
        }
        stats
    }

    /// Start the periodic sweep that closes idle sessions and drops
    /// empty shards. Idempotent.
    pub fn start_reaper(&self) {
        let mut reaper = self.inner.reaper.lock();
        if reaper.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        reaper.replace(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                reap(&inner);
            }
        }));
    }

    /// Drop every pooled session and stop the reaper.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.reaper.lock().take() {
            handle.abort();
        }
        self.inner.shards.lock().clear();
    }
}

fn reap(inner: &PoolInner) {
    let mut shards = inner.shards.lock();
    for (key, shard) in shards.iter_mut() {
        let before = shard.available.len();
        shard
            .available
            .retain(|session| session.idle_for() <= inner.config.idle_timeout);
        let reaped = before - shard.available.len();
        if reaped > 0 {
            shard.created = shard.created.saturating_sub(reaped);
            tracing::debug!("reaped {reaped} idle sessions for {key}");
        }
    }
    shards.retain(|_, shard| !shard.available.is_empty() || shard.in_use > 0);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::SessionTimeouts;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_session(key: &str) -> (SmtpSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let mut session = SmtpSession::with_stream(
            client,
            "127.0.0.1",
            addr.port(),
            SessionTimeouts::short_timeouts(),
        );
        session.set_pool_key(key.to_string());
        (session, server)
    }

    #[tokio::test]
    async fn disabled_pool_hands_out_ephemeral_sessions() {
        let pool = SessionPool::new(PoolConfig {
            enabled: false,
            ..PoolConfig::default()
        });
        match pool.acquire("mx.example.com", 25).await {
            Checkout::Fresh { pooled, key } => {
                assert!(!pooled);
                assert_eq!(key, "mx.example.com:25");
            }
            Checkout::Reused(_) => panic!("nothing to reuse"),
        }
        assert_eq!(pool.stats().total_pools, 0);
    }

    #[tokio::test]
    async fn cap_then_overflow() {
        let pool = SessionPool::new(PoolConfig::default());
        for _ in 0..3 {
            match pool.acquire("mx.example.com", 25).await {
                Checkout::Fresh { pooled, .. } => assert!(pooled),
                Checkout::Reused(_) => panic!("nothing to reuse"),
            }
        }
        // Cap reached: overflow must not be counted against the pool
        match pool.acquire("mx.example.com", 25).await {
            Checkout::Fresh { pooled, .. } => assert!(!pooled),
            Checkout::Reused(_) => panic!("nothing to reuse"),
        }

        let stats = pool.stats();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.in_use, 3);
        assert_eq!(stats.available, 0);
    }

    #[tokio::test]
    async fn abandon_frees_the_slot() {
        let pool = SessionPool::new(PoolConfig {
            max_per_target: 1,
            ..PoolConfig::default()
        });
        let key = match pool.acquire("mx.example.com", 25).await {
            Checkout::Fresh { pooled, key } => {
                assert!(pooled);
                key
            }
            Checkout::Reused(_) => panic!("nothing to reuse"),
        };
        pool.abandon(&key);
        match pool.acquire("mx.example.com", 25).await {
            Checkout::Fresh { pooled, .. } => assert!(pooled),
            Checkout::Reused(_) => panic!("nothing to reuse"),
        }
    }

    #[tokio::test]
    async fn release_and_reuse() {
        let pool = SessionPool::new(PoolConfig::default());
        let key = match pool.acquire("127.0.0.1", 25).await {
            Checkout::Fresh { pooled, key } => {
                assert!(pooled);
                key
            }
            Checkout::Reused(_) => panic!("nothing to reuse"),
        };

        let (session, _server) = connected_session(&key).await;
        pool.release(session);

        let stats = pool.stats();
        assert_eq!(stats.available, 1);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total_connections, 1);

        // Recently used, so no NOOP health check is needed
        match pool.acquire("127.0.0.1", 25).await {
            Checkout::Reused(session) => assert!(session.is_connected()),
            Checkout::Fresh { .. } => panic!("expected to reuse the released session"),
        }
        let stats = pool.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.in_use, 1);
    }

    #[tokio::test]
    async fn broken_session_is_not_pooled() {
        let pool = SessionPool::new(PoolConfig::default());
        let key = match pool.acquire("127.0.0.1", 25).await {
            Checkout::Fresh { key, .. } => key,
            Checkout::Reused(_) => panic!("nothing to reuse"),
        };

        let (mut session, _server) = connected_session(&key).await;
        session.close();
        pool.release(session);

        let stats = pool.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total_connections, 0);
    }

    #[tokio::test]
    async fn unhealthy_idle_session_is_discarded_on_acquire() {
        let pool = SessionPool::new(PoolConfig {
            // Force the NOOP health check path for any idle session
            health_check_after: Duration::from_millis(0),
            ..PoolConfig::default()
        });
        let key = match pool.acquire("127.0.0.1", 25).await {
            Checkout::Fresh { key, .. } => key,
            Checkout::Reused(_) => panic!("nothing to reuse"),
        };

        let (session, server) = connected_session(&key).await;
        pool.release(session);
        // Peer goes away while the session is parked
        drop(server);
        tokio::time::sleep(Duration::from_millis(10)).await;

        match pool.acquire("127.0.0.1", 25).await {
            Checkout::Fresh { pooled, .. } => assert!(pooled),
            Checkout::Reused(_) => panic!("dead session must not be reused"),
        }
    }

    #[tokio::test]
    async fn healthy_idle_session_passes_noop_check() {
        let pool = SessionPool::new(PoolConfig {
            health_check_after: Duration::from_millis(0),
            ..PoolConfig::default()
        });
        let key = match pool.acquire("127.0.0.1", 25).await {
            Checkout::Fresh { key, .. } => key,
            Checkout::Reused(_) => panic!("nothing to reuse"),
        };

        let (session, mut server) = connected_session(&key).await;
        pool.release(session);

        let server_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"NOOP\r\n");
            server.write_all(b"250 2.0.0 OK\r\n").await.unwrap();
            server
        });

        match pool.acquire("127.0.0.1", 25).await {
            Checkout::Reused(session) => assert!(session.is_connected()),
            Checkout::Fresh { .. } => panic!("expected reuse after healthy NOOP"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn pool_accounting_invariant() {
        let pool = SessionPool::new(PoolConfig::default());
        let mut keys = vec![];
        for _ in 0..3 {
            if let Checkout::Fresh { pooled: true, key } = pool.acquire("127.0.0.1", 25).await {
                keys.push(key);
            }
        }
        let mut parked = vec![];
        for key in &keys {
            let (session, server) = connected_session(key).await;
            parked.push(server);
            pool.release(session);
            let stats = pool.stats();
            assert!(stats.available + stats.in_use <= 3);
        }
        let stats = pool.stats();
        assert_eq!(stats.available, 3);
        assert_eq!(stats.in_use, 0);
    }
}
