//! A bounded pool of authenticated SMTP sessions.
//!
//! Contract notes: `close` is idempotent; `get` and `put` on a closed
//! pool return an error or politely shut the session down rather than
//! panicking; idle sessions are liveness-probed with NOOP before
//! being handed out, and a background sweep evicts sessions that sat
//! idle past the configured expiry.

use crate::client::{ClientError, SmtpClient, SmtpClientTimeouts};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,
    #[error("connection pool is exhausted: all {0} sessions are in use")]
    Exhausted(usize),
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// host:port of the relay.
    pub addr: String,
    /// Domain announced in EHLO.
    pub ehlo_domain: String,
    /// AUTH PLAIN credentials; authentication is skipped when the
    /// username is empty.
    pub username: String,
    pub password: String,
    /// Upper bound on sessions alive at once (idle + leased).
    /// Default 10.
    pub max_sessions: usize,
    /// Idle sessions older than this are closed. Default 5 minutes.
    pub max_idle: Duration,
    /// How often the background sweep runs. Default 1 minute.
    pub sweep_interval: Duration,
    pub timeouts: SmtpClientTimeouts,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            ehlo_domain: "localhost".to_string(),
            username: String::new(),
            password: String::new(),
            max_sessions: 10,
            max_idle: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            timeouts: SmtpClientTimeouts::default(),
        }
    }
}

/// How the pool opens a new authenticated session. The TCP
/// implementation is the production path; tests substitute an
/// in-memory one.
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<SmtpClient, ClientError>;
}

pub struct TcpConnector {
    config: PoolConfig,
}

#[async_trait]
impl SessionConnector for TcpConnector {
    async fn connect(&self) -> Result<SmtpClient, ClientError> {
        let mut client = SmtpClient::connect(&self.config.addr, self.config.timeouts.clone()).await?;
        client.ehlo(&self.config.ehlo_domain).await?;
        if !self.config.username.is_empty() {
            client
                .auth_plain(&self.config.username, &self.config.password)
                .await?;
        }
        Ok(client)
    }
}

struct IdleSession {
    client: SmtpClient,
    last_used: Instant,
}

struct PoolInner {
    idle: VecDeque<IdleSession>,
    /// Sessions alive: idle plus leased out.
    live: usize,
    closed: bool,
}

struct PoolState {
    inner: Mutex<PoolInner>,
    connector: Box<dyn SessionConnector>,
    max_sessions: usize,
    max_idle: Duration,
}

#[derive(Clone)]
pub struct Pool {
    state: Arc<PoolState>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        let connector = TcpConnector {
            config: config.clone(),
        };
        Self::with_connector(config, Box::new(connector))
    }

    pub fn with_connector(config: PoolConfig, connector: Box<dyn SessionConnector>) -> Self {
        let state = Arc::new(PoolState {
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                live: 0,
                closed: false,
            }),
            connector,
            max_sessions: config.max_sessions.max(1),
            max_idle: config.max_idle,
        });

        let weak = Arc::downgrade(&state);
        let interval = config.sweep_interval;
        tokio::spawn(async move {
            sweep_idle(weak, interval).await;
        });

        Self { state }
    }

    /// Lease a session: a probed, unexpired idle one if available,
    /// otherwise a freshly opened one, up to the configured bound.
    pub async fn get(&self) -> Result<SmtpClient, PoolError> {
        loop {
            let candidate = {
                let mut inner = self.state.inner.lock();
                if inner.closed {
                    return Err(PoolError::Closed);
                }
                match inner.idle.pop_front() {
                    Some(session) => {
                        if session.last_used.elapsed() > self.state.max_idle {
                            inner.live -= 1;
                            retire(session.client);
                            continue;
                        }
                        Some(session.client)
                    }
                    None => {
                        if inner.live >= self.state.max_sessions {
                            return Err(PoolError::Exhausted(inner.live));
                        }
                        // Reserve the slot before we release the lock.
                        inner.live += 1;
                        None
                    }
                }
            };

            match candidate {
                Some(mut client) => {
                    if client.noop().await.is_ok() {
                        return Ok(client);
                    }
                    // Stale session; drop it and look again.
                    self.state.inner.lock().live -= 1;
                }
                None => {
                    return match self.state.connector.connect().await {
                        Ok(client) => Ok(client),
                        Err(err) => {
                            self.state.inner.lock().live -= 1;
                            Err(err.into())
                        }
                    };
                }
            }
        }
    }

    /// Return a leased session for reuse. If the pool is full or has
    /// been closed, the session is shut down instead.
    pub fn put(&self, client: SmtpClient) {
        let mut inner = self.state.inner.lock();
        if inner.closed || inner.idle.len() >= self.state.max_sessions {
            inner.live -= 1;
            retire(client);
            return;
        }
        inner.idle.push_back(IdleSession {
            client,
            last_used: Instant::now(),
        });
    }

    /// Drop a leased session that is known to be broken.
    pub fn discard(&self, client: SmtpClient) {
        self.state.inner.lock().live -= 1;
        drop(client);
    }

    /// Close the pool and shut down all idle sessions. Idempotent;
    /// sessions still leased out are retired when they come back
    /// through `put`.
    pub fn close(&self) {
        let mut inner = self.state.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        while let Some(session) = inner.idle.pop_front() {
            inner.live -= 1;
            retire(session.client);
        }
    }

    /// Returns (idle sessions, total live sessions).
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.state.inner.lock();
        (inner.idle.len(), inner.live)
    }

    /// Send one message through a pooled session. The session is
    /// RSET before the envelope so state from a previous transaction
    /// cannot leak in, and returned for reuse when the conversation
    /// stays healthy at the protocol level.
    pub async fn send_mail(
        &self,
        from: &str,
        to: &[String],
        payload: &[u8],
    ) -> Result<(), PoolError> {
        let mut client = self.get().await?;
        if client.rset().await.is_err() {
            self.discard(client);
            client = self.get().await?;
        }

        match client.send_mail(from, to, payload).await {
            Ok(_) => {
                self.put(client);
                Ok(())
            }
            Err(err @ ClientError::Rejected { .. }) => {
                // The server said no, but the session itself is fine.
                client.rset().await.ok();
                self.put(client);
                Err(err.into())
            }
            Err(err) => {
                self.discard(client);
                Err(err.into())
            }
        }
    }
}

/// Politely QUIT a session without blocking the caller.
fn retire(mut client: SmtpClient) {
    tokio::spawn(async move {
        client.quit().await.ok();
    });
}

async fn sweep_idle(state: Weak<PoolState>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(state) = state.upgrade() else {
            return;
        };
        let mut inner = state.inner.lock();
        if inner.closed {
            return;
        }
        let max_idle = state.max_idle;
        let mut kept = VecDeque::with_capacity(inner.idle.len());
        while let Some(session) = inner.idle.pop_front() {
            if session.last_used.elapsed() > max_idle {
                inner.live -= 1;
                retire(session.client);
            } else {
                kept.push_back(session);
            }
        }
        inner.idle = kept;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Speaks just enough SMTP to satisfy the client.
    async fn fake_server(stream: DuplexStream) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let upper = line.trim_end().to_ascii_uppercase();
            let reply: &[u8] = if upper.starts_with("EHLO") {
                b"250-test\r\n250 AUTH PLAIN\r\n"
            } else if upper.starts_with("AUTH") {
                b"235 ok\r\n"
            } else if upper.starts_with("MAIL") || upper.starts_with("RCPT") {
                b"250 ok\r\n"
            } else if upper.starts_with("DATA") {
                writer.write_all(b"354 go\r\n").await.ok();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    if line == ".\r\n" {
                        break;
                    }
                }
                b"250 accepted\r\n"
            } else if upper.starts_with("QUIT") {
                writer.write_all(b"221 bye\r\n").await.ok();
                return;
            } else {
                // NOOP, RSET and friends
                b"250 ok\r\n"
            };
            if writer.write_all(reply).await.is_err() {
                return;
            }
        }
    }

    struct FakeConnector {
        opened: AtomicUsize,
    }

    impl FakeConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opened: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SessionConnector for Arc<FakeConnector> {
        async fn connect(&self) -> Result<SmtpClient, ClientError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (client_side, server_side) = tokio::io::duplex(16 * 1024);
            tokio::spawn(fake_server(server_side));
            Ok(SmtpClient::with_stream(
                client_side,
                SmtpClientTimeouts::default(),
            ))
        }
    }

    fn pool_with(config: PoolConfig, connector: Arc<FakeConnector>) -> Pool {
        Pool::with_connector(config, Box::new(connector))
    }

    #[tokio::test]
    async fn sessions_are_reused() {
        let connector = FakeConnector::new();
        let pool = pool_with(PoolConfig::default(), connector.clone());

        let client = pool.get().await.unwrap();
        pool.put(client);
        let client = pool.get().await.unwrap();
        pool.put(client);

        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_is_bounded() {
        let connector = FakeConnector::new();
        let pool = pool_with(
            PoolConfig {
                max_sessions: 1,
                ..PoolConfig::default()
            },
            connector.clone(),
        );

        let leased = pool.get().await.unwrap();
        match pool.get().await {
            Err(PoolError::Exhausted(1)) => {}
            other => panic!("expected exhaustion, got {other:?}"),
        }
        pool.put(leased);
        let again = pool.get().await.unwrap();
        pool.put(again);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_idle_sessions_are_replaced() {
        let connector = FakeConnector::new();
        let pool = pool_with(
            PoolConfig {
                max_idle: Duration::from_millis(0),
                ..PoolConfig::default()
            },
            connector.clone(),
        );

        let client = pool.get().await.unwrap();
        pool.put(client);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let client = pool.get().await.unwrap();
        pool.put(client);

        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_put_after_close_is_safe() {
        let connector = FakeConnector::new();
        let pool = pool_with(PoolConfig::default(), connector.clone());

        let leased = pool.get().await.unwrap();
        pool.close();
        pool.close();
        // Returning a session after close must not panic; the session
        // is retired instead of pooled.
        pool.put(leased);
        assert_eq!(pool.stats(), (0, 0));

        match pool.get().await {
            Err(PoolError::Closed) => {}
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_mail_round_trip() {
        let connector = FakeConnector::new();
        let pool = pool_with(PoolConfig::default(), connector.clone());

        pool.send_mail(
            "news@example.com",
            &["alice@example.org".to_string()],
            b"Subject: hi\r\n\r\nbody\r\n",
        )
        .await
        .unwrap();

        // The session went back into the pool.
        assert_eq!(pool.stats().0, 1);
    }
}
