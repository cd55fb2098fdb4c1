//! Store backed by a Redis server.
//!
//! Bucket fields live in a hash per limiter key. The lease operations run as
//! server-side scripts so the check and the mutation cannot interleave with
//! another client.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{FleetrateError, Result};

use super::StateStore;

/// Sets the lease only if nobody holds it. Replies `'1'` on success.
const ACQUIRE_SCRIPT: &str = "if redis.call('set',KEYS[1],ARGV[1],'NX','PX',ARGV[2]) then\n    return '1'\nelse\n    return '0'\nend";

/// Deletes the lease only if the caller still holds it.
const RELEASE_SCRIPT: &str = "if redis.call('get',KEYS[1]) == ARGV[1] then\n    return tostring(redis.call('del',KEYS[1]))\nelse\n    return '0'\nend";

/// Client for a Redis server.
///
/// Commands share one multiplexed connection that matches every reply to
/// its request, so a caller that gives up on a command never sees another
/// caller's reply. The connection is re-established in the background after
/// it drops. Scripts are sent by digest and loaded on the first miss.
#[derive(Clone)]
pub struct RedisStore {
    url: String,
    io_timeout: Duration,
    conn: ConnectionManager,
    acquire: Script,
    release: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the server at `url`, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| FleetrateError::Config(format!("invalid store url '{}': {}", url, e)))?;

        let conn = match timeout(connect_timeout, ConnectionManager::new(client)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(FleetrateError::StoreUnavailable(format!(
                    "connect to {} timed out after {:?}",
                    url, connect_timeout
                )))
            }
        };
        info!(url = %url, "Connected to Redis store");

        Ok(Self {
            url: url.to_string(),
            io_timeout,
            conn,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run one request under the I/O timeout.
    async fn bounded<T, F>(&self, command: &str, request: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.io_timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(url = %self.url, command, error = %e, "Redis command failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(url = %self.url, command, "Redis command timed out");
                Err(FleetrateError::StoreUnavailable(format!(
                    "{} timed out after {:?}",
                    command, self.io_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(*field);
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> =
            self.bounded("HMGET", cmd.query_async(&mut conn)).await?;
        if values.len() != fields.len() {
            return Err(FleetrateError::Protocol(format!(
                "HMGET returned {} values for {} fields",
                values.len(),
                fields.len()
            )));
        }
        Ok(values)
    }

    async fn hash_set(&self, key: &str, entries: &[(&str, String)]) -> Result<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in entries {
            cmd.arg(*field).arg(value.as_str());
        }

        let mut conn = self.conn.clone();
        let _: i64 = self.bounded("HSET", cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, lease: Duration) -> Result<bool> {
        let lease_ms = lease.as_millis().max(1).to_string();
        let mut invocation = self.acquire.key(key);
        invocation.arg(value).arg(lease_ms);

        let mut conn = self.conn.clone();
        let reply: String = self
            .bounded("EVALSHA acquire", invocation.invoke_async(&mut conn))
            .await?;
        match reply.as_str() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(FleetrateError::Protocol(format!(
                "unexpected acquire reply {:?}",
                other
            ))),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut invocation = self.release.key(key);
        invocation.arg(expected);

        let mut conn = self.conn.clone();
        let reply: String = self
            .bounded("EVALSHA release", invocation.invoke_async(&mut conn))
            .await?;
        Ok(reply != "0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// What the in-test server knows: hashes, lease holders, loaded script
    /// digests, every command received, and an optional delay before the
    /// first acquire reply.
    #[derive(Default)]
    struct ServerState {
        hashes: HashMap<String, HashMap<String, String>>,
        leases: HashMap<String, String>,
        loaded: HashSet<String>,
        commands: Vec<Vec<String>>,
        acquire_delay: Option<Duration>,
    }

    type Shared = Arc<Mutex<ServerState>>;

    fn acquire_sha() -> String {
        Script::new(ACQUIRE_SCRIPT).get_hash().to_string()
    }

    fn release_sha() -> String {
        Script::new(RELEASE_SCRIPT).get_hash().to_string()
    }

    /// Serves the handful of commands the store sends. Each connection is
    /// answered strictly in order, like a single Redis server would.
    async fn start_server(state: ServerState) -> (String, Shared) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("redis://{}", listener.local_addr().unwrap());
        let shared = Arc::new(Mutex::new(state));

        let server = shared.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, server.clone()));
            }
        });
        (url, shared)
    }

    async fn serve(mut socket: TcpStream, state: Shared) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            while let Some((args, used)) = parse_request(&buf) {
                buf.drain(..used);
                let (reply, delay) = execute(&state, args);
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if socket.write_all(&reply).await.is_err() {
                    return;
                }
            }
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Decode one array-of-bulk-strings request from the front of `data`.
    fn parse_request(data: &[u8]) -> Option<(Vec<String>, usize)> {
        fn line(data: &[u8], from: usize) -> Option<(&str, usize)> {
            let end = data[from..].windows(2).position(|w| w == b"\r\n")? + from;
            Some((std::str::from_utf8(&data[from + 1..end]).ok()?, end + 2))
        }

        let (count, mut at) = line(data, 0)?;
        let count: usize = count.parse().ok()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let (len, start) = line(data, at)?;
            let len: usize = len.parse().ok()?;
            if data.len() < start + len + 2 {
                return None;
            }
            args.push(String::from_utf8_lossy(&data[start..start + len]).into_owned());
            at = start + len + 2;
        }
        Some((args, at))
    }

    fn bulk(value: &str) -> Vec<u8> {
        format!("${}\r\n{}\r\n", value.len(), value).into_bytes()
    }

    fn execute(state: &Shared, args: Vec<String>) -> (Vec<u8>, Option<Duration>) {
        let mut state = state.lock();
        state.commands.push(args.clone());
        let name = args[0].to_ascii_uppercase();

        match name.as_str() {
            "HSET" => {
                let hash = state.hashes.entry(args[1].clone()).or_default();
                let mut added = 0;
                for pair in args[2..].chunks(2) {
                    if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                        added += 1;
                    }
                }
                (format!(":{}\r\n", added).into_bytes(), None)
            }
            "HMGET" => {
                let mut out = format!("*{}\r\n", args.len() - 2).into_bytes();
                for field in &args[2..] {
                    match state.hashes.get(&args[1]).and_then(|h| h.get(field)) {
                        Some(value) => out.extend(bulk(value)),
                        None => out.extend_from_slice(b"$-1\r\n"),
                    }
                }
                (out, None)
            }
            "SCRIPT" => {
                let sha = if args[2] == ACQUIRE_SCRIPT {
                    acquire_sha()
                } else {
                    release_sha()
                };
                state.loaded.insert(sha.clone());
                (bulk(&sha), None)
            }
            "EVALSHA" | "EVAL" => {
                let script = if name == "EVAL" {
                    if args[1] == ACQUIRE_SCRIPT {
                        acquire_sha()
                    } else {
                        release_sha()
                    }
                } else if state.loaded.contains(&args[1]) {
                    args[1].clone()
                } else {
                    return (b"-NOSCRIPT No matching script.\r\n".to_vec(), None);
                };

                let (key, token) = (args[3].clone(), args[4].clone());
                if script == acquire_sha() {
                    let won = !state.leases.contains_key(&key);
                    if won {
                        state.leases.insert(key, token);
                    }
                    let delay = state.acquire_delay.take();
                    (bulk(if won { "1" } else { "0" }), delay)
                } else {
                    let held = state.leases.get(&key) == Some(&token);
                    if held {
                        state.leases.remove(&key);
                    }
                    (bulk(if held { "1" } else { "0" }), None)
                }
            }
            "PING" => (b"+PONG\r\n".to_vec(), None),
            _ => (b"+OK\r\n".to_vec(), None),
        }
    }

    fn preloaded() -> ServerState {
        ServerState {
            loaded: [acquire_sha(), release_sha()].into_iter().collect(),
            ..ServerState::default()
        }
    }

    async fn connect_to(url: &str) -> RedisStore {
        RedisStore::connect(url, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hash_get_and_set() {
        let (url, server) = start_server(ServerState::default()).await;
        let store = connect_to(&url).await;

        store
            .hash_set("junit", &[("maxPermits", "4".into()), ("storedPermits", "2".into())])
            .await
            .unwrap();
        let values = store
            .hash_get("junit", &["maxPermits", "nextFreeTicketMicros"])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("4".to_string()), None]);

        let expected: Vec<String> = ["HSET", "junit", "maxPermits", "4", "storedPermits", "2"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        assert!(server.lock().commands.contains(&expected));
    }

    #[tokio::test]
    async fn test_lease_scripts_load_on_first_miss() {
        let (url, server) = start_server(ServerState::default()).await;
        let store = connect_to(&url).await;

        let lease = Duration::from_millis(3000);
        assert!(store.set_if_absent("junitLock", "token-a", lease).await.unwrap());
        assert!(!store.set_if_absent("junitLock", "token-b", lease).await.unwrap());
        assert!(!store.delete_if_equals("junitLock", "token-b").await.unwrap());
        assert!(store.delete_if_equals("junitLock", "token-a").await.unwrap());

        let server = server.lock();
        assert!(server.leases.is_empty());
        let acquire = server
            .commands
            .iter()
            .find(|c| c[0] == "EVALSHA" && c[1] == acquire_sha())
            .unwrap();
        assert_eq!(&acquire[2..], &["1", "junitLock", "token-a", "3000"]);
        assert!(server.commands.iter().any(|c| c[0] == "SCRIPT"));
    }

    #[tokio::test]
    async fn test_abandoned_acquire_reply_is_not_misdelivered() {
        let (url, server) = start_server(ServerState {
            acquire_delay: Some(Duration::from_millis(100)),
            ..preloaded()
        })
        .await;
        let store = connect_to(&url).await;
        let lease = Duration::from_secs(3);

        // The server grants "A" but answers late; the caller has given up.
        let abandoned = timeout(
            Duration::from_millis(10),
            store.set_if_absent("kLock", "A", lease),
        )
        .await;
        assert!(abandoned.is_err());

        // "B" must get its own answer, not the reply meant for "A".
        assert!(!store.set_if_absent("kLock", "B", lease).await.unwrap());
        assert_eq!(server.lock().leases.get("kLock").map(String::as_str), Some("A"));

        assert!(store.delete_if_equals("kLock", "A").await.unwrap());
        assert!(store.set_if_absent("kLock", "B", lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_slow_reply_is_store_unavailable() {
        let (url, _) = start_server(ServerState {
            acquire_delay: Some(Duration::from_millis(500)),
            ..preloaded()
        })
        .await;
        let store = RedisStore::connect(&url, Duration::from_secs(1), Duration::from_millis(50))
            .await
            .unwrap();

        let err = store
            .set_if_absent("k", "v", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetrateError::StoreUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let quick = Duration::from_millis(50);
        let err = RedisStore::connect("not a url", quick, quick)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetrateError::Config(_)));
    }
}
