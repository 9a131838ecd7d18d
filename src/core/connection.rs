/// Connection seam between the driver core and the wire
///
/// The pool, resolver, and lock only depend on the [`KvConnection`] and
/// [`ConnectionFactory`] traits. [`TcpConnection`] is the default
/// RESP-over-TCP implementation covering the small command surface the
/// core needs: role/ping probes and the watch/transaction primitives the
/// distributed lock is built on.
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::{ConnectionSettings, Endpoint, ServerRole};
use crate::error::{FaroError, FaroResult};

/// Minimal command surface the driver core requires from a connection.
///
/// Implementations are used by exactly one caller at a time; the pool
/// enforces exclusive ownership between acquire and release.
#[async_trait]
pub trait KvConnection: Send {
    /// The endpoint this connection was created for.
    fn endpoint(&self) -> &Endpoint;

    /// Whether the transport is believed to be open.
    fn is_connected(&self) -> bool;

    /// Re-apply manager-level settings. Called on every pool acquisition.
    fn apply_settings(&mut self, settings: &ConnectionSettings);

    /// Query the server's self-reported role.
    async fn role(&mut self) -> FaroResult<ServerRole>;

    /// Liveness probe.
    async fn ping(&mut self) -> FaroResult<bool>;

    async fn get(&mut self, key: &str) -> FaroResult<Option<String>>;

    /// SET with an only-if-absent condition. Returns true when the value
    /// was written.
    async fn set_if_not_exists(&mut self, key: &str, value: &str) -> FaroResult<bool>;

    /// Delete a key. Returns true when a key was removed.
    async fn del(&mut self, key: &str) -> FaroResult<bool>;

    /// Begin optimistic concurrency control on a key.
    async fn watch(&mut self, key: &str) -> FaroResult<()>;

    /// Abandon any watch in progress.
    async fn unwatch(&mut self) -> FaroResult<()>;

    /// SET inside a transaction that commits only if the watched key was
    /// untouched since `watch`. Returns true when the commit applied.
    async fn transactional_set(&mut self, key: &str, value: &str) -> FaroResult<bool>;

    /// DEL inside a transaction under the same watch semantics.
    async fn transactional_del(&mut self, key: &str) -> FaroResult<bool>;
}

/// Factory opening transport-level connections bound to one endpoint.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> FaroResult<Box<dyn KvConnection>>;
}

/// One parsed RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Option<String>),
    Array(Option<Vec<Reply>>),
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&str], buf: &mut BytesMut) {
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg.as_bytes());
        buf.put_slice(b"\r\n");
    }
}

/// RESP-over-TCP connection with reusable buffers.
pub struct TcpConnection {
    endpoint: Endpoint,
    reader: BufReader<TcpStream>,
    write_buf: BytesMut,
    line_buf: String,
    settings: ConnectionSettings,
    current_db: i64,
    connected: bool,
    last_used: Instant,
}

impl TcpConnection {
    /// Open a connection, authenticating when the endpoint requires it.
    pub async fn connect(endpoint: Endpoint) -> FaroResult<Self> {
        let stream = Self::open_stream(&endpoint).await?;
        let mut conn = TcpConnection {
            reader: BufReader::new(stream),
            write_buf: BytesMut::with_capacity(256),
            line_buf: String::with_capacity(128),
            settings: ConnectionSettings::default(),
            current_db: 0,
            connected: true,
            last_used: Instant::now(),
            endpoint,
        };
        conn.handshake().await?;
        Ok(conn)
    }

    async fn open_stream(endpoint: &Endpoint) -> FaroResult<TcpStream> {
        let address = endpoint.address();
        debug!("Connecting to {}", address);

        let stream = match timeout(endpoint.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let message = match e.kind() {
                    io::ErrorKind::ConnectionRefused => "connection refused".to_string(),
                    _ => e.to_string(),
                };
                return Err(FaroError::connection(address, message));
            }
            Err(_) => {
                return Err(FaroError::connection(address, "connect timed out".to_string()));
            }
        };

        // Small request/response payloads; disable Nagle to keep latency low.
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }
        Ok(stream)
    }

    async fn handshake(&mut self) -> FaroResult<()> {
        if let Some(auth) = self.endpoint.auth.clone() {
            self.send(&["AUTH", &auth]).await?;
            let reply = self.read_reply_timed().await?;
            self.expect_ok(reply, "AUTH")?;
        }
        Ok(())
    }

    /// Reconnect when the transport is gone or the connection sat idle
    /// past the idle window.
    async fn ensure_ready(&mut self) -> FaroResult<()> {
        let idle_limit = self
            .settings
            .idle_timeout_secs
            .unwrap_or(self.endpoint.idle_timeout_secs);
        let stale = self.connected
            && idle_limit > 0
            && self.last_used.elapsed() >= Duration::from_secs(idle_limit);

        if self.connected && !stale {
            return Ok(());
        }
        if stale {
            debug!(
                "Reconnecting to {} after {}s idle",
                self.endpoint.address(),
                idle_limit
            );
        }

        let stream = Self::open_stream(&self.endpoint).await?;
        self.reader = BufReader::new(stream);
        self.connected = true;
        self.current_db = 0;
        self.last_used = Instant::now();
        self.handshake().await
    }

    fn desired_db(&self) -> Option<i64> {
        self.settings.db_index.or(self.endpoint.db_index)
    }

    fn prefixed(&self, key: &str) -> String {
        let prefix = self
            .settings
            .namespace_prefix
            .as_deref()
            .or(self.endpoint.namespace_prefix.as_deref())
            .unwrap_or("");
        format!("{}{}", prefix, key)
    }

    /// Send one command and read its reply, selecting the desired
    /// database first when it changed since the last command.
    async fn exec(&mut self, args: &[&str]) -> FaroResult<Reply> {
        self.ensure_ready().await?;

        if let Some(db) = self.desired_db() {
            if db != self.current_db {
                let db_arg = db.to_string();
                self.send(&["SELECT", &db_arg]).await?;
                let reply = self.read_reply_timed().await?;
                self.expect_ok(reply, "SELECT")?;
                self.current_db = db;
            }
        }

        self.send(args).await?;
        let reply = self.read_reply_timed().await?;
        self.last_used = Instant::now();
        Ok(reply)
    }

    async fn send(&mut self, args: &[&str]) -> FaroResult<()> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let limit = self.settings.send_timeout.or(self.endpoint.send_timeout);
        let TcpConnection {
            reader, write_buf, ..
        } = self;
        let stream = reader.get_mut();
        let write = async {
            stream.write_all(&write_buf[..]).await?;
            stream.flush().await
        };

        let result = match limit {
            Some(limit) => match timeout(limit, write).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")),
            },
            None => write.await,
        };

        result.map_err(|e| {
            self.connected = false;
            FaroError::connection(self.endpoint.address(), e.to_string())
        })
    }

    async fn read_reply_timed(&mut self) -> FaroResult<Reply> {
        let limit = self
            .settings
            .receive_timeout
            .or(self.endpoint.receive_timeout);
        let result = match limit {
            Some(limit) => match timeout(limit, self.read_reply()).await {
                Ok(r) => r,
                Err(_) => Err(FaroError::connection(
                    self.endpoint.address(),
                    "receive timed out".to_string(),
                )),
            },
            None => self.read_reply().await,
        };
        if result.is_err() {
            self.connected = false;
        }
        result
    }

    fn read_reply(&mut self) -> Pin<Box<dyn Future<Output = FaroResult<Reply>> + Send + '_>> {
        Box::pin(async move {
            self.line_buf.clear();
            let n = self
                .reader
                .read_line(&mut self.line_buf)
                .await
                .map_err(FaroError::Io)?;
            if n == 0 {
                return Err(FaroError::connection(
                    self.endpoint.address(),
                    "connection closed by server".to_string(),
                ));
            }

            let line = self.line_buf.trim_end_matches(['\r', '\n']).to_string();
            if line.is_empty() {
                return Err(FaroError::protocol("empty reply line"));
            }
            let kind = line.as_bytes()[0];
            let rest = line.get(1..).unwrap_or("");

            match kind {
                b'+' => Ok(Reply::Simple(rest.to_string())),
                b'-' => Ok(Reply::Error(rest.to_string())),
                b':' => rest
                    .parse::<i64>()
                    .map(Reply::Int)
                    .map_err(|_| FaroError::protocol(format!("invalid integer reply: {}", line))),
                b'$' => {
                    let len: i64 = rest
                        .parse()
                        .map_err(|_| FaroError::protocol(format!("invalid bulk header: {}", line)))?;
                    if len < 0 {
                        return Ok(Reply::Bulk(None));
                    }
                    let mut data = vec![0u8; len as usize + 2];
                    self.reader
                        .read_exact(&mut data)
                        .await
                        .map_err(FaroError::Io)?;
                    data.truncate(len as usize);
                    Ok(Reply::Bulk(Some(
                        String::from_utf8_lossy(&data).into_owned(),
                    )))
                }
                b'*' => {
                    let len: i64 = rest.parse().map_err(|_| {
                        FaroError::protocol(format!("invalid array header: {}", line))
                    })?;
                    if len < 0 {
                        return Ok(Reply::Array(None));
                    }
                    let mut items = Vec::with_capacity(len as usize);
                    for _ in 0..len {
                        items.push(self.read_reply().await?);
                    }
                    Ok(Reply::Array(Some(items)))
                }
                _ => Err(FaroError::protocol(format!("unexpected reply: {}", line))),
            }
        })
    }

    fn expect_ok(&self, reply: Reply, command: &str) -> FaroResult<()> {
        match reply {
            Reply::Simple(s) if s == "OK" || s == "QUEUED" => Ok(()),
            Reply::Error(e) => Err(FaroError::protocol(format!("{} failed: {}", command, e))),
            other => Err(FaroError::protocol(format!(
                "unexpected {} reply: {:?}",
                command, other
            ))),
        }
    }
}

#[async_trait]
impl KvConnection for TcpConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn apply_settings(&mut self, settings: &ConnectionSettings) {
        self.settings = settings.clone();
    }

    async fn role(&mut self) -> FaroResult<ServerRole> {
        let reply = self.exec(&["ROLE"]).await?;
        match reply {
            Reply::Array(Some(items)) => match items.first() {
                Some(Reply::Bulk(Some(role))) | Some(Reply::Simple(role)) => {
                    Ok(ServerRole::parse(role))
                }
                _ => Ok(ServerRole::Unknown),
            },
            Reply::Error(e) => Err(FaroError::protocol(format!("ROLE failed: {}", e))),
            _ => Ok(ServerRole::Unknown),
        }
    }

    async fn ping(&mut self) -> FaroResult<bool> {
        let reply = self.exec(&["PING"]).await?;
        Ok(matches!(reply, Reply::Simple(ref s) if s == "PONG"))
    }

    async fn get(&mut self, key: &str) -> FaroResult<Option<String>> {
        let key = self.prefixed(key);
        match self.exec(&["GET", &key]).await? {
            Reply::Bulk(value) => Ok(value),
            Reply::Error(e) => Err(FaroError::protocol(format!("GET failed: {}", e))),
            other => Err(FaroError::protocol(format!(
                "unexpected GET reply: {:?}",
                other
            ))),
        }
    }

    async fn set_if_not_exists(&mut self, key: &str, value: &str) -> FaroResult<bool> {
        let key = self.prefixed(key);
        match self.exec(&["SET", &key, value, "NX"]).await? {
            Reply::Simple(ref s) if s == "OK" => Ok(true),
            Reply::Bulk(None) | Reply::Array(None) => Ok(false),
            Reply::Error(e) => Err(FaroError::protocol(format!("SET NX failed: {}", e))),
            other => Err(FaroError::protocol(format!(
                "unexpected SET NX reply: {:?}",
                other
            ))),
        }
    }

    async fn del(&mut self, key: &str) -> FaroResult<bool> {
        let key = self.prefixed(key);
        match self.exec(&["DEL", &key]).await? {
            Reply::Int(n) => Ok(n > 0),
            Reply::Error(e) => Err(FaroError::protocol(format!("DEL failed: {}", e))),
            other => Err(FaroError::protocol(format!(
                "unexpected DEL reply: {:?}",
                other
            ))),
        }
    }

    async fn watch(&mut self, key: &str) -> FaroResult<()> {
        let key = self.prefixed(key);
        let reply = self.exec(&["WATCH", &key]).await?;
        self.expect_ok(reply, "WATCH")
    }

    async fn unwatch(&mut self) -> FaroResult<()> {
        let reply = self.exec(&["UNWATCH"]).await?;
        self.expect_ok(reply, "UNWATCH")
    }

    async fn transactional_set(&mut self, key: &str, value: &str) -> FaroResult<bool> {
        let key = self.prefixed(key);
        let reply = self.exec(&["MULTI"]).await?;
        self.expect_ok(reply, "MULTI")?;
        let reply = self.exec(&["SET", &key, value]).await?;
        self.expect_ok(reply, "SET")?;
        match self.exec(&["EXEC"]).await? {
            Reply::Array(Some(_)) => Ok(true),
            Reply::Array(None) | Reply::Bulk(None) => Ok(false),
            Reply::Error(e) => Err(FaroError::protocol(format!("EXEC failed: {}", e))),
            other => Err(FaroError::protocol(format!(
                "unexpected EXEC reply: {:?}",
                other
            ))),
        }
    }

    async fn transactional_del(&mut self, key: &str) -> FaroResult<bool> {
        let key = self.prefixed(key);
        let reply = self.exec(&["MULTI"]).await?;
        self.expect_ok(reply, "MULTI")?;
        let reply = self.exec(&["DEL", &key]).await?;
        self.expect_ok(reply, "DEL")?;
        match self.exec(&["EXEC"]).await? {
            Reply::Array(Some(_)) => Ok(true),
            Reply::Array(None) | Reply::Bulk(None) => Ok(false),
            Reply::Error(e) => Err(FaroError::protocol(format!("EXEC failed: {}", e))),
            other => Err(FaroError::protocol(format!(
                "unexpected EXEC reply: {:?}",
                other
            ))),
        }
    }
}

/// Default factory producing [`TcpConnection`]s.
pub struct TcpConnectionFactory;

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self, endpoint: &Endpoint) -> FaroResult<Box<dyn KvConnection>> {
        if endpoint.use_tls {
            return Err(FaroError::config(
                "TLS endpoints require a TLS-capable connection factory",
            ));
        }
        Ok(Box::new(TcpConnection::connect(endpoint.clone()).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    #[test]
    fn test_encode_command_format() {
        let mut buf = BytesMut::new();
        encode_command(&["PING"], &mut buf);
        assert_eq!(&buf[..], b"*1\r\n$4\r\nPING\r\n");

        buf.clear();
        encode_command(&["SET", "k", "v", "NX"], &mut buf);
        assert_eq!(&buf[..], b"*4\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nNX\r\n");
    }

    /// Scripted server that answers each command by keyword.
    async fn spawn_script_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                        let response: &[u8] = if request.contains("ROLE") {
                            b"*3\r\n$6\r\nmaster\r\n:3129659\r\n*0\r\n"
                        } else if request.contains("PING") {
                            b"+PONG\r\n"
                        } else if request.contains("GET") {
                            b"$-1\r\n"
                        } else {
                            b"+OK\r\n"
                        };
                        if stream.write_all(response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_ping_and_role_against_script_server() {
        let addr = spawn_script_server().await;
        let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());

        let mut conn = TcpConnection::connect(endpoint).await.unwrap();
        assert!(conn.is_connected());
        assert!(conn.ping().await.unwrap());
        assert_eq!(conn.role().await.unwrap(), ServerRole::Master);
        assert_eq!(conn.get("missing").await.unwrap(), None);
        tokio_test::assert_ok!(conn.watch("some-key").await);
    }

    #[tokio::test]
    async fn test_namespace_prefix_applies_to_keys() {
        let settings = ConnectionSettings {
            namespace_prefix: Some("app:".to_string()),
            ..Default::default()
        };

        let addr = spawn_script_server().await;
        let mut conn = TcpConnection::connect(Endpoint::new(addr.ip().to_string(), addr.port()))
            .await
            .unwrap();
        conn.apply_settings(&settings);
        assert_eq!(conn.prefixed("jobs"), "app:jobs");
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let mut endpoint = Endpoint::new("127.0.0.1", 1);
        endpoint.connect_timeout = Duration::from_millis(500);

        let result = TcpConnection::connect(endpoint).await;
        match result {
            Err(FaroError::Connection { .. }) => {}
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_tls_endpoint_rejected_by_default_factory() {
        let mut endpoint = Endpoint::new("127.0.0.1", 6379);
        endpoint.use_tls = true;

        let result = TcpConnectionFactory.connect(&endpoint).await;
        assert!(matches!(result, Err(FaroError::Config(_))));
    }
}
