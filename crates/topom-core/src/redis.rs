//! Backend server connections.
//!
//! [`RedisClient`] is a single RESP connection with a per-command
//! deadline. [`RedisPool`] caches idle clients per address so the
//! dispatcher and the stats refresher don't redial on every tick.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use topom_protocol::{parse_frame, Frame, ProtocolError};
use tracing::debug;

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from a backend or sentinel connection.
#[derive(Debug, thiserror::Error)]
pub enum RedisError {
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server disconnected")]
    Disconnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with an error reply.
    #[error("{0}")]
    Server(String),

    #[error("unexpected reply to {cmd}: {reply}")]
    Unexpected { cmd: String, reply: String },

    #[error("invalid address '{0}'")]
    InvalidAddr(String),

    /// The client already failed once and must not be reused.
    #[error("use of failed redis client")]
    Failed,

    #[error("use of closed redis pool")]
    PoolClosed,
}

impl RedisError {
    fn unexpected(cmd: &str, reply: &Frame) -> Self {
        RedisError::Unexpected {
            cmd: cmd.to_owned(),
            reply: format!("{reply:?}"),
        }
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), RedisError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| RedisError::InvalidAddr(addr.to_owned()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port
        .parse()
        .map_err(|_| RedisError::InvalidAddr(addr.to_owned()))?;
    if host.is_empty() {
        return Err(RedisError::InvalidAddr(addr.to_owned()));
    }
    Ok((host, port))
}

/// A connection to one backend server.
pub struct RedisClient {
    addr: String,
    auth: String,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    timeout: Duration,
    last_use: Instant,
    failed: bool,
}

impl RedisClient {
    /// Dials `addr` and authenticates when `auth` is non-empty.
    pub async fn connect(addr: &str, auth: &str, timeout: Duration) -> Result<Self, RedisError> {
        split_host_port(addr)?;
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RedisError::Timeout(DIAL_TIMEOUT))??;
        stream.set_nodelay(true)?;
        let mut client = RedisClient {
            addr: addr.to_owned(),
            auth: auth.to_owned(),
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
            timeout,
            last_use: Instant::now(),
            failed: false,
        };
        if !auth.is_empty() {
            client.call(&["AUTH", auth]).await?;
        }
        debug!(addr, "redis client connected");
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one command and waits for its reply.
    ///
    /// Error replies come back as [`RedisError::Server`]; the connection
    /// stays usable. Any transport failure marks the client failed.
    pub async fn call(&mut self, parts: &[&str]) -> Result<Frame, RedisError> {
        self.call_with_timeout(parts, self.timeout).await
    }

    pub async fn call_with_timeout(
        &mut self,
        parts: &[&str],
        timeout: Duration,
    ) -> Result<Frame, RedisError> {
        if self.failed {
            return Err(RedisError::Failed);
        }
        self.write_buf.clear();
        Frame::command(parts).serialize(&mut self.write_buf);

        let result = tokio::time::timeout(timeout, async {
            self.stream.write_all(&self.write_buf).await?;
            self.stream.flush().await?;
            self.read_frame().await
        })
        .await
        .unwrap_or(Err(RedisError::Timeout(timeout)));

        match result {
            Ok(Frame::Error(msg)) => {
                self.last_use = Instant::now();
                Err(RedisError::Server(msg))
            }
            Ok(frame) => {
                self.last_use = Instant::now();
                Ok(frame)
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    /// Reads the next frame without sending anything. Used for pushed
    /// pub/sub messages.
    pub async fn read_frame(&mut self) -> Result<Frame, RedisError> {
        loop {
            if !self.read_buf.is_empty() {
                if let Some((frame, consumed)) = parse_frame(&self.read_buf)? {
                    let _ = self.read_buf.split_to(consumed);
                    return Ok(frame);
                }
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(RedisError::Disconnected);
            }
        }
    }

    /// `INFO` parsed into key/value pairs, plus `master_addr` for
    /// replicas and `maxmemory` from `CONFIG GET`.
    pub async fn info(&mut self) -> Result<BTreeMap<String, String>, RedisError> {
        let reply = self.call(&["INFO"]).await?;
        let text = reply
            .as_str()
            .ok_or_else(|| RedisError::unexpected("INFO", &reply))?;
        let mut info = parse_info(text);

        let host = info.get("master_host").cloned().unwrap_or_default();
        let port = info.get("master_port").cloned().unwrap_or_default();
        if !host.is_empty() || !port.is_empty() {
            info.insert("master_addr".into(), format!("{host}:{port}"));
        }

        let maxmemory = self.config_get_int("maxmemory").await?;
        info.insert("maxmemory".into(), maxmemory.to_string());
        Ok(info)
    }

    async fn config_get_int(&mut self, key: &str) -> Result<i64, RedisError> {
        let reply = self.call(&["CONFIG", "GET", key]).await?;
        let value = match &reply {
            Frame::Array(items) if items.len() == 2 => items[1].as_integer(),
            Frame::Map(pairs) if pairs.len() == 1 => pairs[0].1.as_integer(),
            _ => None,
        };
        value.ok_or_else(|| RedisError::unexpected("CONFIG GET", &reply))
    }

    /// Points this server at `master`. An empty master (or `NO:ONE`)
    /// turns it into a master.
    pub async fn set_master(&mut self, master: &str) -> Result<(), RedisError> {
        if master.is_empty() || master.eq_ignore_ascii_case("NO:ONE") {
            self.call(&["SLAVEOF", "NO", "ONE"]).await?;
            return Ok(());
        }
        let (host, port) = split_host_port(master)?;
        let port = port.to_string();
        if !self.auth.is_empty() {
            let auth = self.auth.clone();
            self.call(&["CONFIG", "SET", "masterauth", &auth]).await?;
        }
        self.call(&["SLAVEOF", host, &port]).await?;
        Ok(())
    }

    /// Moves one batch of keys of `slot` to `target` with
    /// `SLOTSMGRTTAGSLOT`. Returns the number of keys still left.
    pub async fn migrate_slot(
        &mut self,
        slot: u16,
        target: &str,
        timeout: Duration,
    ) -> Result<u64, RedisError> {
        let (host, port) = split_host_port(target)?;
        let port = port.to_string();
        let ms = timeout.as_millis().to_string();
        let sid = slot.to_string();
        let reply = self
            .call_with_timeout(
                &["SLOTSMGRTTAGSLOT", host, &port, &ms, &sid],
                timeout + self.timeout,
            )
            .await?;
        let counts = match &reply {
            Frame::Array(items) if items.len() == 2 => {
                items[0].as_integer().zip(items[1].as_integer())
            }
            _ => None,
        };
        match counts {
            Some((_, remain)) if remain >= 0 => Ok(remain as u64),
            _ => Err(RedisError::unexpected("SLOTSMGRTTAGSLOT", &reply)),
        }
    }

    /// `SLOTSINFO`: key counts for every non-empty slot.
    pub async fn slots_info(&mut self) -> Result<BTreeMap<u16, u64>, RedisError> {
        let reply = self.call(&["SLOTSINFO"]).await?;
        let mut slots = BTreeMap::new();
        let rows = match &reply {
            Frame::Array(rows) => rows,
            _ => return Err(RedisError::unexpected("SLOTSINFO", &reply)),
        };
        for row in rows {
            let pair = match row {
                Frame::Array(p) if p.len() == 2 => p[0].as_integer().zip(p[1].as_integer()),
                _ => None,
            };
            match pair {
                Some((sid, n)) if (0..=u16::MAX as i64).contains(&sid) && n >= 0 => {
                    slots.insert(sid as u16, n as u64);
                }
                _ => return Err(RedisError::unexpected("SLOTSINFO", &reply)),
            }
        }
        Ok(slots)
    }

    /// The first element of `ROLE`: `master`, `slave` or `sentinel`.
    pub async fn role(&mut self) -> Result<String, RedisError> {
        let reply = self.call(&["ROLE"]).await?;
        let role = match &reply {
            Frame::Array(items) => items.first().and_then(Frame::as_str),
            _ => None,
        };
        role.map(str::to_owned)
            .ok_or_else(|| RedisError::unexpected("ROLE", &reply))
    }

    fn is_recyclable(&self, idle_timeout: Duration) -> bool {
        !self.failed && (idle_timeout.is_zero() || self.last_use.elapsed() < idle_timeout)
    }
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("addr", &self.addr)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

fn parse_info(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .filter_map(|(k, v)| {
            let k = k.trim();
            (!k.is_empty() && !k.starts_with('#')).then(|| (k.to_owned(), v.trim().to_owned()))
        })
        .collect()
}

/// Idle connection cache keyed by server address.
///
/// Borrowers get exclusive use of a client until they hand it back with
/// [`put_client`](Self::put_client). Clients that failed or sat idle past
/// the timeout are dropped instead of reused.
pub struct RedisPool {
    auth: String,
    rpc_timeout: Duration,
    idle_timeout: Duration,
    pool: Mutex<HashMap<String, VecDeque<RedisClient>>>,
    closed: AtomicBool,
}

impl RedisPool {
    pub fn new(auth: &str, rpc_timeout: Duration, idle_timeout: Duration) -> Self {
        RedisPool {
            auth: auth.to_owned(),
            rpc_timeout,
            idle_timeout,
            pool: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Returns a cached client for `addr`, or dials a new one.
    pub async fn get_client(&self, addr: &str) -> Result<RedisClient, RedisError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RedisError::PoolClosed);
        }
        {
            let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = pool.get_mut(addr) {
                while let Some(c) = list.pop_front() {
                    if c.is_recyclable(self.idle_timeout) {
                        return Ok(c);
                    }
                }
            }
        }
        RedisClient::connect(addr, &self.auth, self.rpc_timeout).await
    }

    /// Hands a client back. Failed or stale clients are closed.
    pub fn put_client(&self, c: RedisClient) {
        if self.closed.load(Ordering::Acquire) || !c.is_recyclable(self.idle_timeout) {
            debug!(addr = c.addr(), "redis client dropped");
            return;
        }
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        pool.entry(c.addr.clone()).or_default().push_front(c);
    }

    /// Drops every client that is no longer recyclable.
    pub fn cleanup(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        for list in pool.values_mut() {
            list.retain(|c| c.is_recyclable(self.idle_timeout));
        }
        pool.retain(|_, list| !list.is_empty());
    }

    /// Number of idle clients currently cached.
    pub fn idle_count(&self) -> usize {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        pool.values().map(VecDeque::len).sum()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Borrows a client, runs `INFO` on it and hands it back.
    pub async fn info(&self, addr: &str) -> Result<BTreeMap<String, String>, RedisError> {
        let mut c = self.get_client(addr).await?;
        let result = c.info().await;
        self.put_client(c);
        result
    }
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("idle", &self.idle_count())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
