//! Test doubles for the controller's peers.
//!
//! - [`FakeProxy`]: a proxy admin endpoint that records every slot push.
//! - [`FakeRedis`]: a RESP server that answers the commands the
//!   controller issues and moves one key per `SLOTSMGRTTAGSLOT`.
//! - [`TestServer`]: the `topom-server` binary on a free port.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use topom_core::{Config, ProductSecret, Topom};
use topom_models::{Group, GroupServer, MemoryClient, Proxy, Sentinel, Slot, Store};
use topom_protocol::{parse_frame, Frame};

/// Polls `check` every 20ms until it holds, panicking after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Controller settings with short RPC timeouts.
pub fn config(product: &str) -> Config {
    Config {
        product_name: product.into(),
        admin_addr: "127.0.0.1:0".into(),
        proxy_rpc_timeout_ms: 1000,
        backend_rpc_timeout_ms: 1000,
        migration_timeout_ms: 1000,
        ..Default::default()
    }
}

/// A controller on a fresh in-memory coordinator, plus a store view of
/// the same tree for seeding and inspecting state.
pub async fn controller(product: &str) -> (Arc<Topom>, MemoryClient, Store) {
    let client = MemoryClient::new();
    let topom = Topom::new(Arc::new(client.session()), config(product))
        .await
        .unwrap();
    let store = Store::new(Arc::new(client.session()), product);
    (topom, client, store)
}

/// Writes group `gid` straight into the store.
pub async fn seed_group(store: &Store, gid: u16, servers: &[&str]) {
    let mut g = Group::new(gid);
    g.servers = servers.iter().map(|&s| GroupServer::new(s)).collect();
    store.update_group(&g).await.unwrap();
}

// -- fake proxy --

struct ProxyState {
    model: Proxy,
    xauth: String,
    pushes: Mutex<Vec<Slot>>,
    sentinel: Mutex<Option<Sentinel>>,
    online: AtomicBool,
    shutdown: AtomicBool,
    fail_fill: AtomicBool,
    reject_locked: AtomicBool,
}

/// A proxy admin endpoint bound to a random local port.
pub struct FakeProxy {
    pub addr: String,
    pub token: String,
    state: Arc<ProxyState>,
    task: JoinHandle<()>,
}

impl FakeProxy {
    pub async fn start(product: &str, auth: &str) -> FakeProxy {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let addr = local.to_string();
        let token = format!("fake-proxy-{:05}", local.port());
        let model = Proxy {
            token: token.clone(),
            admin_addr: addr.clone(),
            product_name: product.to_owned(),
            proto_type: "tcp4".into(),
            proxy_addr: format!("127.0.0.1:{}", local.port().wrapping_add(1)),
            ..Default::default()
        };
        let state = Arc::new(ProxyState {
            xauth: ProductSecret::new(product, auth).proxy_xauth(&token),
            model,
            pushes: Mutex::new(Vec::new()),
            sentinel: Mutex::new(None),
            online: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            fail_fill: AtomicBool::new(false),
            reject_locked: AtomicBool::new(false),
        });

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(proxy_handle(&state, req).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        FakeProxy {
            addr,
            token,
            state,
            task,
        }
    }

    /// Makes every following slot push fail with a 500.
    pub fn fail_fill_slots(&self, fail: bool) {
        self.state.fail_fill.store(fail, Ordering::SeqCst);
    }

    /// Makes pushes that lock any slot fail with a 500.
    pub fn reject_locked(&self, reject: bool) {
        self.state.reject_locked.store(reject, Ordering::SeqCst);
    }

    /// Every accepted view of slot `sid`, oldest first.
    pub fn history(&self, sid: u16) -> Vec<Slot> {
        self.state
            .pushes
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.id == sid)
            .cloned()
            .collect()
    }

    /// The proxy's current routing table after merging every push.
    pub fn table(&self) -> BTreeMap<u16, Slot> {
        let mut table = BTreeMap::new();
        for s in self.state.pushes.lock().unwrap().iter() {
            table.insert(s.id, s.clone());
        }
        table
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    pub fn sentinel(&self) -> Option<Sentinel> {
        self.state.sentinel.lock().unwrap().clone()
    }
}

impl Drop for FakeProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn proxy_handle(state: &ProxyState, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let body = match req.into_body().collect().await {
        Ok(b) => b.to_bytes(),
        Err(_) => Bytes::new(),
    };
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segs.as_slice()) {
        (&Method::GET, ["api", "model"]) => json(&state.model),
        (_, ["api", .., xauth]) if *xauth != state.xauth => status(StatusCode::FORBIDDEN),
        (&Method::GET, ["api", "xping", _]) => json("OK"),
        (&Method::GET, ["api", "stats", _]) => json(&serde_json::json!({
            "online": state.online.load(Ordering::SeqCst),
            "closed": state.shutdown.load(Ordering::SeqCst),
        })),
        (&Method::PUT, ["api", "proxy", "start", _]) => {
            state.online.store(true, Ordering::SeqCst);
            json("OK")
        }
        (&Method::PUT, ["api", "proxy", "shutdown", _]) => {
            state.shutdown.store(true, Ordering::SeqCst);
            json("OK")
        }
        (&Method::PUT, ["api", "proxy", "slots", _]) => {
            if state.fail_fill.load(Ordering::SeqCst) {
                return status(StatusCode::INTERNAL_SERVER_ERROR);
            }
            match serde_json::from_slice::<Vec<Slot>>(&body) {
                Ok(slots)
                    if state.reject_locked.load(Ordering::SeqCst)
                        && slots.iter().any(|s| s.locked) =>
                {
                    status(StatusCode::INTERNAL_SERVER_ERROR)
                }
                Ok(slots) => {
                    state.pushes.lock().unwrap().extend(slots);
                    json("OK")
                }
                Err(_) => status(StatusCode::BAD_REQUEST),
            }
        }
        (&Method::PUT, ["api", "proxy", "sentinels", _]) => {
            match serde_json::from_slice::<Sentinel>(&body) {
                Ok(s) => {
                    *state.sentinel.lock().unwrap() = Some(s);
                    json("OK")
                }
                Err(_) => status(StatusCode::BAD_REQUEST),
            }
        }
        _ => status(StatusCode::NOT_FOUND),
    }
}

fn json<T: serde::Serialize + ?Sized>(value: &T) -> Response<Full<Bytes>> {
    Response::new(Full::new(Bytes::from(serde_json::to_vec(value).unwrap())))
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(code.as_str().to_owned())));
    *resp.status_mut() = code;
    resp
}

// -- fake backend --

struct RedisState {
    keys: Mutex<BTreeMap<u16, u64>>,
    commands: Mutex<Vec<Vec<String>>>,
    master: Mutex<String>,
}

/// A backend server speaking just enough RESP for the controller.
pub struct FakeRedis {
    pub addr: String,
    state: Arc<RedisState>,
    task: JoinHandle<()>,
}

impl FakeRedis {
    pub async fn start() -> FakeRedis {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(RedisState {
            keys: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            master: Mutex::new(String::new()),
        });
        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                tokio::spawn(redis_conn(stream, Arc::clone(&shared)));
            }
        });
        FakeRedis { addr, state, task }
    }

    /// Gives slot `sid` `n` keys on this server.
    pub fn set_keys(&self, sid: u16, n: u64) {
        self.state.keys.lock().unwrap().insert(sid, n);
    }

    pub fn keys(&self, sid: u16) -> u64 {
        self.state.keys.lock().unwrap().get(&sid).copied().unwrap_or(0)
    }

    /// Slot ids of every `SLOTSMGRTTAGSLOT` received, in order.
    pub fn migrations(&self) -> Vec<u16> {
        self.state
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c[0] == "SLOTSMGRTTAGSLOT")
            .filter_map(|c| c.get(4)?.parse().ok())
            .collect()
    }

    /// Every command received, upper-cased name first.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.commands.lock().unwrap().clone()
    }

    /// The master set by the last `SLAVEOF`, empty for a master.
    pub fn master(&self) -> String {
        self.state.master.lock().unwrap().clone()
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn redis_conn(mut stream: TcpStream, state: Arc<RedisState>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let (frame, consumed) = match parse_frame(&buf) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            },
            Err(_) => return,
        };
        let _ = buf.split_to(consumed);

        let args: Vec<String> = frame
            .into_array()
            .unwrap_or_default()
            .iter()
            .filter_map(|f| f.as_str().map(str::to_owned))
            .collect();
        let Some(name) = args.first().map(|n| n.to_ascii_uppercase()) else {
            continue;
        };
        let mut cmd = args.clone();
        cmd[0] = name.clone();
        state.commands.lock().unwrap().push(cmd);

        let reply = redis_reply(&state, &name, &args[1..]);
        let mut out = BytesMut::new();
        reply.serialize(&mut out);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn bulk(s: impl Into<String>) -> Frame {
    Frame::Bulk(Bytes::from(s.into()))
}

fn redis_reply(state: &RedisState, name: &str, args: &[String]) -> Frame {
    let arg = |i: usize| args.get(i).map(|s| s.to_ascii_uppercase()).unwrap_or_default();
    match name {
        "AUTH" => Frame::Simple("OK".into()),
        "PING" => Frame::Simple("PONG".into()),
        "INFO" => {
            let master = state.master.lock().unwrap().clone();
            let text = match master.rsplit_once(':') {
                Some((host, port)) => format!(
                    "# Replication\r\nrole:slave\r\nmaster_host:{host}\r\nmaster_port:{port}\r\n"
                ),
                None => "# Replication\r\nrole:master\r\n".to_owned(),
            };
            bulk(text)
        }
        "CONFIG" if arg(0) == "GET" => Frame::Array(vec![bulk(args[1].clone()), bulk("0")]),
        "CONFIG" => Frame::Simple("OK".into()),
        "SLAVEOF" => {
            let master = if arg(0) == "NO" && arg(1) == "ONE" {
                String::new()
            } else {
                format!("{}:{}", args[0], args[1])
            };
            *state.master.lock().unwrap() = master;
            Frame::Simple("OK".into())
        }
        "ROLE" => {
            let role = if state.master.lock().unwrap().is_empty() {
                "master"
            } else {
                "slave"
            };
            Frame::Array(vec![bulk(role)])
        }
        "SLOTSINFO" => Frame::Array(
            state
                .keys
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, &n)| n > 0)
                .map(|(&sid, &n)| Frame::Array(vec![Frame::Integer(sid as i64), Frame::Integer(n as i64)]))
                .collect(),
        ),
        "SLOTSMGRTTAGSLOT" => {
            let Some(sid) = args.get(3).and_then(|s| s.parse::<u16>().ok()) else {
                return Frame::Error("ERR invalid slot".into());
            };
            let mut keys = state.keys.lock().unwrap();
            let n = keys.entry(sid).or_insert(0);
            let moved = (*n > 0) as i64;
            *n = n.saturating_sub(1);
            Frame::Array(vec![Frame::Integer(moved), Frame::Integer(*n as i64)])
        }
        _ => Frame::Error(format!("ERR unknown command '{name}'")),
    }
}

// -- the binary --

/// A `topom-server` subprocess with a filesystem coordinator.
pub struct TestServer {
    child: Child,
    pub addr: String,
    pub xauth: String,
}

impl TestServer {
    /// Starts the binary for `product` on a free port and waits until
    /// it accepts connections. Returns `None` if the binary isn't built.
    pub fn start(product: &str, coordinator: &Path) -> Option<TestServer> {
        let port = find_free_port();
        let child = spawn_server(product, coordinator, port)?;
        let addr = format!("127.0.0.1:{port}");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if std::time::Instant::now() > deadline {
                panic!("topom-server failed to start within 5 seconds on {addr}");
            }
            if std::net::TcpStream::connect(&addr).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Some(TestServer {
            child,
            addr,
            xauth: ProductSecret::new(product, "").topom_xauth(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Waits up to `timeout` for the process to exit on its own.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        wait_child(&mut self.child, timeout)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawns the binary without waiting for it to listen.
pub fn spawn_server(product: &str, coordinator: &Path, port: u16) -> Option<Child> {
    let binary = server_binary()?;
    let child = Command::new(&binary)
        .arg("--admin-addr")
        .arg(format!("127.0.0.1:{port}"))
        .arg("--product-name")
        .arg(product)
        .arg("--coordinator-name")
        .arg("filesystem")
        .arg("--coordinator-addr")
        .arg(coordinator)
        .env("RUST_LOG", "error")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap_or_else(|e| panic!("failed to spawn topom-server at {}: {e}", binary.display()));
    Some(child)
}

pub fn wait_child(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        if std::time::Instant::now() > deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

pub fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Locates the topom-server binary next to the test binary.
pub fn server_binary() -> Option<PathBuf> {
    // test binary is in target/<profile>/deps/
    let mut path = std::env::current_exe().ok()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(format!("topom-server{}", std::env::consts::EXE_SUFFIX));
    if path.exists() {
        Some(path)
    } else {
        eprintln!(
            "topom-server binary not found at {}, skipping. run `cargo build` first.",
            path.display()
        );
        None
    }
}
