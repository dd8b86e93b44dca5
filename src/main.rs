use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::io::{self, Write as _};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_IRAN_IP: &str = "127.0.0.1";
const DEFAULT_BRIDGE_PORT: u16 = 7000;
const DEFAULT_SYNC_PORT: u16 = 7001;

const SYNC_MAGIC: &[u8; 3] = b"PT1";
const HEARTBEAT_HEADER: u16 = 0;

const IR_FD_SHARE: f64 = 0.22;
const EU_FD_SHARE: f64 = 0.30;
const FD_RESERVE: u64 = 800;
const POOL_MIN: usize = 100;
const POOL_MAX: usize = 2000;

const BACKOFF_CAP: Duration = Duration::from_secs(5);
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(5);
const HEARTBEAT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const SYNC_WARN_INTERVAL: Duration = Duration::from_secs(60);

// ---- configuration ----

#[derive(Debug, Clone)]
struct Tunables {
    dial_timeout: Duration,
    pool_wait: Duration,
    keepalive_secs: u64,
    sockbuf: usize,
    copy_chunk: usize,
    sync_interval: Duration,
    backlog_bridge: u32,
    backlog_ports: u32,
    backlog_sync: u32,
    drain_threshold: usize,
    max_sync_ports: usize,
    pool_max_age: Duration,
    pool_ping_interval: Duration,
    pool_recycle_interval: Duration,
    session_idle: Duration,
    max_sessions: usize,
    dial_concurrency: usize,
    ir_bind: String,
    eu_local_host: String,
    pool_override: Option<usize>,
    nofile_target: u64,
    health_bind: Option<String>,
}

impl Tunables {
    fn from_env() -> Self {
        Self {
            dial_timeout: env_secs("DIAL_TIMEOUT", 5.0),
            pool_wait: env_secs("POOL_WAIT", 15.0),
            keepalive_secs: env_parse("KEEPALIVE_SECS", 15u64).max(1),
            sockbuf: env_parse("SOCKBUF", 0usize),
            copy_chunk: env_parse("COPY_CHUNK", 64 * 1024usize).max(1),
            sync_interval: env_secs("SYNC_INTERVAL", 5.0),
            backlog_bridge: env_parse("BACKLOG_BRIDGE", 1024u32),
            backlog_ports: env_parse("BACKLOG_PORTS", 1024u32),
            backlog_sync: env_parse("BACKLOG_SYNC", 128u32),
            drain_threshold: env_parse("DRAIN_THRESHOLD", 1024 * 1024usize).max(1),
            max_sync_ports: env_parse("MAX_SYNC_PORTS", 512usize).max(1),
            pool_max_age: env_secs("POOL_MAX_AGE", 300.0),
            pool_ping_interval: env_secs("POOL_PING_INTERVAL", 30.0),
            pool_recycle_interval: env_secs_or_off("POOL_RECYCLE_INTERVAL", 0.0),
            session_idle: env_secs_or_off("SESSION_IDLE", 600.0),
            max_sessions: env_parse("MAX_SESSIONS", 0usize),
            dial_concurrency: env_parse("DIAL_CONCURRENCY", 128usize).max(1),
            ir_bind: env_string("IR_BIND", "0.0.0.0"),
            eu_local_host: env_string("EU_LOCAL_HOST", "127.0.0.1"),
            pool_override: std::env::var("PAHLAVI_POOL")
                .ok()
                .and_then(|raw| raw.trim().parse::<usize>().ok()),
            nofile_target: env_parse("NOFILE_TARGET", 65_535u64),
            health_bind: std::env::var("PAHLAVI_HEALTH_BIND")
                .ok()
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty()),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(format!("PAHLAVI_{name}")) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: f64) -> Duration {
    let secs: f64 = env_parse(name, default);
    let secs = if secs.is_finite() && secs > 0.0 {
        secs
    } else {
        default
    };
    Duration::from_secs_f64(secs)
}

/// For tunables where zero is a documented "disabled" sentinel. Negative and
/// non-finite values still fall back to the default.
fn env_secs_or_off(name: &str, default: f64) -> Duration {
    let secs: f64 = env_parse(name, default);
    let secs = if secs.is_finite() && secs >= 0.0 {
        secs
    } else {
        default
    };
    if secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

fn env_string(name: &str, default: &str) -> String {
    match std::env::var(format!("PAHLAVI_{name}")) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        _ => default.to_string(),
    }
}

#[derive(Debug, Clone)]
struct IrConfig {
    bridge_port: u16,
    sync_port: u16,
    pool_size: usize,
    auto_sync: bool,
    manual_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
struct EuConfig {
    iran_ip: String,
    bridge_port: u16,
    sync_port: u16,
    pool_size: usize,
    enable_autosync: bool,
}

enum RoleConfig {
    Ir(IrConfig),
    Eu(EuConfig),
}

// ---- startup resources ----

fn auto_pool_size(nofile_soft: u64, ram_mib: Option<u64>, share: f64) -> usize {
    let fd_budget = nofile_soft.saturating_sub(FD_RESERVE) as f64;
    let by_fd = fd_budget * share;
    let ram_cap = match ram_mib {
        Some(mib) => (mib as f64 / 1024.0) * 250.0,
        None => 500.0,
    };
    (by_fd.min(ram_cap) as usize).clamp(POOL_MIN, POOL_MAX)
}

fn resolve_pool_size(tun: &Tunables, share: f64, nofile_soft: u64) -> usize {
    match tun.pool_override {
        Some(n) => n.max(1),
        None => auto_pool_size(nofile_soft, read_total_ram_mib(), share),
    }
}

fn read_total_ram_mib() -> Option<u64> {
    let body = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(unix)]
fn raise_nofile_limit(target: u64) -> u64 {
    unsafe {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) != 0 {
            return 1024;
        }
        let want = target.min(lim.rlim_max as u64);
        if (lim.rlim_cur as u64) < want {
            let raised = libc::rlimit {
                rlim_cur: want as libc::rlim_t,
                rlim_max: lim.rlim_max,
            };
            if libc::setrlimit(libc::RLIMIT_NOFILE, &raised) == 0 {
                return want;
            }
        }
        lim.rlim_cur as u64
    }
}

#[cfg(not(unix))]
fn raise_nofile_limit(_target: u64) -> u64 {
    1024
}

// ---- socket helpers ----

fn tune_socket(stream: &TcpStream, tun: &Tunables) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(tun.keepalive_secs))
        .with_interval(Duration::from_secs(tun.keepalive_secs));
    #[cfg(target_os = "linux")]
    let keepalive = keepalive.with_retries(3);
    let _ = sock.set_tcp_keepalive(&keepalive);
    if tun.sockbuf > 0 {
        let _ = sock.set_recv_buffer_size(tun.sockbuf);
        let _ = sock.set_send_buffer_size(tun.sockbuf);
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn bind_listener_with_retry(
    addr: SocketAddr,
    backlog: u32,
    label: &'static str,
) -> Result<TcpListener> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match bind_listener(addr, backlog) {
            Ok(listener) => return Ok(listener),
            Err(err) if attempt < 3 => {
                warn!(%addr, %err, listener = label, "bind failed; retrying");
                sleep(Duration::from_secs(1)).await;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("cannot bind {label} listener on {addr}"))
            }
        }
    }
}

// ---- stop signal ----

async fn wait_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ---- supervisor ----

async fn supervise<F, Fut>(
    name: &'static str,
    mut stop: watch::Receiver<bool>,
    initial_backoff: Duration,
    factory: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut backoff = initial_backoff;
    while !*stop.borrow() {
        let started = Instant::now();
        let outcome = tokio::select! {
            result = factory() => Some(result),
            _ = wait_stop(&mut stop) => None,
        };
        let Some(outcome) = outcome else { break };
        if started.elapsed() >= BACKOFF_RESET_AFTER {
            backoff = initial_backoff;
        }
        match outcome {
            Ok(()) => {
                trace!(task = name, "task returned; restarting");
            }
            Err(err) => {
                debug!(task = name, %err, "task failed; backing off");
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = wait_stop(&mut stop) => break,
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
    trace!(task = name, "supervisor stopped");
}

// ---- bridge pool ----

struct PooledConn {
    stream: TcpStream,
    created_at: Instant,
}

struct BridgePool {
    queue: Mutex<VecDeque<PooledConn>>,
    notify: Notify,
    capacity: usize,
}

impl BridgePool {
    fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Never blocks; an entry that does not fit is closed by dropping it.
    async fn put(&self, conn: PooledConn) -> bool {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(conn);
        drop(queue);
        self.notify.notify_one();
        true
    }

    async fn get(&self, wait: Duration) -> Option<PooledConn> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(conn) = self.queue.lock().await.pop_front() {
                return Some(conn);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if timeout(remaining, self.notify.notified()).await.is_err() {
                return self.queue.lock().await.pop_front();
            }
        }
    }

    /// Drains the queue in one sweep, closes entries at or past `max_age`,
    /// and re-enqueues the rest. Returns how many entries were closed.
    async fn recycle_stale(&self, max_age: Duration) -> usize {
        let mut queue = self.queue.lock().await;
        let drained: Vec<PooledConn> = queue.drain(..).collect();
        let mut dropped = 0;
        for conn in drained {
            if conn.created_at.elapsed() >= max_age || queue.len() >= self.capacity {
                dropped += 1;
                continue;
            }
            queue.push_back(conn);
        }
        let kept = queue.len();
        drop(queue);
        for _ in 0..kept {
            self.notify.notify_one();
        }
        dropped
    }

    async fn drain_all(&self) -> Vec<PooledConn> {
        self.queue.lock().await.drain(..).collect()
    }

    async fn depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn clear(&self) {
        self.queue.lock().await.clear();
    }
}

// ---- bidirectional proxy ----

#[derive(Debug, Clone, Copy, Default)]
struct RelayStats {
    up_bytes: u64,
    down_bytes: u64,
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    tun: Arc<Tunables>,
    activity: Arc<AtomicU64>,
    transferred: Arc<AtomicU64>,
    started: Instant,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; tun.copy_chunk];
    let mut unflushed = 0usize;
    loop {
        let read = if tun.session_idle.is_zero() {
            reader.read(&mut buf).await
        } else {
            match timeout(tun.session_idle, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => break,
            }
        };
        let n = match read {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        // The counter outlives the task, so bytes copied before a cancel
        // still show up in the session stats.
        transferred.fetch_add(n as u64, Ordering::Relaxed);
        unflushed += n;
        if unflushed >= tun.drain_threshold {
            if writer.flush().await.is_err() {
                break;
            }
            unflushed = 0;
        }
    }
    // Best-effort write half-close; the peer's read loop treats reset as EOF.
    let _ = writer.shutdown().await;
}

async fn proxy_streams(
    a: TcpStream,
    b: TcpStream,
    tun: Arc<Tunables>,
    mut stop: watch::Receiver<bool>,
) -> RelayStats {
    let started = Instant::now();
    let activity = Arc::new(AtomicU64::new(0));
    let up_bytes = Arc::new(AtomicU64::new(0));
    let down_bytes = Arc::new(AtomicU64::new(0));
    let (a_read, a_write) = a.into_split();
    let (b_read, b_write) = b.into_split();

    let mut up = tokio::spawn(copy_half(
        a_read,
        b_write,
        tun.clone(),
        activity.clone(),
        up_bytes.clone(),
        started,
    ));
    let mut down = tokio::spawn(copy_half(
        b_read,
        a_write,
        tun.clone(),
        activity.clone(),
        down_bytes.clone(),
        started,
    ));

    let idle = tun.session_idle;
    let activity_watch = activity.clone();
    let watchdog = async move {
        if idle.is_zero() {
            std::future::pending::<()>().await;
        }
        let tick = (idle / 4).max(Duration::from_millis(250));
        loop {
            sleep(tick).await;
            let last = Duration::from_millis(activity_watch.load(Ordering::Relaxed));
            if started.elapsed().saturating_sub(last) > idle {
                break;
            }
        }
    };
    tokio::pin!(watchdog);

    tokio::select! {
        _ = &mut up => {
            down.abort();
            let _ = down.await;
        }
        _ = &mut down => {
            up.abort();
            let _ = up.await;
        }
        _ = &mut watchdog => {
            up.abort();
            down.abort();
            let _ = up.await;
            let _ = down.await;
        }
        _ = wait_stop(&mut stop) => {
            up.abort();
            down.abort();
            let _ = up.await;
            let _ = down.await;
        }
    }
    RelayStats {
        up_bytes: up_bytes.load(Ordering::Relaxed),
        down_bytes: down_bytes.load(Ordering::Relaxed),
    }
}

// ---- sync wire format ----

fn build_sync_frame(ports: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + ports.len() * 2);
    frame.extend_from_slice(SYNC_MAGIC);
    frame.extend_from_slice(&(ports.len() as u16).to_be_bytes());
    for port in ports {
        frame.extend_from_slice(&port.to_be_bytes());
    }
    frame
}

async fn read_u8_or_eof<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte).await {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Reads one framed port announcement. Returns `Ok(None)` on a clean EOF at a
/// message boundary. The header is consumed byte-accurately: a legacy count
/// byte is read alone, so the two bytes following it are always the first
/// port, and a legacy count of zero consumes nothing further.
async fn read_sync_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_ports: usize,
) -> io::Result<Option<Vec<u16>>> {
    let Some(first) = read_u8_or_eof(reader).await? else {
        return Ok(None);
    };
    let count = if first == SYNC_MAGIC[0] {
        let mut rest = [0u8; 2];
        reader.read_exact(&mut rest).await?;
        if &rest != b"T1" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad sync frame magic",
            ));
        }
        let mut count = [0u8; 2];
        reader.read_exact(&mut count).await?;
        u16::from_be_bytes(count) as usize
    } else {
        first as usize
    };
    // Every announced port is consumed from the wire so framing survives a
    // count above the configured ceiling; only the applied list is truncated.
    let mut ports = Vec::with_capacity(count.min(max_ports));
    let mut port = [0u8; 2];
    for _ in 0..count {
        reader.read_exact(&mut port).await?;
        if ports.len() < max_ports {
            ports.push(u16::from_be_bytes(port));
        }
    }
    Ok(Some(ports))
}

// ---- ir role ----

struct IrContext {
    tun: Arc<Tunables>,
    cfg: IrConfig,
    bind_ip: IpAddr,
    pool: Arc<BridgePool>,
    session_slots: Option<Arc<Semaphore>>,
    stop: watch::Receiver<bool>,
}

async fn bridge_accept_loop(
    listener: Arc<TcpListener>,
    pool: Arc<BridgePool>,
    tun: Arc<Tunables>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = wait_stop(&mut stop) => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("bridge accept failed")?;
                tune_socket(&stream, &tun);
                let conn = PooledConn { stream, created_at: Instant::now() };
                if pool.put(conn).await {
                    trace!(%peer, "pool connection enqueued");
                } else {
                    debug!(%peer, "bridge pool full; closing surplus connection");
                }
            }
        }
    }
}

#[derive(Default)]
struct ListenerController {
    active: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl ListenerController {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reconciles the set of user-facing listeners with `ports`. The diff is
    /// snapshotted under the lock and every bind happens outside it. Returns
    /// how many listeners were opened and closed.
    async fn apply_desired(&self, ports: &[u16], ctx: &Arc<IrContext>) -> (usize, usize) {
        let desired: HashSet<u16> = ports
            .iter()
            .copied()
            .filter(|p| *p != 0 && *p != ctx.cfg.bridge_port && *p != ctx.cfg.sync_port)
            .collect();

        let (to_open, to_close) = {
            let active = self.active.lock().await;
            let to_open: Vec<u16> = desired
                .iter()
                .copied()
                .filter(|p| !active.contains_key(p))
                .collect();
            let to_close: Vec<u16> = active
                .keys()
                .copied()
                .filter(|p| !desired.contains(p))
                .collect();
            (to_open, to_close)
        };

        let mut opened = 0;
        for port in to_open {
            let addr = SocketAddr::new(ctx.bind_ip, port);
            match bind_listener(addr, ctx.tun.backlog_ports) {
                Ok(listener) => {
                    let mut active = self.active.lock().await;
                    if active.contains_key(&port) {
                        continue;
                    }
                    let handle = tokio::spawn(user_accept_loop(listener, port, ctx.clone()));
                    active.insert(port, handle);
                    opened += 1;
                    info!(port, "user listener opened");
                }
                Err(err) => {
                    warn!(port, %err, "failed to bind user listener; skipping");
                }
            }
        }

        let mut closing = Vec::with_capacity(to_close.len());
        {
            let mut active = self.active.lock().await;
            for port in to_close {
                if let Some(handle) = active.remove(&port) {
                    closing.push((port, handle));
                }
            }
        }
        let closed = closing.len();
        for (port, handle) in closing {
            handle.abort();
            info!(port, "user listener closed");
        }
        (opened, closed)
    }

    async fn close_all(&self) {
        let handles: Vec<(u16, JoinHandle<()>)> = self.active.lock().await.drain().collect();
        for (port, handle) in handles {
            handle.abort();
            info!(port, "user listener closed");
        }
    }

    async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

async fn user_accept_loop(listener: TcpListener, port: u16, ctx: Arc<IrContext>) {
    let mut stop = ctx.stop.clone();
    loop {
        tokio::select! {
            _ = wait_stop(&mut stop) => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((user, _peer)) => {
                        tune_socket(&user, &ctx.tun);
                        tokio::spawn(handle_user_session(user, port, ctx.clone()));
                    }
                    Err(err) => {
                        warn!(port, %err, "user accept failed");
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn handle_user_session(user: TcpStream, port: u16, ctx: Arc<IrContext>) {
    let tun = &ctx.tun;
    let deadline = tokio::time::Instant::now() + tun.pool_wait;
    let tunnel = loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            debug!(port, "no pool connection within pool-wait; dropping user");
            return;
        }
        let Some(mut conn) = ctx.pool.get(remaining).await else {
            debug!(port, "no pool connection within pool-wait; dropping user");
            return;
        };
        if conn.created_at.elapsed() >= tun.pool_max_age {
            trace!(port, "discarding aged pool connection");
            continue;
        }
        let committed = async {
            conn.stream.write_all(&port.to_be_bytes()).await?;
            conn.stream.flush().await
        }
        .await;
        match committed {
            Ok(()) => break conn.stream,
            Err(err) => {
                trace!(port, %err, "assignment header write failed; redrawing");
                continue;
            }
        }
    };

    let _slot = if let Some(slots) = &ctx.session_slots {
        let mut stop = ctx.stop.clone();
        tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            _ = wait_stop(&mut stop) => return,
        }
    } else {
        None
    };

    let stats = proxy_streams(user, tunnel, ctx.tun.clone(), ctx.stop.clone()).await;
    debug!(
        port,
        up = stats.up_bytes,
        down = stats.down_bytes,
        "user session finished"
    );
}

async fn sync_accept_loop(
    listener: Arc<TcpListener>,
    controller: Arc<ListenerController>,
    ctx: Arc<IrContext>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = wait_stop(&mut stop) => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("sync accept failed")?;
                tune_socket(&stream, &ctx.tun);
                info!(%peer, "sync peer connected");
                tokio::spawn(handle_sync_connection(stream, controller.clone(), ctx.clone()));
            }
        }
    }
}

async fn handle_sync_connection(
    mut stream: TcpStream,
    controller: Arc<ListenerController>,
    ctx: Arc<IrContext>,
) {
    let peer = stream
        .peer_addr()
        .map(|p| p.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let mut stop = ctx.stop.clone();
    loop {
        let message = tokio::select! {
            message = read_sync_message(&mut stream, ctx.tun.max_sync_ports) => message,
            _ = wait_stop(&mut stop) => return,
        };
        match message {
            Ok(Some(ports)) => {
                let (opened, closed) = controller.apply_desired(&ports, &ctx).await;
                if opened + closed > 0 {
                    info!(peer = %peer, ports = ports.len(), opened, closed, "port set applied");
                } else {
                    trace!(peer = %peer, ports = ports.len(), "port set unchanged");
                }
            }
            Ok(None) => {
                debug!(peer = %peer, "sync peer disconnected");
                return;
            }
            Err(err) => {
                debug!(peer = %peer, %err, "sync connection closed on parse error");
                return;
            }
        }
    }
}

async fn pool_pinger(
    pool: Arc<BridgePool>,
    tun: Arc<Tunables>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = sleep(tun.pool_ping_interval) => {}
            _ = wait_stop(&mut stop) => return Ok(()),
        }
        let entries = pool.drain_all().await;
        let total = entries.len();
        let mut kept = 0;
        for mut conn in entries {
            if conn.created_at.elapsed() >= tun.pool_max_age {
                continue;
            }
            let ping = timeout(HEARTBEAT_WRITE_TIMEOUT, async {
                conn.stream
                    .write_all(&HEARTBEAT_HEADER.to_be_bytes())
                    .await?;
                conn.stream.flush().await
            })
            .await;
            if matches!(ping, Ok(Ok(()))) && pool.put(conn).await {
                kept += 1;
            }
        }
        if kept < total {
            debug!(total, kept, "pool ping sweep dropped entries");
        }
    }
}

async fn pool_recycler(
    pool: Arc<BridgePool>,
    tun: Arc<Tunables>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let every = if tun.pool_recycle_interval.is_zero() {
        Duration::from_secs_f64((tun.pool_max_age.as_secs_f64() / 2.0).clamp(5.0, 30.0))
    } else {
        tun.pool_recycle_interval
    };
    loop {
        tokio::select! {
            _ = sleep(every) => {}
            _ = wait_stop(&mut stop) => return Ok(()),
        }
        let dropped = pool.recycle_stale(tun.pool_max_age).await;
        if dropped > 0 {
            debug!(dropped, "recycled stale pool connections");
        }
    }
}

async fn run_ir_mode(
    cfg: IrConfig,
    tun: Arc<Tunables>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let bind_ip: IpAddr = tun.ir_bind.parse().unwrap_or_else(|_| {
        warn!(bind = %tun.ir_bind, "invalid bind address; falling back to 0.0.0.0");
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    });
    let pool = BridgePool::new(cfg.pool_size.saturating_mul(2).max(2));
    let session_slots = (tun.max_sessions > 0).then(|| Arc::new(Semaphore::new(tun.max_sessions)));

    let bridge_listener = Arc::new(
        bind_listener_with_retry(
            SocketAddr::new(bind_ip, cfg.bridge_port),
            tun.backlog_bridge,
            "bridge",
        )
        .await?,
    );

    let controller = ListenerController::new();
    let ctx = Arc::new(IrContext {
        tun: tun.clone(),
        cfg: cfg.clone(),
        bind_ip,
        pool: pool.clone(),
        session_slots,
        stop: stop.clone(),
    });

    info!(
        bridge = cfg.bridge_port,
        sync = cfg.sync_port,
        pool = cfg.pool_size,
        auto_sync = cfg.auto_sync,
        bind = %bind_ip,
        "ir mode ready"
    );

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    {
        let listener = bridge_listener.clone();
        let pool = pool.clone();
        let tun2 = tun.clone();
        let stop_inner = stop.clone();
        tasks.push(tokio::spawn(supervise(
            "bridge-accept",
            stop.clone(),
            Duration::from_millis(200),
            move || {
                bridge_accept_loop(
                    listener.clone(),
                    pool.clone(),
                    tun2.clone(),
                    stop_inner.clone(),
                )
            },
        )));
    }

    if cfg.auto_sync {
        let sync_listener = Arc::new(
            bind_listener_with_retry(
                SocketAddr::new(bind_ip, cfg.sync_port),
                tun.backlog_sync,
                "sync",
            )
            .await?,
        );
        let controller2 = controller.clone();
        let ctx2 = ctx.clone();
        let stop_inner = stop.clone();
        tasks.push(tokio::spawn(supervise(
            "sync-accept",
            stop.clone(),
            Duration::from_millis(200),
            move || {
                sync_accept_loop(
                    sync_listener.clone(),
                    controller2.clone(),
                    ctx2.clone(),
                    stop_inner.clone(),
                )
            },
        )));
    } else {
        let (opened, _) = controller.apply_desired(&cfg.manual_ports, &ctx).await;
        info!(
            requested = cfg.manual_ports.len(),
            opened, "manual listeners applied"
        );
    }

    {
        let pool2 = pool.clone();
        let tun2 = tun.clone();
        let stop_inner = stop.clone();
        tasks.push(tokio::spawn(supervise(
            "pool-ping",
            stop.clone(),
            Duration::from_millis(200),
            move || pool_pinger(pool2.clone(), tun2.clone(), stop_inner.clone()),
        )));
    }
    {
        let pool2 = pool.clone();
        let tun2 = tun.clone();
        let stop_inner = stop.clone();
        tasks.push(tokio::spawn(supervise(
            "pool-recycle",
            stop.clone(),
            Duration::from_millis(200),
            move || pool_recycler(pool2.clone(), tun2.clone(), stop_inner.clone()),
        )));
    }

    if let Some(bind) = tun.health_bind.clone() {
        spawn_health_listener(
            bind,
            Arc::new(HealthState {
                role: "ir",
                started: Instant::now(),
                pool: Some(pool.clone()),
                controller: Some(controller.clone()),
            }),
            stop.clone(),
        );
    }

    let mut stop_main = stop.clone();
    wait_stop(&mut stop_main).await;
    info!("shutting down");
    controller.close_all().await;
    pool.clear().await;
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
    info!("shutdown complete");
    Ok(())
}

// ---- eu role ----

/// Reads 2-byte headers until a nonzero assignment arrives. Zero headers are
/// heartbeats and never consume the following assignment. Returns `Ok(None)`
/// when `window` lapses with the connection still unassigned.
async fn await_assignment(stream: &mut TcpStream, window: Duration) -> io::Result<Option<u16>> {
    let deadline = tokio::time::Instant::now() + window;
    let mut header = [0u8; 2];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match timeout(remaining, stream.read_exact(&mut header)).await {
            Err(_) => return Ok(None),
            Ok(Ok(_)) => {
                let port = u16::from_be_bytes(header);
                if port != HEARTBEAT_HEADER {
                    return Ok(Some(port));
                }
            }
            Ok(Err(err)) => return Err(err),
        }
    }
}

async fn dialer_worker(
    id: usize,
    cfg: EuConfig,
    tun: Arc<Tunables>,
    dial_slots: Arc<Semaphore>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let mut tunnel = {
        let _permit = dial_slots
            .acquire()
            .await
            .map_err(|_| anyhow!("dial semaphore closed"))?;
        timeout(
            tun.dial_timeout,
            TcpStream::connect((cfg.iran_ip.as_str(), cfg.bridge_port)),
        )
        .await
        .map_err(|_| anyhow!("bridge dial timed out"))?
        .with_context(|| format!("bridge dial to {}:{} failed", cfg.iran_ip, cfg.bridge_port))?
    };
    tune_socket(&tunnel, &tun);
    trace!(worker = id, "pool connection established");

    // The peer recycles unassigned entries at pool-max-age; mirror that bound
    // locally so a silent peer cannot pin the worker.
    let window = tun.pool_max_age + Duration::from_secs(30);
    let port = tokio::select! {
        assignment = await_assignment(&mut tunnel, window) => assignment?,
        _ = wait_stop(&mut stop) => return Ok(()),
    };
    let Some(port) = port else {
        trace!(worker = id, "pool connection aged out unassigned");
        return Ok(());
    };

    let local = timeout(
        tun.dial_timeout,
        TcpStream::connect((tun.eu_local_host.as_str(), port)),
    )
    .await
    .map_err(|_| anyhow!("local dial timed out"))?
    .with_context(|| format!("local dial to {}:{} failed", tun.eu_local_host, port))?;
    tune_socket(&local, &tun);

    let stats = proxy_streams(local, tunnel, tun.clone(), stop.clone()).await;
    debug!(
        worker = id,
        port,
        up = stats.up_bytes,
        down = stats.down_bytes,
        "assignment finished"
    );
    Ok(())
}

async fn autosync_client(
    cfg: EuConfig,
    tun: Arc<Tunables>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let mut stream = timeout(
        tun.dial_timeout,
        TcpStream::connect((cfg.iran_ip.as_str(), cfg.sync_port)),
    )
    .await
    .map_err(|_| anyhow!("sync dial timed out"))?
    .with_context(|| format!("sync dial to {}:{} failed", cfg.iran_ip, cfg.sync_port))?;
    tune_socket(&stream, &tun);
    info!(server = %cfg.iran_ip, port = cfg.sync_port, "sync channel connected");

    loop {
        let mut ports = enumerate_listen_ports().await;
        ports.retain(|p| *p != cfg.bridge_port && *p != cfg.sync_port);
        ports.sort_unstable();
        ports.truncate(tun.max_sync_ports);
        let frame = build_sync_frame(&ports);
        stream
            .write_all(&frame)
            .await
            .context("sync frame write failed")?;
        stream.flush().await.context("sync frame flush failed")?;
        trace!(count = ports.len(), "sync frame sent");
        tokio::select! {
            _ = sleep(tun.sync_interval) => {}
            _ = wait_stop(&mut stop) => return Ok(()),
        }
    }
}

#[cfg(target_os = "linux")]
async fn enumerate_listen_ports() -> Vec<u16> {
    let mut ports = collect_proc_listeners();
    if ports.is_empty() {
        ports = collect_ss_listeners().await;
    }
    ports.into_iter().collect()
}

#[cfg(not(target_os = "linux"))]
async fn enumerate_listen_ports() -> Vec<u16> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn collect_proc_listeners() -> HashSet<u16> {
    let mut out = HashSet::new();
    for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(body) = std::fs::read_to_string(path) else {
            continue;
        };
        for line in body.lines().skip(1) {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1);
            let state = fields.nth(1);
            let (Some(local), Some(state)) = (local, state) else {
                continue;
            };
            if state != "0A" {
                continue;
            }
            let Some((_, port_hex)) = local.rsplit_once(':') else {
                continue;
            };
            if let Ok(port) = u16::from_str_radix(port_hex, 16) {
                if port != 0 {
                    out.insert(port);
                }
            }
        }
    }
    out
}

#[cfg(target_os = "linux")]
async fn collect_ss_listeners() -> HashSet<u16> {
    let mut out = HashSet::new();
    let Ok(output) = tokio::process::Command::new("ss")
        .args(["-lnt"])
        .output()
        .await
    else {
        return out;
    };
    if !output.status.success() {
        return out;
    }
    for line in String::from_utf8_lossy(&output.stdout).lines().skip(1) {
        let Some(local) = line.split_whitespace().nth(3) else {
            continue;
        };
        let Some((_, port)) = local.rsplit_once(':') else {
            continue;
        };
        if let Ok(port) = port.parse::<u16>() {
            if port != 0 {
                out.insert(port);
            }
        }
    }
    out
}

async fn run_eu_mode(
    cfg: EuConfig,
    tun: Arc<Tunables>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let dial_slots = Arc::new(Semaphore::new(tun.dial_concurrency));
    info!(
        server = %cfg.iran_ip,
        bridge = cfg.bridge_port,
        sync = cfg.sync_port,
        pool = cfg.pool_size,
        auto_sync = cfg.enable_autosync,
        "eu mode ready"
    );

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    for id in 0..cfg.pool_size {
        let cfg2 = cfg.clone();
        let tun2 = tun.clone();
        let slots = dial_slots.clone();
        let stop_outer = stop.clone();
        let stop_inner = stop.clone();
        tasks.push(tokio::spawn(async move {
            // Stagger the first dials so a large pool does not SYN-burst.
            sleep(Duration::from_millis((id % 10) as u64 * 30)).await;
            supervise(
                "dialer",
                stop_outer,
                Duration::from_millis(200),
                move || {
                    dialer_worker(
                        id,
                        cfg2.clone(),
                        tun2.clone(),
                        slots.clone(),
                        stop_inner.clone(),
                    )
                },
            )
            .await;
        }));
    }

    if cfg.enable_autosync {
        let warn_gate: Arc<std::sync::Mutex<Option<Instant>>> =
            Arc::new(std::sync::Mutex::new(None));
        let cfg2 = cfg.clone();
        let tun2 = tun.clone();
        let stop_outer = stop.clone();
        let stop_inner = stop.clone();
        tasks.push(tokio::spawn(supervise(
            "autosync",
            stop_outer,
            Duration::from_millis(500),
            move || {
                let cfg = cfg2.clone();
                let tun = tun2.clone();
                let stop = stop_inner.clone();
                let warn_gate = warn_gate.clone();
                async move {
                    if let Err(err) = autosync_client(cfg, tun, stop).await {
                        let now = Instant::now();
                        let mut last = warn_gate.lock().unwrap_or_else(|e| e.into_inner());
                        let do_warn = last
                            .map_or(true, |at| now.duration_since(at) >= SYNC_WARN_INTERVAL);
                        if do_warn {
                            *last = Some(now);
                        }
                        drop(last);
                        if do_warn {
                            warn!(%err, "sync channel failed; retrying with backoff");
                        } else {
                            debug!(%err, "sync channel failed; retrying with backoff");
                        }
                        return Err(err);
                    }
                    Ok(())
                }
            },
        )));
    }

    if let Some(bind) = tun.health_bind.clone() {
        spawn_health_listener(
            bind,
            Arc::new(HealthState {
                role: "eu",
                started: Instant::now(),
                pool: None,
                controller: None,
            }),
            stop.clone(),
        );
    }

    let mut stop_main = stop.clone();
    wait_stop(&mut stop_main).await;
    info!("shutting down");
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
    info!("shutdown complete");
    Ok(())
}

// ---- health endpoint ----

struct HealthState {
    role: &'static str,
    started: Instant,
    pool: Option<Arc<BridgePool>>,
    controller: Option<Arc<ListenerController>>,
}

fn spawn_health_listener(bind: String, state: Arc<HealthState>, stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let addr: SocketAddr = match bind.parse() {
            Ok(addr) => addr,
            Err(err) => {
                warn!(bind = %bind, %err, "invalid health bind address");
                return;
            }
        };
        let listener = match bind_listener(addr, 16) {
            Ok(listener) => listener,
            Err(err) => {
                warn!(%addr, %err, "failed to bind health listener");
                return;
            }
        };
        info!(%addr, "health endpoint ready");
        let mut stop = stop;
        loop {
            tokio::select! {
                _ = wait_stop(&mut stop) => return,
                accepted = listener.accept() => {
                    let Ok((socket, peer)) = accepted else { continue };
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_health_connection(socket, state).await {
                            debug!(%peer, %err, "health request failed");
                        }
                    });
                }
            }
        }
    });
}

async fn handle_health_connection(mut socket: TcpStream, state: Arc<HealthState>) -> Result<()> {
    let mut buffer = [0u8; 1024];
    let read_len = timeout(Duration::from_secs(3), socket.read(&mut buffer))
        .await
        .context("health request timeout")?
        .context("failed to read health request")?;
    if read_len == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..read_len]);
    let request_line = request.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or("/");

    let pool_depth = match &state.pool {
        Some(pool) => pool.depth().await,
        None => 0,
    };
    let listeners = match &state.controller {
        Some(controller) => controller.active_count().await,
        None => 0,
    };
    let uptime = state.started.elapsed().as_secs();

    let (status, reason, body) = match (method, path) {
        ("GET", "/healthz") | ("GET", "/readyz") => (
            200,
            "OK",
            format!(
                "{{\"status\":\"ok\",\"role\":\"{}\",\"pool\":{},\"listeners\":{},\"uptime_secs\":{}}}",
                state.role, pool_depth, listeners, uptime
            ),
        ),
        ("GET", "/") => (
            200,
            "OK",
            format!(
                "{{\"service\":\"pahlavi\",\"role\":\"{}\",\"health\":\"/healthz\"}}",
                state.role
            ),
        ),
        ("GET", _) => (404, "Not Found", String::from("{\"error\":\"not found\"}")),
        _ => (
            405,
            "Method Not Allowed",
            String::from("{\"error\":\"method not allowed\"}"),
        ),
    };

    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    socket
        .write_all(response.as_bytes())
        .await
        .context("failed to write health response")?;
    socket
        .shutdown()
        .await
        .context("failed to shutdown health response socket")?;
    Ok(())
}

// ---- bootstrap ----

fn prompt_string(prompt: &str, default: Option<&str>) -> io::Result<String> {
    loop {
        match default {
            Some(value) => print!("{prompt} [{value}]: "),
            None => print!("{prompt}: "),
        }
        io::stdout().flush()?;

        let mut input = String::new();
        let read = io::stdin().read_line(&mut input)?;
        let trimmed = input.trim();

        if trimmed.is_empty() {
            if let Some(value) = default {
                return Ok(value.to_string());
            }
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stdin closed during setup",
                ));
            }
            eprintln!("A value is required.");
            continue;
        }

        return Ok(trimmed.to_string());
    }
}

fn prompt_u16(prompt: &str, default: u16) -> io::Result<u16> {
    loop {
        let value = prompt_string(prompt, Some(&default.to_string()))?;
        match value.parse::<u16>() {
            Ok(parsed) if parsed != 0 => return Ok(parsed),
            _ => eprintln!("Please enter a port in range 1-65535."),
        }
    }
}

fn prompt_yes_no(prompt: &str, default: bool) -> io::Result<bool> {
    let hint = if default { "y" } else { "n" };
    loop {
        let value = prompt_string(prompt, Some(hint))?;
        match value.to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => eprintln!("Please answer y or n."),
        }
    }
}

fn parse_manual_ports(raw: &str) -> Vec<u16> {
    raw.split(',')
        .filter_map(|token| {
            let token = token.trim();
            if token.is_empty() {
                return None;
            }
            match token.parse::<u16>() {
                Ok(port) if port != 0 => Some(port),
                _ => {
                    eprintln!("Ignoring invalid port: {token}");
                    None
                }
            }
        })
        .collect()
}

fn bootstrap_from_stdin() -> Result<RoleConfig> {
    println!("pahlavi reverse tunnel");
    println!();
    println!("Select role:");
    println!("1) EU (service side, dials out)");
    println!("2) IR (public side, accepts users)");
    println!();

    let mut choice = String::new();
    let read = io::stdin()
        .read_line(&mut choice)
        .context("failed to read role selection")?;
    let choice = choice.trim();
    if read == 0 || (choice != "1" && choice != "2") {
        eprintln!("Invalid mode selection: {choice}");
        std::process::exit(1);
    }

    if choice == "1" {
        let iran_ip = prompt_string("Iran IP", Some(DEFAULT_IRAN_IP))?;
        let bridge_port = prompt_u16("Bridge port", DEFAULT_BRIDGE_PORT)?;
        let sync_port = prompt_u16("Sync port", DEFAULT_SYNC_PORT)?;
        let enable_autosync = prompt_yes_no("Enable AutoSync (y/n)", true)?;
        Ok(RoleConfig::Eu(EuConfig {
            iran_ip,
            bridge_port,
            sync_port,
            pool_size: 0,
            enable_autosync,
        }))
    } else {
        let bridge_port = prompt_u16("Bridge port", DEFAULT_BRIDGE_PORT)?;
        let sync_port = prompt_u16("Sync port", DEFAULT_SYNC_PORT)?;
        let auto_sync = prompt_yes_no("Enable AutoSync (y/n)", true)?;
        let manual_ports = if auto_sync {
            Vec::new()
        } else {
            let raw = prompt_string("Forwarded ports (comma-separated)", None)?;
            parse_manual_ports(&raw)
        };
        Ok(RoleConfig::Ir(IrConfig {
            bridge_port,
            sync_port,
            pool_size: 0,
            auto_sync,
            manual_ports,
        }))
    }
}

fn init_logging() {
    let directive = std::env::var("PAHLAVI_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let tun = Arc::new(Tunables::from_env());
    let role = bootstrap_from_stdin()?;

    let nofile_soft = raise_nofile_limit(tun.nofile_target);
    debug!(nofile_soft, "file descriptor limit");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });

    match role {
        RoleConfig::Ir(mut cfg) => {
            cfg.pool_size = resolve_pool_size(&tun, IR_FD_SHARE, nofile_soft);
            run_ir_mode(cfg, tun, stop_rx).await
        }
        RoleConfig::Eu(mut cfg) => {
            cfg.pool_size = resolve_pool_size(&tun, EU_FD_SHARE, nofile_soft);
            run_eu_mode(cfg, tun, stop_rx).await
        }
    }
}
