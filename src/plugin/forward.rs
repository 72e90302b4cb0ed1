use crate::message::{Request, Response};
use crate::plugin::prometheus::{
    FORWARD_MAX_CONCURRENT_REJECTS, PROXY_CONN_CACHE_HITS, PROXY_CONN_CACHE_MISSES, PROXY_REQUEST_DURATION,
};
use crate::plugin::{Handler, Next};
use crate::types::{rcode_to_str, Message, Question, Rcode, RecordType};
use crate::wire;
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_rustls::{client::TlsStream, rustls::{ClientConfig, RootCertStore, ServerName}, TlsConnector};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Policy { Sequential, #[default] Random, RoundRobin }

impl std::str::FromStr for Policy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "random" => Ok(Self::Random),
            "round_robin" => Ok(Self::RoundRobin),
            other => anyhow::bail!("unknown forward policy '{}'", other),
        }
    }
}

/// Tunables for a [`Forwarder`].
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub policy: Policy,
    pub timeout: Duration,
    pub failover_rcodes: Vec<u16>,
    pub tls_servername: Option<String>,
    pub max_concurrent: Option<usize>,
    pub max_fails: usize,
    /// Probe interval for upstream health checks. `None` disables probing.
    pub health_check: Option<Duration>,
    pub max_idle_conns: usize,
    pub expire: Duration,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            timeout: Duration::from_secs(2),
            failover_rcodes: Vec::new(),
            tls_servername: None,
            max_concurrent: None,
            max_fails: 2,
            health_check: None,
            max_idle_conns: 16,
            expire: Duration::from_secs(10),
        }
    }
}

struct IdleConnection {
    stream: TlsStream<TcpStream>,
    expires_at: Instant,
}

pub struct Upstream {
    addr: SocketAddr,
    is_tls: bool,
    is_healthy: AtomicBool,
    fails: AtomicUsize,
    idle_tls_conns: AsyncMutex<Vec<IdleConnection>>,
}

impl Upstream {
    /// Accepts `1.2.3.4`, `1.2.3.4:5353`, `[::1]:53` and the same with a `tls://` prefix.
    pub fn parse(addr: &str) -> Result<Self> {
        let (is_tls, rest) = match addr.strip_prefix("tls://") {
            Some(rest) => (true, rest),
            None => (false, addr.strip_prefix("dns://").unwrap_or(addr)),
        };
        let default_port = if is_tls { 853 } else { 53 };
        let addr = match rest.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                let ip: IpAddr = rest.trim_matches(|c| c == '[' || c == ']').parse()
                    .with_context(|| format!("invalid upstream address '{}'", addr))?;
                SocketAddr::new(ip, default_port)
            }
        };
        Ok(Self {
            addr,
            is_tls,
            is_healthy: AtomicBool::new(true),
            fails: AtomicUsize::new(0),
            idle_tls_conns: AsyncMutex::new(Vec::new()),
        })
    }

    pub fn addr(&self) -> SocketAddr { self.addr }

    pub fn is_tls(&self) -> bool { self.is_tls }

    pub fn is_healthy(&self) -> bool { self.is_healthy.load(Ordering::Relaxed) }

    fn proto(&self) -> &'static str { if self.is_tls { "tcp-tls" } else { "udp" } }
}

/// Hands queries nobody answered yet to upstream resolvers.
pub struct Forwarder {
    upstreams: Vec<Arc<Upstream>>,
    options: ForwardOptions,
    max_concurrent: Option<Semaphore>,
    rr_counter: AtomicUsize,
    tls_connector: TlsConnector,
    health_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Forwarder {
    /// Health probes, when enabled, are spawned on the current tokio runtime.
    pub fn new<S: AsRef<str>>(upstreams: &[S], options: ForwardOptions) -> Result<Self> {
        let upstreams = upstreams.iter()
            .map(|s| Upstream::parse(s.as_ref()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        if upstreams.is_empty() {
            anyhow::bail!("forward needs at least one upstream");
        }

        let mut root_store = RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            tokio_rustls::rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
        }));
        let client_config = ClientConfig::builder().with_safe_defaults().with_root_certificates(root_store).with_no_client_auth();
        let tls_connector = TlsConnector::from(Arc::new(client_config));

        let mut health_tasks = Vec::new();
        if let (Some(interval), true) = (options.health_check, options.max_fails > 0) {
            for upstream in &upstreams {
                health_tasks.push(tokio::spawn(health_check_loop(
                    upstream.clone(),
                    interval,
                    options.max_fails,
                    tls_connector.clone(),
                    options.tls_servername.clone(),
                )));
            }
        }

        tracing::info!("[forward] {} upstream(s), policy {:?}, timeout {:?}", upstreams.len(), options.policy, options.timeout);
        Ok(Self {
            upstreams,
            max_concurrent: options.max_concurrent.map(Semaphore::new),
            options,
            rr_counter: AtomicUsize::new(0),
            tls_connector,
            health_tasks,
        })
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] { &self.upstreams }

    /// Upstream indices in the order this query should try them.
    fn attempt_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.upstreams.len()).filter(|&i| self.upstreams[i].is_healthy()).collect();
        if order.is_empty() {
            // Everyone looks down; probing may be stale, so try them all anyway.
            order = (0..self.upstreams.len()).collect();
        }
        match self.options.policy {
            Policy::Sequential => {}
            Policy::Random => order.shuffle(&mut rand::thread_rng()),
            Policy::RoundRobin => {
                let start = self.rr_counter.fetch_add(1, Ordering::Relaxed) % order.len();
                order.rotate_left(start);
            }
        }
        order
    }

    /// Sends `query` upstream and returns the first acceptable reply.
    pub async fn exchange(&self, query: &Message) -> Result<Option<Message>> {
        let packet = wire::encode(query)?;
        let qname = query.questions.first().map(|q| q.name.as_str()).unwrap_or(".");

        for idx in self.attempt_order() {
            let upstream = &self.upstreams[idx];
            let to = upstream.addr.to_string();
            tracing::debug!("TxID: {:#06x} -> Trying {}://{} for '{}' (Policy: {:?})", query.id, if upstream.is_tls { "tls" } else { "udp" }, to, qname, self.options.policy);

            let started = Instant::now();
            let result = if upstream.is_tls {
                self.send_tls_with_pool(upstream, &packet).await
            } else {
                PROXY_CONN_CACHE_MISSES.with_label_values(&["udp", "forward", &to]).inc();
                self.send_udp(upstream, &packet).await
            };
            let elapsed = started.elapsed().as_secs_f64();

            let reply = match result.and_then(|bytes| wire::decode(&bytes).map_err(Into::into)) {
                Ok(reply) if reply.id == query.id => reply,
                Ok(reply) => {
                    tracing::debug!("Upstream {} answered with TxID {:#06x}, expected {:#06x}", to, reply.id, query.id);
                    continue;
                }
                Err(e) => {
                    PROXY_REQUEST_DURATION.with_label_values(&["forward", "SERVFAIL", &to]).observe(elapsed);
                    tracing::debug!("Upstream {} timeout or failed for '{}' in {:.4}s, trying next: {:#}", to, qname, elapsed, e);
                    continue;
                }
            };

            let rcode = reply.rcode();
            PROXY_REQUEST_DURATION.with_label_values(&["forward", rcode_to_str(rcode), &to]).observe(elapsed);
            if self.options.failover_rcodes.contains(&rcode) {
                tracing::warn!("Upstream {} returned failover RCODE {} for '{}' in {:.4}s, triggering retry...", to, rcode_to_str(rcode), qname, elapsed);
                continue;
            }
            tracing::info!("Success resolution for '{}' from {} in {:.4}s, RCODE: {}", qname, to, elapsed, rcode_to_str(rcode));
            return Ok(Some(reply));
        }
        Ok(None)
    }

    async fn send_udp(&self, up: &Upstream, query: &[u8]) -> Result<Vec<u8>> {
        let bind: SocketAddr = if up.addr.is_ipv4() { ([0, 0, 0, 0], 0).into() } else { (std::net::Ipv6Addr::UNSPECIFIED, 0).into() };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(up.addr).await?;
        socket.send(query).await?;
        let mut buf = vec![0u8; 4096];
        let len = timeout(self.options.timeout, socket.recv(&mut buf)).await??;
        buf.truncate(len);
        Ok(buf)
    }

    async fn send_tls_with_pool(&self, up: &Upstream, query: &[u8]) -> Result<Vec<u8>> {
        let to = up.addr.to_string();
        let pooled = {
            let now = Instant::now();
            let mut pool = up.idle_tls_conns.lock().await;
            pool.retain(|idle| idle.expires_at > now);
            pool.pop().map(|idle| idle.stream)
        };

        let mut tls_stream = match pooled {
            Some(stream) => {
                tracing::debug!("Reusing cached TLS connection for {}", to);
                PROXY_CONN_CACHE_HITS.with_label_values(&["tcp-tls", "forward", &to]).inc();
                stream
            }
            None => {
                tracing::debug!("Establishing new TLS connection to {}", to);
                PROXY_CONN_CACHE_MISSES.with_label_values(&[up.proto(), "forward", &to]).inc();
                connect_tls(up, &self.tls_connector, self.options.tls_servername.as_deref(), self.options.timeout).await?
            }
        };

        let resp = timeout(self.options.timeout, exchange_framed(&mut tls_stream, query)).await??;

        let mut pool = up.idle_tls_conns.lock().await;
        if pool.len() < self.options.max_idle_conns {
            pool.push(IdleConnection { stream: tls_stream, expires_at: Instant::now() + self.options.expire });
        }
        Ok(resp)
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        for task in &self.health_tasks { task.abort(); }
    }
}

#[async_trait::async_trait]
impl Handler for Forwarder {
    fn name(&self) -> &str { "forward" }

    async fn handle(&self, req: &Request, res: &mut Response, next: Next<'_>) -> Result<()> {
        if res.is_finished() || req.question().is_none() {
            return next.run(req, res).await;
        }

        let _permit = match &self.max_concurrent {
            Some(sema) => match sema.try_acquire() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let qname = req.question().map(|q| q.name.as_str()).unwrap_or(".");
                    tracing::warn!("Max concurrent queries reached! Rejecting '{}' with REFUSED.", qname);
                    FORWARD_MAX_CONCURRENT_REJECTS.inc();
                    res.errors().refused()?;
                    return Ok(());
                }
            },
            None => None,
        };

        match self.exchange(req.message()).await? {
            Some(reply) => {
                res.set_flags(reply.flags)?;
                res.set_authorities(reply.authorities)?;
                res.set_additionals(reply.additionals)?;
                res.answer(reply.answers)?;
            }
            None => {
                tracing::warn!("[forward] no upstream answered TxID {:#06x}, replying SERVFAIL", req.id());
                res.errors().server_failure()?;
            }
        }
        next.run(req, res).await
    }
}

async fn connect_tls(up: &Upstream, connector: &TlsConnector, sni: Option<&str>, limit: Duration) -> Result<TlsStream<TcpStream>> {
    let host = sni.map(str::to_string).unwrap_or_else(|| up.addr.ip().to_string());
    let domain = ServerName::try_from(host.as_str()).map_err(|_| anyhow::anyhow!("Invalid SNI '{}'", host))?;
    let stream = timeout(limit, TcpStream::connect(up.addr)).await??;
    Ok(timeout(limit, connector.connect(domain, stream)).await??)
}

async fn exchange_framed(stream: &mut TlsStream<TcpStream>, query: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(query.len()).context("query too large for a stream frame")?;
    let mut req = Vec::with_capacity(query.len() + 2);
    req.extend_from_slice(&len.to_be_bytes());
    req.extend_from_slice(query);
    stream.write_all(&req).await.context("Broken TLS connection pipe")?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut resp = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut resp).await?;
    Ok(resp)
}

async fn health_check_loop(up: Arc<Upstream>, interval: Duration, max_fails: usize, connector: TlsConnector, sni: Option<String>) {
    let probe = match wire::encode(&Message::query(0x1234, Question::new(".", RecordType::NS))) {
        Ok(probe) => probe,
        Err(e) => {
            tracing::error!("[forward] cannot build health probe: {}", e);
            return;
        }
    };
    let probe_timeout = interval.min(Duration::from_millis(1500));
    loop {
        sleep(interval).await;
        let ok = if up.is_tls {
            match connect_tls(&up, &connector, sni.as_deref(), probe_timeout).await {
                Ok(mut stream) => timeout(probe_timeout, exchange_framed(&mut stream, &probe)).await.map_or(false, |r| r.is_ok()),
                Err(_) => false,
            }
        } else {
            ping_udp(up.addr, &probe, probe_timeout).await.is_ok()
        };

        if ok {
            up.fails.store(0, Ordering::Relaxed);
            if !up.is_healthy.swap(true, Ordering::Relaxed) {
                tracing::info!("Upstream {} is healthy again", up.addr);
            }
        } else {
            let fails = up.fails.fetch_add(1, Ordering::Relaxed) + 1;
            if fails >= max_fails && up.is_healthy.swap(false, Ordering::Relaxed) {
                tracing::warn!("Upstream {} marked as UNHEALTHY (Failed {} times)", up.addr, fails);
            }
        }
    }
}

async fn ping_udp(addr: SocketAddr, probe: &[u8], limit: Duration) -> Result<()> {
    let bind: SocketAddr = if addr.is_ipv4() { ([0, 0, 0, 0], 0).into() } else { (std::net::Ipv6Addr::UNSPECIFIED, 0).into() };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    socket.send(probe).await?;
    let mut buf = vec![0u8; 512];
    timeout(limit, socket.recv(&mut buf)).await??;
    Ok(())
}

/// `NOERROR`, `SERVFAIL`, ... or a numeric rcode.
pub fn parse_rcode(s: &str) -> Result<u16> {
    if let Some(rcode) = Rcode::parse(s) {
        return Ok(rcode as u16);
    }
    s.parse::<u16>().ok().filter(|v| *v <= 0x0F).with_context(|| format!("unknown rcode '{}'", s))
}
