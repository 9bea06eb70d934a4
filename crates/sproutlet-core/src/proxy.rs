//! The proxy core: request demultiplexing onto sproutlets, fork
//! management, response aggregation and CANCEL handling.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use scscf_sip_core::prelude::*;

use crate::aggregate;
use crate::error::TransportError;
use crate::helper::{Action, TimerId, TsxHelper};
use crate::sproutlet::Sproutlet;
use crate::transport::Transport;

/// Proxy-level configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Home domains served by this node; the first is primary.
    pub home_domains: Vec<String>,
    /// Hostnames that mean "this node" (cluster URI host, IP literals).
    pub local_aliases: Vec<String>,
    /// host:port placed in Via headers this node adds.
    pub sent_by: String,
    /// Fork transaction timeout (SIP Timer B); expiry surfaces as a
    /// synthetic 408 on the fork.
    pub timer_b: Duration,
    /// Sustained inbound request rate before 503-ing new work.  `None`
    /// disables admission control.
    pub max_inbound_rate: Option<f64>,
}

impl ProxyConfig {
    pub fn new(home_domain: impl Into<String>, sent_by: impl Into<String>) -> Self {
        ProxyConfig {
            home_domains: vec![home_domain.into()],
            local_aliases: Vec::new(),
            sent_by: sent_by.into(),
            timer_b: Duration::from_secs(32),
            max_inbound_rate: None,
        }
    }
}

/// Events delivered to a transaction task.
#[derive(Debug)]
pub(crate) enum TsxEvent {
    ForkResponse { fork_id: u32, rsp: Response },
    Cancel { req: Option<Request> },
    TimerPop { id: TimerId, context: u64 },
}

/// Where a transaction's responses go.
enum Upstream {
    /// Received off the wire; responses are sent back to the source.
    Wire { src: SocketAddr },
    /// An internal fork of a parent transaction on this node.
    Parent {
        tx: mpsc::Sender<TsxEvent>,
        fork_id: u32,
    },
}

#[derive(Clone)]
struct ForkRef {
    tx: mpsc::Sender<TsxEvent>,
    fork_id: u32,
}

/// The proxy: one per process, shared by reference.
pub struct SproutletProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    config: ProxyConfig,
    sproutlets: Vec<Arc<dyn Sproutlet>>,
    transport: Arc<dyn Transport>,
    /// Inbound server transactions keyed by top-Via branch.
    server_tsxs: DashMap<String, mpsc::Sender<TsxEvent>>,
    /// Outbound client forks keyed by the branch this node minted.
    client_forks: DashMap<String, ForkRef>,
    /// Stateless relays keyed by minted branch; value is the upstream
    /// source to copy responses back to.
    relays: DashMap<String, SocketAddr>,
    load_monitor: Option<crate::load::LoadMonitor>,
    next_trail: AtomicU64,
}

impl SproutletProxy {
    pub fn new(
        config: ProxyConfig,
        transport: Arc<dyn Transport>,
        sproutlets: Vec<Arc<dyn Sproutlet>>,
    ) -> Self {
        let load_monitor = config
            .max_inbound_rate
            .map(|rate| crate::load::LoadMonitor::new(rate, (rate * 2.0).max(1.0)));
        SproutletProxy {
            inner: Arc::new(ProxyInner {
                config,
                sproutlets,
                transport,
                server_tsxs: DashMap::new(),
                client_forks: DashMap::new(),
                relays: DashMap::new(),
                load_monitor,
                next_trail: AtomicU64::new(1),
            }),
        }
    }

    /// Feed one received message into the proxy.
    pub async fn handle_message(&self, msg: SipMessage, src: SocketAddr) {
        match msg {
            SipMessage::Response(rsp) => self.inner.handle_response(rsp).await,
            SipMessage::Request(req) => self.inner.clone().handle_request(req, src).await,
        }
    }

    /// Run a standalone client transaction: send `req`, wait for its final
    /// response.  Used for requests the node originates outside any inbound
    /// transaction (third-party REGISTERs, NOTIFYs).
    pub async fn send_standalone(
        &self,
        req: Request,
        timeout: Duration,
    ) -> std::result::Result<Response, TransportError> {
        self.inner.send_standalone(req, timeout).await
    }

    /// Fire-and-forget variant of [`Self::send_standalone`].
    pub fn send_detached(&self, req: Request) {
        let inner = self.inner.clone();
        let timeout = inner.config.timer_b;
        tokio::spawn(async move {
            if let Err(e) = inner.send_standalone(req, timeout).await {
                debug!(error = %e, "detached request failed");
            }
        });
    }
}

#[async_trait::async_trait]
impl crate::transport::RequestSender for SproutletProxy {
    async fn send_request(
        &self,
        req: Request,
        timeout: Duration,
    ) -> std::result::Result<Response, TransportError> {
        self.send_standalone(req, timeout).await
    }

    fn send_detached(&self, req: Request) {
        SproutletProxy::send_detached(self, req);
    }
}

impl ProxyInner {
    async fn handle_response(self: &Arc<Self>, mut rsp: Response) {
        let branch = match rsp.top_via_branch() {
            Some(b) => b,
            None => {
                debug!("dropping response with no Via branch");
                return;
            }
        };
        if let Some(fork) = self.client_forks.get(&branch).map(|f| f.clone()) {
            if rsp.status.is_final() {
                self.client_forks.remove(&branch);
            }
            rsp.pop_top_via();
            let _ = fork
                .tx
                .send(TsxEvent::ForkResponse {
                    fork_id: fork.fork_id,
                    rsp,
                })
                .await;
            return;
        }
        if let Some(upstream_src) = self.relays.get(&branch).map(|e| *e.value()) {
            let is_final = rsp.status.is_final();
            rsp.pop_top_via();
            let _ = self
                .transport
                .send(SipMessage::Response(rsp), upstream_src)
                .await;
            if is_final {
                self.relays.remove(&branch);
            }
            return;
        }
        debug!(branch, "dropping response matching no transaction");
    }

    async fn handle_request(self: Arc<Self>, req: Request, src: SocketAddr) {
        match req.method {
            Method::Cancel => self.handle_cancel(req, src).await,
            Method::Ack => {
                // ACKs for locally-generated final responses terminate
                // here; anything else is relayed on its route set.
                let branch = req.top_via_branch().unwrap_or_default();
                if !self.server_tsxs.contains_key(&branch) {
                    self.relay_request(req, src).await;
                }
            }
            _ => {
                // Admission control: ACKs always pass, everything else pays
                // a token.
                if let Some(monitor) = &self.load_monitor {
                    if !monitor.admit() {
                        warn!(method = %req.method, "overloaded; rejecting with 503");
                        let rsp = Response::for_request(
                            &req,
                            StatusCode::SERVICE_UNAVAILABLE,
                            None,
                        );
                        let _ = self.transport.send(SipMessage::Response(rsp), src).await;
                        return;
                    }
                }
                self.dispatch_request(req, Upstream::Wire { src }).await;
            }
        }
    }

    async fn handle_cancel(self: &Arc<Self>, req: Request, src: SocketAddr) {
        let branch = req.top_via_branch().unwrap_or_default();
        let target = self.server_tsxs.get(&branch).map(|e| e.value().clone());
        match target {
            Some(tx) => {
                // Answer the CANCEL itself, then deliver it.
                let ok = Response::for_request(&req, StatusCode::OK, None);
                let _ = self.transport.send(SipMessage::Response(ok), src).await;
                let _ = tx.send(TsxEvent::Cancel { req: Some(req) }).await;
            }
            None => {
                let rsp =
                    Response::for_request(&req, StatusCode::CALL_TSX_DOES_NOT_EXIST, None);
                let _ = self.transport.send(SipMessage::Response(rsp), src).await;
            }
        }
    }

    /// Match a hostname of the form `<service>.<home-domain>` or a
    /// sproutlet alias.
    fn match_service_host(&self, host: &str) -> Option<(Arc<dyn Sproutlet>, String)> {
        for sproutlet in &self.sproutlets {
            for domain in &self.config.home_domains {
                let service_host = format!("{}.{}", sproutlet.service_name(), domain);
                if host.eq_ignore_ascii_case(&service_host) {
                    return Some((sproutlet.clone(), service_host));
                }
            }
            for alias in sproutlet.aliases() {
                if host.eq_ignore_ascii_case(&alias) {
                    return Some((sproutlet.clone(), alias));
                }
            }
        }
        None
    }

    fn is_local_host(&self, host: &str) -> bool {
        self.config
            .home_domains
            .iter()
            .chain(self.config.local_aliases.iter())
            .any(|h| host.eq_ignore_ascii_case(h))
            || self
                .config
                .sent_by
                .split(':')
                .next()
                .map(|h| host.eq_ignore_ascii_case(h))
                .unwrap_or(false)
    }

    /// Route a request to a sproutlet, or relay it when no local service is
    /// addressed.  Returns the spawned transaction's event sender, which
    /// internal parents use to cancel the child.
    fn dispatch_request(
        self: Arc<Self>,
        mut req: Request,
        upstream: Upstream,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<mpsc::Sender<TsxEvent>>> + Send>>
    {
        Box::pin(async move {
        let mut dispatched_route: Option<NameAddr> = None;
        let mut dialog_id: Option<String> = None;
        let mut direct: Option<(Arc<dyn Sproutlet>, String)> = None;

        if let Some(top) = req.top_route() {
            if let Some((sproutlet, alias)) = self.match_service_host(&top.uri.host) {
                req.pop_top_route();
                dialog_id = top.uri.param("dlg").and_then(|p| p.value.clone());
                dispatched_route = Some(top);
                direct = Some((sproutlet, alias));
            } else if self.is_local_host(&top.uri.host) {
                // A loose route to the node itself; consume it and select
                // on the Request-URI below.
                req.pop_top_route();
                dispatched_route = Some(top);
            } else {
                self.relay(req, upstream).await;
                return None;
            }
        }

        let selected = match direct {
            Some((sproutlet, alias)) => sproutlet
                .get_tsx(&alias, &req)
                .map(|tsx| (tsx, sproutlet.service_name().to_string())),
            None => {
                let host = req.uri.host.clone();
                if let Some((sproutlet, alias)) = self.match_service_host(&host) {
                    sproutlet
                        .get_tsx(&alias, &req)
                        .map(|tsx| (tsx, sproutlet.service_name().to_string()))
                } else if self.is_local_host(&host) || dispatched_route.is_some() {
                    // Offer the request to each sproutlet in order.
                    self.sproutlets.iter().find_map(|s| {
                        s.get_tsx(&host, &req)
                            .map(|tsx| (tsx, s.service_name().to_string()))
                    })
                } else {
                    None
                }
            }
        };

        let (tsx, service_name) = match selected {
            Some(s) => s,
            None => {
                self.relay(req, upstream).await;
                return None;
            }
        };

        let trail = self.next_trail.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);

        let server_key = match &upstream {
            Upstream::Wire { .. } => {
                let branch = req
                    .top_via_branch()
                    .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                self.server_tsxs.insert(branch.clone(), tx.clone());
                Some(branch)
            }
            Upstream::Parent { .. } => None,
        };

        let is_in_dialog = dialog_id.is_some();
        let helper = TsxHelper::new(
            service_name.clone(),
            self.config
                .home_domains
                .first()
                .cloned()
                .unwrap_or_default(),
            trail,
            req.clone(),
            dispatched_route,
            dialog_id,
        );

        let task = TsxTask {
            inner: self.clone(),
            service_name,
            tsx,
            helper,
            upstream,
            rx,
            self_tx: tx.clone(),
            forks: HashMap::new(),
            my_branches: Vec::new(),
            server_key,
            best: None,
            final_forwarded: false,
            cancelled: false,
            timers: HashMap::new(),
        };
        tokio::spawn(task.run(req, is_in_dialog));
        Some(tx)
        })
    }

    async fn relay(self: &Arc<Self>, req: Request, upstream: Upstream) {
        match upstream {
            Upstream::Wire { src } => self.relay_request(req, src).await,
            Upstream::Parent { tx, fork_id } => {
                // An internal fork that resolved to nothing local: put it
                // on the wire with the parent as its transaction user.
                self.send_fork(req, tx, fork_id).await;
            }
        }
    }

    /// Stateless relay for requests addressed to nothing local.
    async fn relay_request(self: &Arc<Self>, mut req: Request, src: SocketAddr) {
        let next_hop = match req.top_route() {
            Some(r) => r.uri,
            None => req.uri.clone(),
        };
        let dest = match self.resolve(&next_hop).await {
            Some(d) => d,
            None => {
                let rsp = Response::for_request(&req, StatusCode::SERVER_TIMEOUT, None);
                let _ = self.transport.send(SipMessage::Response(rsp), src).await;
                return;
            }
        };
        if !decrement_max_forwards(&mut req) {
            let rsp = Response::for_request(&req, StatusCode(483), Some("Too Many Hops"));
            let _ = self.transport.send(SipMessage::Response(rsp), src).await;
            return;
        }
        let is_ack = req.method == Method::Ack;
        let branch = minted_branch();
        req.push_via_front(&self.config.sent_by, &branch);
        if !is_ack {
            self.relays.insert(branch, src);
        }
        let _ = self.transport.send(SipMessage::Request(req), dest).await;
    }

    /// Send a request on the wire as a fork reporting to `tx`.
    async fn send_fork(self: &Arc<Self>, mut req: Request, tx: mpsc::Sender<TsxEvent>, fork_id: u32) {
        let next_hop = match req.top_route() {
            Some(r) => r.uri,
            None => req.uri.clone(),
        };
        let dest = match self.resolve(&next_hop).await {
            Some(d) => d,
            None => {
                let rsp =
                    Response::for_request(&req, StatusCode::SERVER_TIMEOUT, Some("Unresolvable"));
                let _ = tx.send(TsxEvent::ForkResponse { fork_id, rsp }).await;
                return;
            }
        };
        if !decrement_max_forwards(&mut req) {
            let rsp = Response::for_request(&req, StatusCode(483), Some("Too Many Hops"));
            let _ = tx.send(TsxEvent::ForkResponse { fork_id, rsp }).await;
            return;
        }
        let branch = minted_branch();
        req.push_via_front(&self.config.sent_by, &branch);
        self.client_forks.insert(
            branch.clone(),
            ForkRef {
                tx: tx.clone(),
                fork_id,
            },
        );
        if let Err(e) = self
            .transport
            .send(SipMessage::Request(req.clone()), dest)
            .await
        {
            warn!(error = %e, fork_id, "fork transport send failed");
            self.client_forks.remove(&branch);
            let mut rsp = Response::for_request(&req, StatusCode::SERVICE_UNAVAILABLE, None);
            rsp.pop_top_via();
            let _ = tx.send(TsxEvent::ForkResponse { fork_id, rsp }).await;
            return;
        }
        // Timer B: a fork that never answers finally becomes a 408.
        let timer_b = self.config.timer_b;
        let mut timeout_rsp = Response::for_request(&req, StatusCode::REQUEST_TIMEOUT, None);
        timeout_rsp.pop_top_via();
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timer_b).await;
            if inner.client_forks.remove(&branch).is_some() {
                let _ = tx
                    .send(TsxEvent::ForkResponse {
                        fork_id,
                        rsp: timeout_rsp,
                    })
                    .await;
            }
        });
    }

    async fn send_standalone(
        self: &Arc<Self>,
        mut req: Request,
        timeout: Duration,
    ) -> std::result::Result<Response, TransportError> {
        let next_hop = match req.top_route() {
            Some(r) => r.uri,
            None => req.uri.clone(),
        };
        let dest = self
            .resolve(&next_hop)
            .await
            .ok_or_else(|| TransportError::Resolution(next_hop.to_string()))?;
        decrement_max_forwards(&mut req);
        let branch = minted_branch();
        req.push_via_front(&self.config.sent_by, &branch);

        let (tx, mut rx) = mpsc::channel(8);
        self.client_forks
            .insert(branch.clone(), ForkRef { tx, fork_id: 0 });

        let result = async {
            self.transport
                .send(SipMessage::Request(req.clone()), dest)
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let event = tokio::time::timeout_at(deadline, rx.recv())
                    .await
                    .map_err(|_| TransportError::Timeout)?;
                match event {
                    Some(TsxEvent::ForkResponse { rsp, .. }) if rsp.status.is_final() => {
                        return Ok(rsp);
                    }
                    Some(_) => continue,
                    None => return Err(TransportError::Timeout),
                }
            }
        }
        .await;

        self.client_forks.remove(&branch);
        result
    }

    /// Resolve a URI to a socket address.  IP literals short-circuit; names
    /// go through the resolver.
    async fn resolve(&self, uri: &Uri) -> Option<SocketAddr> {
        if !uri.is_sip() {
            return None;
        }
        let port = uri.port.unwrap_or(5060);
        let host = uri.host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, port));
        }
        match tokio::net::lookup_host((host, port)).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                debug!(host, error = %e, "destination resolution failed");
                None
            }
        }
    }
}

fn minted_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

/// Decrement Max-Forwards; false when the request has run out of hops.
fn decrement_max_forwards(req: &mut Request) -> bool {
    let current: u32 = req
        .headers
        .first(&HeaderName::MaxForwards)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(70);
    if current == 0 {
        return false;
    }
    req.headers
        .set(HeaderName::MaxForwards, (current - 1).to_string());
    true
}

// ---------------------------------------------------------------------------
// Per-transaction task
// ---------------------------------------------------------------------------

struct ForkState {
    terminated: bool,
    cancel_sent: bool,
    kind: ForkKind,
}

enum ForkKind {
    Wire {
        branch: String,
        dest: SocketAddr,
        sent_req: Request,
    },
    /// An in-process child transaction; `None` when the child degenerated
    /// to a wire relay and cannot be cancelled directly.
    Child {
        tx: Option<mpsc::Sender<TsxEvent>>,
    },
}

struct TsxTask {
    inner: Arc<ProxyInner>,
    service_name: String,
    tsx: Box<dyn crate::sproutlet::SproutletTsx>,
    helper: TsxHelper,
    upstream: Upstream,
    rx: mpsc::Receiver<TsxEvent>,
    self_tx: mpsc::Sender<TsxEvent>,
    forks: HashMap<u32, ForkState>,
    my_branches: Vec<String>,
    server_key: Option<String>,
    best: Option<Response>,
    final_forwarded: bool,
    cancelled: bool,
    timers: HashMap<u64, tokio::task::JoinHandle<()>>,
}

impl TsxTask {
    async fn run(mut self, req: Request, is_in_dialog: bool) {
        debug!(
            service = %self.service_name,
            trail = self.helper.trail(),
            method = %req.method,
            in_dialog = is_in_dialog,
            "dispatching request to sproutlet"
        );

        if is_in_dialog {
            self.tsx
                .on_rx_in_dialog_request(&mut self.helper, req.clone())
                .await;
        } else {
            self.tsx
                .on_rx_initial_request(&mut self.helper, req.clone())
                .await;
        }
        self.apply_actions().await;

        if self.forks.is_empty() && !self.final_forwarded {
            warn!(
                service = %self.service_name,
                "sproutlet neither forwarded nor responded; synthesizing 503"
            );
            self.forward_upstream(Response::for_request(
                self.helper.original_request(),
                StatusCode::SERVICE_UNAVAILABLE,
                None,
            ))
            .await;
        }

        while !self.complete() {
            let event = match self.rx.recv().await {
                Some(e) => e,
                None => break,
            };
            match event {
                TsxEvent::ForkResponse { fork_id, rsp } => {
                    self.on_fork_response(fork_id, rsp).await;
                }
                TsxEvent::Cancel { req } => {
                    self.on_cancel(req).await;
                }
                TsxEvent::TimerPop { id, context } => {
                    self.timers.remove(&id.0);
                    if !self.cancelled && !self.final_forwarded {
                        self.tsx.on_timer_expiry(&mut self.helper, context).await;
                        self.apply_actions().await;
                        self.check_aggregation_complete().await;
                    }
                }
            }
        }

        self.cleanup();
    }

    fn complete(&self) -> bool {
        self.final_forwarded && self.forks.values().all(|f| f.terminated)
    }

    async fn on_fork_response(&mut self, fork_id: u32, rsp: Response) {
        let already_final = match self.forks.get(&fork_id) {
            Some(f) => f.terminated,
            None => {
                debug!(fork_id, "response for unknown fork");
                return;
            }
        };
        if already_final {
            if rsp.status.is_final() {
                // Retransmission or a late answer after Timer B; drop.
                return;
            }
            // Provisional after final makes no sense either.
            return;
        }
        let was_final = rsp.status.is_final();
        if was_final {
            if let Some(f) = self.forks.get_mut(&fork_id) {
                f.terminated = true;
            }
        }

        if self.cancelled || self.final_forwarded {
            // Callbacks are suppressed; aggregate internally so the
            // transaction can wind down.
            if was_final {
                self.fold_best(rsp);
                self.check_aggregation_complete().await;
            }
            return;
        }

        self.tsx
            .on_rx_response(&mut self.helper, rsp, fork_id)
            .await;
        self.apply_actions().await;

        if was_final {
            self.check_aggregation_complete().await;
        }
    }

    async fn on_cancel(&mut self, req: Option<Request>) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if !self.final_forwarded {
            self.tsx
                .on_rx_cancel(&mut self.helper, StatusCode::REQUEST_TERMINATED, req)
                .await;
            self.apply_actions().await;
        }

        let fork_ids: Vec<u32> = self.forks.keys().copied().collect();
        for fork_id in fork_ids {
            self.do_cancel_fork(fork_id).await;
        }

        if self.forks.is_empty() && !self.final_forwarded {
            self.forward_upstream(Response::for_request(
                self.helper.original_request(),
                StatusCode::REQUEST_TERMINATED,
                None,
            ))
            .await;
        }
    }

    /// Apply the actions a callback queued.
    async fn apply_actions(&mut self) {
        let actions = self.helper.take_actions();

        let has_final_rsp = actions
            .iter()
            .any(|a| matches!(a, Action::SendResponse { rsp } if rsp.status.is_final()));
        let has_request = actions
            .iter()
            .any(|a| matches!(a, Action::SendRequest { .. }));
        if has_final_rsp && has_request {
            warn!(
                service = %self.service_name,
                "sproutlet mixed a final response with an outgoing request; rejecting with 503"
            );
            self.forward_upstream(Response::for_request(
                self.helper.original_request(),
                StatusCode::SERVICE_UNAVAILABLE,
                None,
            ))
            .await;
            return;
        }

        for action in actions {
            match action {
                Action::SendRequest { fork_id, req } => {
                    self.start_fork(fork_id, req).await;
                }
                Action::SendResponse { rsp } => {
                    self.route_response(rsp).await;
                }
                Action::CancelFork { fork_id } => {
                    self.do_cancel_fork(fork_id).await;
                }
                Action::StartTimer { id, delay, context } => {
                    let tx = self.self_tx.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(TsxEvent::TimerPop { id, context }).await;
                    });
                    self.timers.insert(id.0, handle);
                }
                Action::CancelTimer { id } => {
                    if let Some(handle) = self.timers.remove(&id.0) {
                        handle.abort();
                    }
                }
            }
        }
    }

    async fn start_fork(&mut self, fork_id: u32, mut req: Request) {
        // Record-Route insertion happens on the way out, once requested.
        if self.helper.record_route_requested() && req.method.is_dialog_initiating() {
            let entry = self.helper.record_route_entry();
            let already = req
                .record_routes()
                .ok()
                .map(|rrs| rrs.iter().any(|rr| rr.uri.host == entry.uri.host))
                .unwrap_or(false);
            if !already {
                req.push_record_route_front(entry);
            }
        }

        // Internal chaining: a fork addressed to another local service is
        // dispatched in-process rather than via the wire.
        let next_hop_host = match req.top_route() {
            Some(r) => r.uri.host.clone(),
            None => req.uri.host.clone(),
        };
        if self.inner.match_service_host(&next_hop_host).is_some() {
            let upstream = Upstream::Parent {
                tx: self.self_tx.clone(),
                fork_id,
            };
            let child_tx = self.inner.clone().dispatch_request(req, upstream).await;
            self.forks.insert(
                fork_id,
                ForkState {
                    terminated: false,
                    cancel_sent: false,
                    kind: ForkKind::Child { tx: child_tx },
                },
            );
            return;
        }

        // Wire fork.
        let next_hop = match req.top_route() {
            Some(r) => r.uri,
            None => req.uri.clone(),
        };
        let dest = match self.inner.resolve(&next_hop).await {
            Some(d) => d,
            None => {
                self.insert_synthetic_fork(fork_id);
                let rsp =
                    Response::for_request(&req, StatusCode::SERVER_TIMEOUT, Some("Unresolvable"));
                let _ = self
                    .self_tx
                    .send(TsxEvent::ForkResponse { fork_id, rsp })
                    .await;
                return;
            }
        };

        if !decrement_max_forwards(&mut req) {
            self.insert_synthetic_fork(fork_id);
            let rsp = Response::for_request(&req, StatusCode(483), Some("Too Many Hops"));
            let _ = self
                .self_tx
                .send(TsxEvent::ForkResponse { fork_id, rsp })
                .await;
            return;
        }

        let branch = minted_branch();
        req.push_via_front(&self.inner.config.sent_by, &branch);
        self.inner.client_forks.insert(
            branch.clone(),
            ForkRef {
                tx: self.self_tx.clone(),
                fork_id,
            },
        );
        self.my_branches.push(branch.clone());
        self.forks.insert(
            fork_id,
            ForkState {
                terminated: false,
                cancel_sent: false,
                kind: ForkKind::Wire {
                    branch: branch.clone(),
                    dest,
                    sent_req: req.clone(),
                },
            },
        );

        if let Err(e) = self
            .inner
            .transport
            .send(SipMessage::Request(req.clone()), dest)
            .await
        {
            warn!(error = %e, fork_id, "fork send failed");
            self.inner.client_forks.remove(&branch);
            let mut rsp = Response::for_request(&req, StatusCode::SERVICE_UNAVAILABLE, None);
            rsp.pop_top_via();
            let _ = self
                .self_tx
                .send(TsxEvent::ForkResponse { fork_id, rsp })
                .await;
            return;
        }

        // Timer B.
        let tx = self.self_tx.clone();
        let timer_b = self.inner.config.timer_b;
        let mut timeout_rsp = Response::for_request(&req, StatusCode::REQUEST_TIMEOUT, None);
        timeout_rsp.pop_top_via();
        tokio::spawn(async move {
            tokio::time::sleep(timer_b).await;
            let _ = tx
                .send(TsxEvent::ForkResponse {
                    fork_id,
                    rsp: timeout_rsp,
                })
                .await;
        });
    }

    /// Fork slot for failures synthesized before anything was sent.
    fn insert_synthetic_fork(&mut self, fork_id: u32) {
        self.forks.insert(
            fork_id,
            ForkState {
                terminated: false,
                cancel_sent: true,
                kind: ForkKind::Child { tx: None },
            },
        );
    }

    fn fold_best(&mut self, rsp: Response) {
        let candidate_better = self
            .best
            .as_ref()
            .map(|b| aggregate::better_response(rsp.status, b.status))
            .unwrap_or(true);
        if candidate_better {
            self.best = Some(rsp);
        }
    }

    async fn route_response(&mut self, rsp: Response) {
        if rsp.status == StatusCode::TRYING {
            // 100 is hop-by-hop.
            return;
        }
        if rsp.status.is_provisional() {
            self.forward_upstream(rsp).await;
            return;
        }
        if self.final_forwarded {
            return;
        }

        let outstanding = self.forks.values().filter(|f| !f.terminated).count();

        if outstanding == 0 {
            // Nothing else can answer; this response (folded against any
            // stored best) goes upstream now.
            self.fold_best(rsp);
            if let Some(best) = self.best.take() {
                self.forward_upstream(best).await;
            }
            return;
        }

        if rsp.status.is_success() {
            // 2xx is forwarded immediately; remaining forks are cancelled.
            self.forward_upstream(rsp).await;
            let fork_ids: Vec<u32> = self.forks.keys().copied().collect();
            for fork_id in fork_ids {
                self.do_cancel_fork(fork_id).await;
            }
            return;
        }

        if rsp.status.class() == 6 {
            // 6xx: cancel the rest, hold as best until they answer.
            let fork_ids: Vec<u32> = self.forks.keys().copied().collect();
            for fork_id in fork_ids {
                self.do_cancel_fork(fork_id).await;
            }
        }

        self.fold_best(rsp);
    }

    /// When every fork has answered finally and nothing has gone upstream,
    /// the aggregated best does.
    async fn check_aggregation_complete(&mut self) {
        if self.final_forwarded || self.forks.is_empty() {
            return;
        }
        if self.forks.values().all(|f| f.terminated) {
            match self.best.take() {
                Some(best) => self.forward_upstream(best).await,
                None => {
                    let status = if self.cancelled {
                        StatusCode::REQUEST_TERMINATED
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    let rsp =
                        Response::for_request(self.helper.original_request(), status, None);
                    self.forward_upstream(rsp).await;
                }
            }
        }
    }

    async fn forward_upstream(&mut self, rsp: Response) {
        if rsp.status.is_final() {
            if self.final_forwarded {
                return;
            }
            self.final_forwarded = true;
        }
        match &self.upstream {
            Upstream::Wire { src } => {
                let _ = self
                    .inner
                    .transport
                    .send(SipMessage::Response(rsp), *src)
                    .await;
            }
            Upstream::Parent { tx, fork_id } => {
                let _ = tx
                    .send(TsxEvent::ForkResponse {
                        fork_id: *fork_id,
                        rsp,
                    })
                    .await;
            }
        }
    }

    async fn do_cancel_fork(&mut self, fork_id: u32) {
        let fork = match self.forks.get_mut(&fork_id) {
            Some(f) => f,
            None => return,
        };
        if fork.terminated || fork.cancel_sent {
            return;
        }
        fork.cancel_sent = true;
        match &fork.kind {
            ForkKind::Wire { dest, sent_req, .. } => {
                let cancel = build_cancel(sent_req);
                let _ = self
                    .inner
                    .transport
                    .send(SipMessage::Request(cancel), *dest)
                    .await;
            }
            ForkKind::Child { tx: Some(tx) } => {
                let _ = tx.send(TsxEvent::Cancel { req: None }).await;
            }
            ForkKind::Child { tx: None } => {}
        }
    }

    fn cleanup(&mut self) {
        if let Some(key) = &self.server_key {
            self.inner.server_tsxs.remove(key);
        }
        for branch in &self.my_branches {
            self.inner.client_forks.remove(branch);
        }
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

/// CANCEL for a previously sent request: same transaction identifiers, its
/// own method line.
fn build_cancel(sent_req: &Request) -> Request {
    let mut cancel = Request::new(Method::Cancel, sent_req.uri.clone());
    for name in [
        HeaderName::Via,
        HeaderName::From,
        HeaderName::To,
        HeaderName::CallId,
        HeaderName::Route,
    ] {
        if let Some(value) = sent_req.headers.first(&name) {
            cancel.headers.push(name, value.to_string());
        }
    }
    if let Some(cseq) = sent_req.cseq() {
        cancel.headers.push(
            HeaderName::CSeq,
            CSeq::new(cseq.seq, Method::Cancel).to_string(),
        );
    }
    cancel.headers.push(HeaderName::MaxForwards, "70");
    cancel
}

#[cfg(test)]
mod tests;
