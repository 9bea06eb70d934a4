use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use scscf_sip_core::prelude::*;

use crate::helper::TsxHelper;
use crate::proxy::{ProxyConfig, SproutletProxy};
use crate::sproutlet::{Sproutlet, SproutletTsx};
use crate::transport::TestTransport;

const UPSTREAM: &str = "10.0.0.1:5060";

fn upstream_addr() -> SocketAddr {
    UPSTREAM.parse().unwrap()
}

fn config() -> ProxyConfig {
    let mut config = ProxyConfig::new("example.com", "127.0.0.1:5054");
    config.timer_b = Duration::from_secs(5);
    config
}

fn invite(route_host: Option<&str>, branch: &str) -> Request {
    let mut req = Request::new(
        Method::Invite,
        "sip:bob@192.0.2.50:5062".parse().unwrap(),
    );
    req.headers.push(
        HeaderName::Via,
        format!("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK{}", branch),
    );
    req.headers.push(HeaderName::MaxForwards, "70");
    req.headers.push(HeaderName::To, "<sip:bob@example.com>");
    req.headers
        .push(HeaderName::From, "<sip:alice@example.com>;tag=1");
    req.headers.push(HeaderName::CallId, format!("cid-{}", branch));
    req.headers.push(HeaderName::CSeq, "1 INVITE");
    if let Some(host) = route_host {
        req.headers
            .push(HeaderName::Route, format!("<sip:{};lr>", host));
    }
    req
}

async fn next_request(transport: &TestTransport) -> (Request, SocketAddr) {
    loop {
        let (msg, dest) = transport
            .next_sent_timeout(Duration::from_secs(2))
            .await
            .expect("expected a sent message");
        if let SipMessage::Request(req) = msg {
            return (req, dest);
        }
    }
}

async fn next_response(transport: &TestTransport) -> (Response, SocketAddr) {
    loop {
        let (msg, dest) = transport
            .next_sent_timeout(Duration::from_secs(2))
            .await
            .expect("expected a sent message");
        if let SipMessage::Response(rsp) = msg {
            return (rsp, dest);
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted sproutlets
// ---------------------------------------------------------------------------

struct ForwardSproutlet {
    name: String,
}

struct ForwardTsx;

impl Sproutlet for ForwardSproutlet {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn get_tsx(&self, _alias: &str, _req: &Request) -> Option<Box<dyn SproutletTsx>> {
        Some(Box::new(ForwardTsx))
    }
}

#[async_trait]
impl SproutletTsx for ForwardTsx {}

struct RejectSproutlet {
    name: String,
    status: StatusCode,
}

struct RejectTsx {
    status: StatusCode,
}

impl Sproutlet for RejectSproutlet {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn get_tsx(&self, _alias: &str, _req: &Request) -> Option<Box<dyn SproutletTsx>> {
        Some(Box::new(RejectTsx {
            status: self.status,
        }))
    }
}

#[async_trait]
impl SproutletTsx for RejectTsx {
    async fn on_rx_initial_request(&mut self, helper: &mut TsxHelper, _req: Request) {
        helper.reject(self.status, None);
    }
}

struct NoopSproutlet;

struct NoopTsx;

impl Sproutlet for NoopSproutlet {
    fn service_name(&self) -> &str {
        "noop"
    }

    fn get_tsx(&self, _alias: &str, _req: &Request) -> Option<Box<dyn SproutletTsx>> {
        Some(Box::new(NoopTsx))
    }
}

#[async_trait]
impl SproutletTsx for NoopTsx {
    async fn on_rx_initial_request(&mut self, _helper: &mut TsxHelper, _req: Request) {
        // Deliberately neither forwards nor responds.
    }
}

struct ForkSproutlet {
    targets: Vec<Uri>,
}

struct ForkTsx {
    targets: Vec<Uri>,
}

impl Sproutlet for ForkSproutlet {
    fn service_name(&self) -> &str {
        "fork"
    }

    fn get_tsx(&self, _alias: &str, _req: &Request) -> Option<Box<dyn SproutletTsx>> {
        Some(Box::new(ForkTsx {
            targets: self.targets.clone(),
        }))
    }
}

#[async_trait]
impl SproutletTsx for ForkTsx {
    async fn on_rx_initial_request(&mut self, helper: &mut TsxHelper, req: Request) {
        for target in &self.targets {
            let mut fork = helper.clone_request(&req);
            fork.uri = target.clone();
            helper.send_request(fork);
        }
    }
}

/// Routes to another sproutlet on this node by pushing a service Route.
struct ChainSproutlet {
    name: String,
    next_host: String,
}

struct ChainTsx {
    next_host: String,
}

impl Sproutlet for ChainSproutlet {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn get_tsx(&self, _alias: &str, _req: &Request) -> Option<Box<dyn SproutletTsx>> {
        Some(Box::new(ChainTsx {
            next_host: self.next_host.clone(),
        }))
    }
}

#[async_trait]
impl SproutletTsx for ChainTsx {
    async fn on_rx_initial_request(&mut self, helper: &mut TsxHelper, mut req: Request) {
        let mut uri = Uri::sip_host(&self.next_host);
        uri.set_param("lr", None);
        req.push_route_front(NameAddr::new(uri));
        helper.send_request(req);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forward_adds_via_and_pops_service_route() {
    let transport = TestTransport::new();
    let proxy = SproutletProxy::new(
        config(),
        transport.clone(),
        vec![Arc::new(ForwardSproutlet {
            name: "fwd".to_string(),
        })],
    );

    let req = invite(Some("fwd.example.com"), "t1");
    proxy
        .handle_message(SipMessage::Request(req), upstream_addr())
        .await;

    let (sent, dest) = next_request(&transport).await;
    assert_eq!(dest, "192.0.2.50:5062".parse().unwrap());
    // Our Via on top, upstream's below.
    let vias: Vec<&str> = sent.headers.all(&HeaderName::Via).collect();
    assert_eq!(vias.len(), 2);
    assert!(vias[0].contains("127.0.0.1:5054"));
    // Service route consumed.
    assert!(sent.routes().unwrap().is_empty());
    // Max-Forwards decremented.
    assert_eq!(sent.headers.first(&HeaderName::MaxForwards), Some("69"));
}

#[tokio::test]
async fn response_flows_back_upstream() {
    let transport = TestTransport::new();
    let proxy = SproutletProxy::new(
        config(),
        transport.clone(),
        vec![Arc::new(ForwardSproutlet {
            name: "fwd".to_string(),
        })],
    );

    proxy
        .handle_message(
            SipMessage::Request(invite(Some("fwd.example.com"), "t2")),
            upstream_addr(),
        )
        .await;
    let (sent, _) = next_request(&transport).await;

    let rsp = Response::for_request(&sent, StatusCode::OK, None);
    proxy
        .handle_message(SipMessage::Response(rsp), "192.0.2.50:5062".parse().unwrap())
        .await;

    let (upstream_rsp, dest) = next_response(&transport).await;
    assert_eq!(dest, upstream_addr());
    assert_eq!(upstream_rsp.status, StatusCode::OK);
    // Our Via was removed on the way through.
    let vias: Vec<&str> = upstream_rsp.headers.all(&HeaderName::Via).collect();
    assert_eq!(vias.len(), 1);
    assert!(vias[0].contains("10.0.0.1:5060"));
}

#[tokio::test]
async fn sproutlet_that_does_nothing_yields_503() {
    let transport = TestTransport::new();
    let proxy = SproutletProxy::new(
        config(),
        transport.clone(),
        vec![Arc::new(NoopSproutlet)],
    );

    proxy
        .handle_message(
            SipMessage::Request(invite(Some("noop.example.com"), "t3")),
            upstream_addr(),
        )
        .await;

    let (rsp, dest) = next_response(&transport).await;
    assert_eq!(dest, upstream_addr());
    assert_eq!(rsp.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn reject_goes_upstream() {
    let transport = TestTransport::new();
    let proxy = SproutletProxy::new(
        config(),
        transport.clone(),
        vec![Arc::new(RejectSproutlet {
            name: "rej".to_string(),
            status: StatusCode::FORBIDDEN,
        })],
    );

    proxy
        .handle_message(
            SipMessage::Request(invite(Some("rej.example.com"), "t4")),
            upstream_addr(),
        )
        .await;

    let (rsp, _) = next_response(&transport).await;
    assert_eq!(rsp.status, StatusCode::FORBIDDEN);
    assert!(rsp.to().unwrap().tag().is_some());
}

#[tokio::test]
async fn forked_finals_aggregate_to_single_best() {
    let transport = TestTransport::new();
    let proxy = SproutletProxy::new(
        config(),
        transport.clone(),
        vec![Arc::new(ForkSproutlet {
            targets: vec![
                "sip:bob@192.0.2.51:5060".parse().unwrap(),
                "sip:bob@192.0.2.52:5060".parse().unwrap(),
            ],
        })],
    );

    proxy
        .handle_message(
            SipMessage::Request(invite(Some("fork.example.com"), "t5")),
            upstream_addr(),
        )
        .await;

    let (fork1, _) = next_request(&transport).await;
    let (fork2, _) = next_request(&transport).await;

    // First failure: nothing upstream yet.
    proxy
        .handle_message(
            SipMessage::Response(Response::for_request(&fork1, StatusCode::BUSY_HERE, None)),
            "192.0.2.51:5060".parse().unwrap(),
        )
        .await;

    // Second failure completes aggregation; best (480 < 486 in class) wins.
    proxy
        .handle_message(
            SipMessage::Response(Response::for_request(
                &fork2,
                StatusCode::TEMPORARILY_UNAVAILABLE,
                None,
            )),
            "192.0.2.52:5060".parse().unwrap(),
        )
        .await;

    let (rsp, _) = next_response(&transport).await;
    assert_eq!(rsp.status, StatusCode::TEMPORARILY_UNAVAILABLE);

    // Exactly one final response went upstream.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let finals = transport
        .sent()
        .into_iter()
        .filter(|(m, _)| matches!(m, SipMessage::Response(r) if r.status.is_final()))
        .count();
    assert_eq!(finals, 1);
}

#[tokio::test]
async fn two_hundred_forwards_immediately_and_cancels_losers() {
    let transport = TestTransport::new();
    let proxy = SproutletProxy::new(
        config(),
        transport.clone(),
        vec![Arc::new(ForkSproutlet {
            targets: vec![
                "sip:bob@192.0.2.51:5060".parse().unwrap(),
                "sip:bob@192.0.2.52:5060".parse().unwrap(),
            ],
        })],
    );

    proxy
        .handle_message(
            SipMessage::Request(invite(Some("fork.example.com"), "t6")),
            upstream_addr(),
        )
        .await;

    let (fork1, _) = next_request(&transport).await;
    let (_fork2, _) = next_request(&transport).await;

    proxy
        .handle_message(
            SipMessage::Response(Response::for_request(&fork1, StatusCode::OK, None)),
            "192.0.2.51:5060".parse().unwrap(),
        )
        .await;

    let (rsp, _) = next_response(&transport).await;
    assert_eq!(rsp.status, StatusCode::OK);

    // The losing fork is cancelled.
    let (cancel, dest) = next_request(&transport).await;
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(dest, "192.0.2.52:5060".parse().unwrap());
}

#[tokio::test]
async fn cancel_propagates_and_487_aggregates() {
    let transport = TestTransport::new();
    let proxy = SproutletProxy::new(
        config(),
        transport.clone(),
        vec![Arc::new(ForwardSproutlet {
            name: "fwd".to_string(),
        })],
    );

    let req = invite(Some("fwd.example.com"), "t7");
    proxy
        .handle_message(SipMessage::Request(req.clone()), upstream_addr())
        .await;
    let (fork, fork_dest) = next_request(&transport).await;

    // Upstream CANCEL (same branch as the INVITE).
    let mut cancel = Request::new(Method::Cancel, req.uri.clone());
    for name in [
        HeaderName::Via,
        HeaderName::To,
        HeaderName::From,
        HeaderName::CallId,
    ] {
        cancel
            .headers
            .push(name.clone(), req.headers.first(&name).unwrap().to_string());
    }
    cancel.headers.push(HeaderName::CSeq, "1 CANCEL");
    proxy
        .handle_message(SipMessage::Request(cancel), upstream_addr())
        .await;

    // 200 for the CANCEL itself.
    let (cancel_ok, _) = next_response(&transport).await;
    assert_eq!(cancel_ok.status, StatusCode::OK);
    assert_eq!(cancel_ok.cseq().unwrap().method, Method::Cancel);

    // CANCEL propagated to the fork.
    let (fork_cancel, dest) = next_request(&transport).await;
    assert_eq!(fork_cancel.method, Method::Cancel);
    assert_eq!(dest, fork_dest);

    // Downstream answers 487; it is aggregated upstream.
    proxy
        .handle_message(
            SipMessage::Response(Response::for_request(
                &fork,
                StatusCode::REQUEST_TERMINATED,
                None,
            )),
            fork_dest,
        )
        .await;

    let (final_rsp, dest) = next_response(&transport).await;
    assert_eq!(final_rsp.status, StatusCode::REQUEST_TERMINATED);
    assert_eq!(dest, upstream_addr());
}

#[tokio::test]
async fn internal_chaining_between_sproutlets() {
    let transport = TestTransport::new();
    let proxy = SproutletProxy::new(
        config(),
        transport.clone(),
        vec![
            Arc::new(ChainSproutlet {
                name: "first".to_string(),
                next_host: "second.example.com".to_string(),
            }),
            Arc::new(RejectSproutlet {
                name: "second".to_string(),
                status: StatusCode::BUSY_HERE,
            }),
        ],
    );

    proxy
        .handle_message(
            SipMessage::Request(invite(Some("first.example.com"), "t8")),
            upstream_addr(),
        )
        .await;

    // The second sproutlet's rejection travels back through the first to
    // the wire, with no request ever hitting the transport.
    let (rsp, dest) = next_response(&transport).await;
    assert_eq!(rsp.status, StatusCode::BUSY_HERE);
    assert_eq!(dest, upstream_addr());
    let requests = transport
        .sent()
        .into_iter()
        .filter(|(m, _)| matches!(m, SipMessage::Request(_)))
        .count();
    assert_eq!(requests, 0);
}

#[tokio::test]
async fn overload_rejects_with_503() {
    let transport = TestTransport::new();
    let mut cfg = config();
    // No refill: only the single-token burst allowance is admitted.
    cfg.max_inbound_rate = Some(0.0);
    let proxy = SproutletProxy::new(
        cfg,
        transport.clone(),
        vec![Arc::new(RejectSproutlet {
            name: "rej".to_string(),
            status: StatusCode::NOT_FOUND,
        })],
    );

    for branch in ["o1", "o2", "o3"] {
        proxy
            .handle_message(
                SipMessage::Request(invite(Some("rej.example.com"), branch)),
                upstream_addr(),
            )
            .await;
    }

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let (rsp, _) = next_response(&transport).await;
        statuses.push(rsp.status);
    }
    statuses.sort();
    assert_eq!(
        statuses,
        vec![
            StatusCode::NOT_FOUND,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::SERVICE_UNAVAILABLE
        ]
    );
}

#[tokio::test]
async fn cancel_for_unknown_transaction_gets_481() {
    let transport = TestTransport::new();
    let proxy = SproutletProxy::new(config(), transport.clone(), vec![Arc::new(NoopSproutlet)]);

    let req = invite(None, "t9");
    let mut cancel = Request::new(Method::Cancel, req.uri.clone());
    for name in [
        HeaderName::Via,
        HeaderName::To,
        HeaderName::From,
        HeaderName::CallId,
    ] {
        cancel
            .headers
            .push(name.clone(), req.headers.first(&name).unwrap().to_string());
    }
    cancel.headers.push(HeaderName::CSeq, "1 CANCEL");
    proxy
        .handle_message(SipMessage::Request(cancel), upstream_addr())
        .await;

    let (rsp, _) = next_response(&transport).await;
    assert_eq!(rsp.status, StatusCode::CALL_TSX_DOES_NOT_EXIST);
}
