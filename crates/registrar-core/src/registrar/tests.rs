use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use scscf_hss_client::{
    AppServer, DefaultHandling, Ifc, Ifcs, RegOp, RegistrationState, Spt, SptPredicate,
    TriggerPoint,
};
use scscf_reg_store::{MemoryKvStore, NoopTimerService, RegStore};
use scscf_sip_core::prelude::*;
use scscf_sproutlet_core::{ProxyConfig, SproutletProxy, TestTransport};

use crate::config::RegistrarConfig;
use crate::registrar::{binding_id, default_private_id, digest_username, RegistrarSproutlet};
use crate::testutil::{memory_store, register_request, FakeHss, FakeSender, NullSink};

const AOR: &str = "sip:alice@example.com";

fn upstream() -> SocketAddr {
    "10.0.0.1:5060".parse().unwrap()
}

struct Fixture {
    proxy: SproutletProxy,
    transport: Arc<TestTransport>,
    store: Arc<RegStore>,
    hss: Arc<FakeHss>,
    sender: Arc<FakeSender>,
}

fn fixture_with(hss: Arc<FakeHss>, store: Arc<RegStore>) -> Fixture {
    let transport = TestTransport::new();
    let sender = FakeSender::new();
    let registrar = RegistrarSproutlet::new(
        RegistrarConfig::new("example.com", "sip:scscf.example.com:5054"),
        store.clone(),
        None,
        hss.clone(),
        sender.clone(),
    );
    let proxy = SproutletProxy::new(
        ProxyConfig::new("example.com", "127.0.0.1:5054"),
        transport.clone(),
        vec![Arc::new(registrar)],
    );
    Fixture {
        proxy,
        transport,
        store,
        hss,
        sender,
    }
}

fn fixture() -> Fixture {
    fixture_with(FakeHss::registered(), memory_store())
}

async fn do_register(fx: &Fixture, req: Request) -> Response {
    fx.proxy
        .handle_message(SipMessage::Request(req), upstream())
        .await;
    loop {
        let (msg, _) = fx
            .transport
            .next_sent_timeout(Duration::from_secs(2))
            .await
            .expect("expected a response");
        if let SipMessage::Response(rsp) = msg {
            return rsp;
        }
    }
}

#[tokio::test]
async fn initial_register_creates_binding() {
    let fx = fixture();
    let rsp = do_register(
        &fx,
        register_request(
            AOR,
            "<sip:alice@192.0.2.1:5060;transport=TCP>",
            300,
            "reg-cid-1",
            1,
        ),
    )
    .await;

    assert_eq!(rsp.status, StatusCode::OK);
    assert_eq!(rsp.headers.first(&HeaderName::Supported), Some("outbound"));

    let contacts = rsp.contacts().unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].expires, Some(300));
    assert_eq!(
        contacts[0].addr.as_ref().unwrap().uri.to_string(),
        "sip:alice@192.0.2.1:5060;transport=TCP"
    );

    assert_eq!(
        rsp.headers.first(&HeaderName::PAssociatedUri),
        Some("<sip:alice@example.com>")
    );
    assert_eq!(
        rsp.headers.first(&HeaderName::ServiceRoute),
        Some("<sip:scscf.example.com:5054;lr;orig>")
    );
    assert!(rsp
        .headers
        .first(&HeaderName::PChargingFunctionAddresses)
        .unwrap()
        .contains("ccf=ccf1.example.com"));

    let record = fx.store.get_aor(AOR).await.unwrap();
    assert_eq!(record.bindings.len(), 1);
    let binding = record.bindings.values().next().unwrap();
    assert_eq!(binding.cid, "reg-cid-1");
    assert_eq!(binding.private_id, "alice@example.com");
}

#[tokio::test]
async fn reregister_refreshes_binding() {
    let fx = fixture();
    do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 1),
    )
    .await;
    let rsp = do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 600, "reg-cid-1", 2),
    )
    .await;

    assert_eq!(rsp.status, StatusCode::OK);
    let contacts = rsp.contacts().unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].expires, Some(600));

    let record = fx.store.get_aor(AOR).await.unwrap();
    assert_eq!(record.bindings.len(), 1);
    assert_eq!(record.bindings.values().next().unwrap().cseq, 2);
}

#[tokio::test]
async fn stale_cseq_is_ignored() {
    let fx = fixture();
    do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 5),
    )
    .await;
    // Same call and contact, older CSeq: a retransmission.
    do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 600, "reg-cid-1", 4),
    )
    .await;

    let record = fx.store.get_aor(AOR).await.unwrap();
    assert_eq!(record.bindings.len(), 1);
    let binding = record.bindings.values().next().unwrap();
    assert_eq!(binding.uri, "sip:alice@192.0.2.1:5060");
    assert_eq!(binding.cseq, 5);
}

#[tokio::test]
async fn wildcard_deregisters_everything() {
    let fx = fixture();
    do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 1),
    )
    .await;
    let rsp = do_register(&fx, register_request(AOR, "*", 0, "reg-cid-2", 1)).await;

    assert_eq!(rsp.status, StatusCode::OK);
    assert!(rsp.contacts().unwrap().is_empty());

    let record = fx.store.get_aor(AOR).await.unwrap();
    assert!(record.bindings.is_empty());

    // The HSS heard about the de-registration.
    assert!(fx
        .hss
        .calls()
        .iter()
        .any(|(_, op)| *op == RegOp::DeregUser));
}

#[tokio::test]
async fn wildcard_with_nonzero_expiry_is_400() {
    let fx = fixture();
    let rsp = do_register(&fx, register_request(AOR, "*", 300, "reg-cid-1", 1)).await;
    assert_eq!(rsp.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn emergency_binding_resists_wildcard_deregister() {
    let fx = fixture();
    do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060;sos>", 300, "reg-cid-1", 1),
    )
    .await;
    let rsp = do_register(&fx, register_request(AOR, "*", 0, "reg-cid-2", 1)).await;

    assert_eq!(rsp.status, StatusCode::NOT_IMPLEMENTED);
    let record = fx.store.get_aor(AOR).await.unwrap();
    assert_eq!(record.bindings.len(), 1);
    assert!(record.bindings.values().next().unwrap().emergency);
}

#[tokio::test]
async fn emergency_only_deregister_is_501() {
    let fx = fixture();
    let rsp = do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060;sos>", 0, "reg-cid-1", 1),
    )
    .await;
    assert_eq!(rsp.status, StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn unknown_subscriber_is_403() {
    let hss = Arc::new(FakeHss {
        fail_not_found: true,
        ..Default::default()
    });
    let fx = fixture_with(hss, memory_store());
    let rsp = do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 1),
    )
    .await;
    assert_eq!(rsp.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn hss_failure_is_504() {
    let hss = Arc::new(FakeHss {
        fail_server: true,
        ..Default::default()
    });
    let fx = fixture_with(hss, memory_store());
    let rsp = do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 1),
    )
    .await;
    assert_eq!(rsp.status, StatusCode::SERVER_TIMEOUT);
}

#[tokio::test]
async fn unregistered_hss_state_is_504() {
    let hss = Arc::new(FakeHss {
        state: RegistrationState::NotRegistered,
        ..Default::default()
    });
    let fx = fixture_with(hss, memory_store());
    let rsp = do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 1),
    )
    .await;
    assert_eq!(rsp.status, StatusCode::SERVER_TIMEOUT);
}

#[tokio::test]
async fn store_failure_is_500() {
    let kv = Arc::new(MemoryKvStore::new());
    let store = Arc::new(RegStore::new(
        kv.clone(),
        Arc::new(NoopTimerService),
        Arc::new(NullSink),
    ));
    let fx = fixture_with(FakeHss::registered(), store);
    kv.set_failed(true);
    let rsp = do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 1),
    )
    .await;
    assert_eq!(rsp.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn expiry_clamped_to_maximum() {
    let fx = fixture();
    let rsp = do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 90_000, "reg-cid-1", 1),
    )
    .await;
    assert_eq!(rsp.status, StatusCode::OK);
    let contacts = rsp.contacts().unwrap();
    assert_eq!(contacts[0].expires, Some(300));
    assert!(contacts[0].expires.unwrap() > 0);
}

#[tokio::test]
async fn gruu_returned_when_supported() {
    let fx = fixture();
    let mut req = register_request(
        AOR,
        "<sip:alice@192.0.2.1:5060>;+sip.instance=\"<urn:uuid:f81d4fae>\"",
        300,
        "reg-cid-1",
        1,
    );
    req.headers.push(HeaderName::Supported, "gruu");
    let rsp = do_register(&fx, req).await;

    let contact = rsp.headers.first(&HeaderName::Contact).unwrap();
    assert!(contact.contains("pub-gruu=\"sip:alice@example.com;gr="));
}

#[tokio::test]
async fn path_headers_are_echoed_with_require() {
    let fx = fixture();
    let mut req = register_request(AOR, "<sip:alice@192.0.2.1:5060;ob>", 300, "reg-cid-1", 1);
    req.headers
        .push(HeaderName::Path, "<sip:edge.example.net;lr>");
    let rsp = do_register(&fx, req).await;

    assert_eq!(rsp.status, StatusCode::OK);
    assert_eq!(
        rsp.headers.first(&HeaderName::Path),
        Some("<sip:edge.example.net;lr>")
    );
    assert_eq!(rsp.headers.first(&HeaderName::Require), Some("outbound"));
}

#[tokio::test]
async fn third_party_register_fans_out() {
    let ifcs = Ifcs::new(vec![Ifc {
        priority: 0,
        trigger: Some(TriggerPoint {
            condition_type_cnf: true,
            spts: vec![Spt {
                groups: vec![0],
                negated: false,
                predicate: SptPredicate::Method("REGISTER".to_string()),
            }],
        }),
        app_server: AppServer {
            server_name: "sip:as1.example.com".to_string(),
            default_handling: DefaultHandling::SessionContinued,
            include_register_request: false,
            include_register_response: false,
            service_info: None,
        },
    }]);
    let fx = fixture_with(FakeHss::with_ifcs(ifcs), memory_store());
    do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 1),
    )
    .await;

    let sent = fx.sender.wait_for_requests(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, Method::Register);
    assert_eq!(sent[0].uri.to_string(), "sip:as1.example.com");
    assert_eq!(
        sent[0].headers.first(&HeaderName::To),
        Some("<sip:alice@example.com>")
    );
}

#[tokio::test]
async fn terminated_third_party_failure_deregisters() {
    let ifcs = Ifcs::new(vec![Ifc {
        priority: 0,
        trigger: None,
        app_server: AppServer {
            server_name: "sip:as1.example.com".to_string(),
            default_handling: DefaultHandling::SessionTerminated,
            include_register_request: false,
            include_register_response: false,
            service_info: None,
        },
    }]);
    let fx = fixture_with(FakeHss::with_ifcs(ifcs), memory_store());
    fx.sender.answer_with(StatusCode::INTERNAL_SERVER_ERROR);

    do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 1),
    )
    .await;

    fx.sender.wait_for_requests(1).await;
    // The de-registration runs asynchronously after the failure.
    for _ in 0..100 {
        let record = fx.store.get_aor(AOR).await.unwrap();
        if record.bindings.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = fx.store.get_aor(AOR).await.unwrap();
    assert!(record.bindings.is_empty());
    assert!(fx
        .hss
        .calls()
        .iter()
        .any(|(_, op)| *op == RegOp::DeregAdmin));
}

#[tokio::test]
async fn emergency_registration_skips_third_party() {
    let ifcs = Ifcs::new(vec![Ifc {
        priority: 0,
        trigger: None,
        app_server: AppServer {
            server_name: "sip:as1.example.com".to_string(),
            default_handling: DefaultHandling::SessionContinued,
            include_register_request: false,
            include_register_response: false,
            service_info: None,
        },
    }]);
    let fx = fixture_with(FakeHss::with_ifcs(ifcs), memory_store());
    do_register(
        &fx,
        register_request(AOR, "<sip:alice@192.0.2.1:5060;sos>", 300, "reg-cid-1", 1),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.sender.requests.lock().is_empty());
}

#[tokio::test]
async fn non_sip_to_uri_is_404() {
    let fx = fixture();
    let mut req = register_request(AOR, "<sip:alice@192.0.2.1:5060>", 300, "reg-cid-1", 1);
    req.headers.set(HeaderName::To, "<mailto:alice@example.com>");
    let rsp = do_register(&fx, req).await;
    assert_eq!(rsp.status, StatusCode::NOT_FOUND);
}

#[test]
fn binding_id_prefers_instance() {
    let contact: Contact =
        "<sip:alice@192.0.2.1>;+sip.instance=\"<urn:uuid:1>\";reg-id=2".parse().unwrap();
    assert_eq!(binding_id(&contact), "<urn:uuid:1>:2");

    let plain: Contact = "<sip:alice@192.0.2.1:5060>".parse().unwrap();
    assert_eq!(binding_id(&plain), "sip:alice@192.0.2.1:5060");

    let emergency: Contact = "<sip:alice@192.0.2.1;sos>".parse().unwrap();
    assert_eq!(binding_id(&emergency), "sossip:alice@192.0.2.1;sos");
}

#[test]
fn digest_username_extraction() {
    let mut req = Request::new(Method::Register, "sip:example.com".parse().unwrap());
    req.headers.push(
        HeaderName::Authorization,
        "Digest username=\"alice@example.com\", realm=\"example.com\", nonce=\"xyz\"",
    );
    assert_eq!(
        digest_username(&req).as_deref(),
        Some("alice@example.com")
    );

    let mut empty = Request::new(Method::Register, "sip:example.com".parse().unwrap());
    empty
        .headers
        .push(HeaderName::Authorization, "Digest username=\"\", realm=\"x\"");
    assert_eq!(digest_username(&empty), None);
}

#[test]
fn default_private_id_strips_scheme() {
    assert_eq!(
        default_private_id("sip:alice@example.com"),
        "alice@example.com"
    );
    assert_eq!(default_private_id("tel:+1650"), "+1650");
}
