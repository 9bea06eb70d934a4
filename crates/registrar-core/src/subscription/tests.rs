use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use scscf_reg_store::{Binding, RegStore};
use scscf_sip_core::prelude::*;
use scscf_sproutlet_core::{ProxyConfig, SproutletProxy, TestTransport};

use crate::config::RegistrarConfig;
use crate::registrar::now_secs;
use crate::subscription::SubscriptionSproutlet;
use crate::testutil::{memory_store, FakeHss, FakeSender};

const AOR: &str = "sip:alice@example.com";

fn upstream() -> SocketAddr {
    "10.0.0.1:5060".parse().unwrap()
}

struct Fixture {
    proxy: SproutletProxy,
    transport: Arc<TestTransport>,
    store: Arc<RegStore>,
    sender: Arc<FakeSender>,
}

fn fixture() -> Fixture {
    let transport = TestTransport::new();
    let store = memory_store();
    let sender = FakeSender::new();
    let sproutlet = SubscriptionSproutlet::new(
        RegistrarConfig::new("example.com", "sip:scscf.example.com:5054"),
        store.clone(),
        FakeHss::registered(),
        sender.clone(),
    );
    let proxy = SproutletProxy::new(
        ProxyConfig::new("example.com", "127.0.0.1:5054"),
        transport.clone(),
        vec![Arc::new(sproutlet)],
    );
    Fixture {
        proxy,
        transport,
        store,
        sender,
    }
}

fn subscribe(event: &str, expires: u32) -> Request {
    let mut req = Request::new(Method::Subscribe, "sip:example.com".parse().unwrap());
    req.headers.push(
        HeaderName::Via,
        "SIP/2.0/UDP 192.0.2.9:5060;branch=z9hG4bKsub1",
    );
    req.headers.push(HeaderName::MaxForwards, "70");
    req.headers.push(HeaderName::To, format!("<{}>", AOR));
    req.headers.push(
        HeaderName::From,
        "<sip:watcher@example.com>;tag=watcher-tag",
    );
    req.headers.push(HeaderName::CallId, "sub-cid-1");
    req.headers.push(HeaderName::CSeq, "1 SUBSCRIBE");
    req.headers
        .push(HeaderName::Contact, "<sip:watcher@192.0.2.9:5060>");
    req.headers.push(HeaderName::Event, event.to_string());
    req.headers.push(HeaderName::Expires, expires.to_string());
    req
}

async fn do_subscribe(fx: &Fixture, req: Request) -> Response {
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
async fn subscribe_stores_subscription_and_notifies() {
    let fx = fixture();

    // Seed a binding so the full-state NOTIFY has content.
    let mut record = fx.store.get_aor(AOR).await.unwrap();
    record.bindings.insert(
        "b1".to_string(),
        Binding {
            uri: "sip:alice@192.0.2.1:5060".to_string(),
            cid: "reg-cid".to_string(),
            cseq: 1,
            priority: 1000,
            expires: now_secs() + 300,
            ..Default::default()
        },
    );
    fx.store.set_aor(AOR, &mut record, false).await.unwrap();

    let rsp = do_subscribe(&fx, subscribe("reg", 600)).await;
    assert_eq!(rsp.status, StatusCode::OK);
    assert_eq!(rsp.headers.first(&HeaderName::Expires), Some("300"));

    let record = fx.store.get_aor(AOR).await.unwrap();
    assert_eq!(record.subscriptions.len(), 1);
    let sub = record.subscriptions.values().next().unwrap();
    assert_eq!(sub.from_uri, "sip:watcher@example.com");
    assert_eq!(sub.req_uri, "sip:watcher@192.0.2.9:5060");
    // The response's To tag is the subscription key.
    assert_eq!(rsp.to().unwrap().tag(), Some(sub.to_tag.as_str()));

    // Immediate full-state NOTIFY went out.
    for _ in 0..100 {
        if !fx.sender.detached.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let detached = fx.sender.detached.lock().clone();
    assert_eq!(detached.len(), 1);
    let notify = &detached[0];
    assert_eq!(notify.method, Method::Notify);
    assert_eq!(notify.headers.first(&HeaderName::Event), Some("reg"));
    let body = String::from_utf8_lossy(&notify.body);
    // The initial snapshot is a full-state document.
    assert!(body.contains("state=\"full\""));
    assert!(body.contains("sip:alice@192.0.2.1:5060"));
}

#[tokio::test]
async fn non_reg_event_is_489() {
    let fx = fixture();
    let rsp = do_subscribe(&fx, subscribe("presence", 600)).await;
    assert_eq!(rsp.status, StatusCode::BAD_EVENT);
}

#[tokio::test]
async fn zero_expiry_removes_subscription() {
    let fx = fixture();
    let rsp = do_subscribe(&fx, subscribe("reg", 600)).await;
    let to_tag = rsp.to().unwrap().tag().unwrap().to_string();

    // Terminate using the dialog's To tag.
    let mut terminate = subscribe("reg", 0);
    terminate
        .headers
        .set(HeaderName::To, format!("<{}>;tag={}", AOR, to_tag));
    terminate.headers.set(HeaderName::CSeq, "2 SUBSCRIBE");
    let rsp = do_subscribe(&fx, terminate).await;
    assert_eq!(rsp.status, StatusCode::OK);
    assert_eq!(rsp.headers.first(&HeaderName::Expires), Some("0"));

    let record = fx.store.get_aor(AOR).await.unwrap();
    assert!(record.subscriptions.is_empty());
}

#[tokio::test]
async fn subscribe_without_contact_is_400() {
    let fx = fixture();
    let mut req = subscribe("reg", 600);
    req.headers.remove(&HeaderName::Contact);
    let rsp = do_subscribe(&fx, req).await;
    assert_eq!(rsp.status, StatusCode::BAD_REQUEST);
}
