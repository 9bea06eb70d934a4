//! reg-event NOTIFY construction: RFC 3680 reginfo+xml bodies and the
//! dialog-scoped NOTIFY request that carries them.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use scscf_sip_core::prelude::*;

use crate::aor::{AoR, BindingEvent, Subscription};

/// Whether a reginfo document is a complete snapshot or a delta.
///
/// The first NOTIFY on a new subscription must be full state so the
/// watcher has a baseline; change-driven NOTIFYs carry only the affected
/// contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReginfoState {
    Full,
    Partial,
}

impl ReginfoState {
    fn as_str(&self) -> &'static str {
        match self {
            ReginfoState::Full => "full",
            ReginfoState::Partial => "partial",
        }
    }
}

/// Build the reginfo document for a batch of binding events.
///
/// The reginfo version is the record's `notify_cseq`, which the store keeps
/// monotonic across writes.
pub fn reginfo_body(
    aor_id: &str,
    record: &AoR,
    events: &[BindingEvent],
    now: u64,
    state: ReginfoState,
) -> Vec<u8> {
    let mut writer = Writer::new(Vec::new());

    let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));

    let mut reginfo = BytesStart::new("reginfo");
    reginfo.push_attribute(("xmlns", "urn:ietf:params:xml:ns:reginfo"));
    reginfo.push_attribute(("version", record.notify_cseq.to_string().as_str()));
    reginfo.push_attribute(("state", state.as_str()));
    let _ = writer.write_event(Event::Start(reginfo));

    let reg_state = if record.active_bindings(now).next().is_some() {
        "active"
    } else {
        "terminated"
    };
    let mut registration = BytesStart::new("registration");
    registration.push_attribute(("aor", aor_id));
    registration.push_attribute(("id", aor_id));
    registration.push_attribute(("state", reg_state));
    let _ = writer.write_event(Event::Start(registration));

    for event in events {
        let mut contact = BytesStart::new("contact");
        contact.push_attribute(("id", event.binding_id.as_str()));
        contact.push_attribute((
            "state",
            if event.event.is_active() {
                "active"
            } else {
                "terminated"
            },
        ));
        contact.push_attribute(("event", event.event.as_str()));
        if event.event.is_active() && event.expires > now {
            contact.push_attribute(("expires", (event.expires - now).to_string().as_str()));
        }
        let _ = writer.write_event(Event::Start(contact));

        let _ = writer.write_event(Event::Start(BytesStart::new("uri")));
        let _ = writer.write_event(Event::Text(BytesText::new(&event.contact_uri)));
        let _ = writer.write_event(Event::End(BytesEnd::new("uri")));

        let _ = writer.write_event(Event::End(BytesEnd::new("contact")));
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("registration")));
    let _ = writer.write_event(Event::End(BytesEnd::new("reginfo")));

    writer.into_inner()
}

/// Build the NOTIFY request for one subscription dialog.
pub fn build_notify(
    aor_id: &str,
    record: &AoR,
    sub: &Subscription,
    events: &[BindingEvent],
    now: u64,
    state: ReginfoState,
) -> Request {
    let uri: Uri = sub
        .req_uri
        .parse()
        .unwrap_or_else(|_| Uri::sip_host("invalid.invalid"));
    let mut notify = Request::new(Method::Notify, uri);

    // The node is the notifier, so the dialog's local side is the
    // subscription's To and the remote side its From.
    notify.headers.push(
        HeaderName::From,
        format!("<{}>;tag={}", sub.to_uri, sub.to_tag),
    );
    notify.headers.push(
        HeaderName::To,
        format!("<{}>;tag={}", sub.from_uri, sub.from_tag),
    );
    notify.headers.push(HeaderName::CallId, sub.cid.clone());
    notify.headers.push(
        HeaderName::CSeq,
        CSeq::new(record.notify_cseq, Method::Notify).to_string(),
    );
    for route in &sub.route_hdrs {
        notify.headers.push(HeaderName::Route, route.clone());
    }
    notify.headers.push(HeaderName::MaxForwards, "70");
    notify.headers.push(HeaderName::Event, "reg");
    let remaining = sub.expires.saturating_sub(now);
    notify.headers.push(
        HeaderName::SubscriptionState,
        format!("active;expires={}", remaining),
    );
    notify
        .headers
        .push(HeaderName::ContentType, "application/reginfo+xml");
    notify.body = reginfo_body(aor_id, record, events, now, state);
    notify
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aor::{Binding, ContactEvent};

    #[test]
    fn reginfo_carries_event_and_state() {
        let mut record = AoR::default();
        record.notify_cseq = 5;
        record.bindings.insert(
            "b1".to_string(),
            Binding {
                uri: "sip:alice@192.0.2.1".to_string(),
                expires: 1_000,
                ..Default::default()
            },
        );
        let events = vec![BindingEvent {
            binding_id: "b1".to_string(),
            event: ContactEvent::Refreshed,
            contact_uri: "sip:alice@192.0.2.1".to_string(),
            expires: 1_000,
        }];
        let body = String::from_utf8(reginfo_body(
            "sip:alice@example.com",
            &record,
            &events,
            400,
            ReginfoState::Partial,
        ))
        .unwrap();
        assert!(body.contains("version=\"5\""));
        assert!(body.contains("state=\"partial\""));
        assert!(body.contains("state=\"active\""));
        assert!(body.contains("event=\"refreshed\""));
        assert!(body.contains("expires=\"600\""));
    }

    #[test]
    fn full_state_document_is_marked_full() {
        let mut record = AoR::default();
        record.notify_cseq = 1;
        record.bindings.insert(
            "b1".to_string(),
            Binding {
                uri: "sip:alice@192.0.2.1".to_string(),
                expires: 1_000,
                ..Default::default()
            },
        );
        let events = vec![BindingEvent {
            binding_id: "b1".to_string(),
            event: ContactEvent::Created,
            contact_uri: "sip:alice@192.0.2.1".to_string(),
            expires: 1_000,
        }];
        let body = String::from_utf8(reginfo_body(
            "sip:alice@example.com",
            &record,
            &events,
            400,
            ReginfoState::Full,
        ))
        .unwrap();
        assert!(body.contains("state=\"full\""));
        assert!(!body.contains("state=\"partial\""));
    }

    #[test]
    fn terminated_contact_has_no_expires() {
        let record = AoR::default();
        let events = vec![BindingEvent {
            binding_id: "b1".to_string(),
            event: ContactEvent::Unregistered,
            contact_uri: "sip:alice@192.0.2.1".to_string(),
            expires: 0,
        }];
        let body = String::from_utf8(reginfo_body(
            "sip:alice@example.com",
            &record,
            &events,
            400,
            ReginfoState::Partial,
        ))
        .unwrap();
        assert!(body.contains("state=\"terminated\""));
        assert!(body.contains("event=\"unregistered\""));
        assert!(!body.contains("expires=\""));
    }

    #[test]
    fn notify_request_reuses_subscription_dialog() {
        let mut record = AoR::default();
        record.notify_cseq = 9;
        let sub = Subscription {
            from_uri: "sip:watcher@example.com".to_string(),
            from_tag: "ft".to_string(),
            to_uri: "sip:alice@example.com".to_string(),
            to_tag: "tt".to_string(),
            req_uri: "sip:watcher@192.0.2.9:5060".to_string(),
            route_hdrs: vec!["<sip:edge.example.com;lr>".to_string()],
            cid: "sub-cid".to_string(),
            expires: 1_000,
            ..Default::default()
        };
        let notify = build_notify(
            "sip:alice@example.com",
            &record,
            &sub,
            &[],
            400,
            ReginfoState::Partial,
        );
        assert_eq!(notify.method, Method::Notify);
        assert_eq!(notify.call_id(), Some("sub-cid"));
        assert_eq!(notify.cseq().unwrap().seq, 9);
        assert_eq!(notify.headers.first(&HeaderName::Event), Some("reg"));
        assert_eq!(notify.routes().unwrap().len(), 1);
        let from = notify.from().unwrap();
        assert_eq!(from.tag(), Some("tt"));
    }
}
