//! reg-event SUBSCRIBE handling: watchers join an AoR's subscription set
//! and receive an immediate full-state NOTIFY.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use scscf_hss_client::{HssError, HssProvider};
use scscf_reg_store::{notify, BindingEvent, ContactEvent, RegStore, SetOutcome, Subscription};
use scscf_sip_core::prelude::*;
use scscf_sproutlet_core::{RequestSender, Sproutlet, SproutletTsx, TsxHelper};

use crate::config::RegistrarConfig;
use crate::registrar::now_secs;

/// Claims SUBSCRIBE requests addressed to a home domain.
pub struct SubscriptionSproutlet {
    config: RegistrarConfig,
    store: Arc<RegStore>,
    hss: Arc<dyn HssProvider>,
    sender: Arc<dyn RequestSender>,
}

impl SubscriptionSproutlet {
    pub fn new(
        config: RegistrarConfig,
        store: Arc<RegStore>,
        hss: Arc<dyn HssProvider>,
        sender: Arc<dyn RequestSender>,
    ) -> Self {
        SubscriptionSproutlet {
            config,
            store,
            hss,
            sender,
        }
    }
}

impl Sproutlet for SubscriptionSproutlet {
    fn service_name(&self) -> &str {
        "subscription"
    }

    fn get_tsx(&self, _alias: &str, req: &Request) -> Option<Box<dyn SproutletTsx>> {
        if req.method != Method::Subscribe {
            return None;
        }
        if !self.config.is_local_host(&req.uri.host) {
            return None;
        }
        if !req.routes().map(|r| r.is_empty()).unwrap_or(false) {
            return None;
        }
        Some(Box::new(SubscriptionTsx {
            config: self.config.clone(),
            store: self.store.clone(),
            hss: self.hss.clone(),
            sender: self.sender.clone(),
        }))
    }
}

struct SubscriptionTsx {
    config: RegistrarConfig,
    store: Arc<RegStore>,
    hss: Arc<dyn HssProvider>,
    sender: Arc<dyn RequestSender>,
}

#[async_trait]
impl SproutletTsx for SubscriptionTsx {
    async fn on_rx_initial_request(&mut self, helper: &mut TsxHelper, req: Request) {
        // Only the reg event package lives here.
        let event = req
            .headers
            .first(&HeaderName::Event)
            .map(|e| e.split(';').next().unwrap_or("").trim().to_string())
            .unwrap_or_default();
        if !event.eq_ignore_ascii_case("reg") {
            helper.reject(StatusCode::BAD_EVENT, None);
            return;
        }

        let to = match req.to() {
            Some(to) if to.uri.is_sip() || to.uri.is_tel() => to,
            _ => {
                helper.reject(StatusCode::NOT_FOUND, None);
                return;
            }
        };
        let public_id = to.uri.canonical();

        let from = match req.from() {
            Some(f) => f,
            None => {
                helper.reject(StatusCode::BAD_REQUEST, None);
                return;
            }
        };
        let contact_uri = match req
            .contacts()
            .ok()
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.addr)
        {
            Some(addr) => addr.uri.to_string(),
            None => {
                helper.reject(StatusCode::BAD_REQUEST, None);
                return;
            }
        };

        // Resolve the canonical AoR for the watched identity.
        let aor = match self.hss.read(&public_id).await {
            Ok(data) => data.uris.first().cloned().unwrap_or(public_id.clone()),
            Err(HssError::NotFound) => {
                helper.reject(StatusCode::FORBIDDEN, None);
                return;
            }
            Err(e) => {
                warn!(public_id, error = %e, "HSS read failed for SUBSCRIBE");
                helper.reject(StatusCode::SERVER_TIMEOUT, None);
                return;
            }
        };

        let requested = req.expires().unwrap_or(self.config.default_sub_expires);
        let granted = requested.min(self.config.max_expires);
        let to_tag = to
            .tag()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let now = now_secs();

        let subscription = Subscription {
            from_uri: from.uri.to_string(),
            from_tag: from.tag().unwrap_or_default().to_string(),
            to_uri: to.uri.to_string(),
            to_tag: to_tag.clone(),
            req_uri: contact_uri,
            route_hdrs: req
                .record_routes()
                .unwrap_or_default()
                .iter()
                .map(|r| r.to_string())
                .collect(),
            cid: req.call_id().unwrap_or_default().to_string(),
            expires: now + granted as u64,
            timer_id: String::new(),
        };

        // Commit the subscription under the usual CAS loop.
        let record = loop {
            let mut record = match self.store.get_aor(&aor).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(aor, error = %e, "store read failed for SUBSCRIBE");
                    helper.reject(StatusCode::INTERNAL_SERVER_ERROR, None);
                    return;
                }
            };
            if granted == 0 {
                record.subscriptions.remove(&to_tag);
            } else {
                record
                    .subscriptions
                    .insert(to_tag.clone(), subscription.clone());
            }
            match self.store.set_aor(&aor, &mut record, false).await {
                Ok(SetOutcome::Written { .. }) => break record,
                Ok(SetOutcome::Contention) => continue,
                Err(e) => {
                    warn!(aor, error = %e, "store write failed for SUBSCRIBE");
                    helper.reject(StatusCode::INTERNAL_SERVER_ERROR, None);
                    return;
                }
            }
        };
        debug!(aor, watcher = subscription.from_uri, granted, "subscription updated");

        let mut rsp = helper.create_response(&req, StatusCode::OK, None);
        // The To tag is the subscription's dialog identity; make sure the
        // response carries the one we stored.
        let to_value = format!("{};tag={}", strip_tag(&to), to_tag);
        rsp.headers.set(HeaderName::To, to_value);
        rsp.headers.push(HeaderName::Expires, granted.to_string());
        rsp.headers.push(HeaderName::Event, "reg");
        helper.send_response(rsp);

        // Immediate full-state NOTIFY so the watcher has a baseline.
        if granted > 0 {
            let events: Vec<BindingEvent> = record
                .active_bindings(now)
                .map(|(id, b)| BindingEvent {
                    binding_id: id.clone(),
                    event: ContactEvent::Created,
                    contact_uri: b.uri.clone(),
                    expires: b.expires,
                })
                .collect();
            let notify = notify::build_notify(
                &aor,
                &record,
                &subscription,
                &events,
                now,
                notify::ReginfoState::Full,
            );
            self.sender.send_detached(notify);
        }
    }
}

/// The To header value without any tag parameter.
fn strip_tag(to: &NameAddr) -> String {
    let mut stripped = to.clone();
    stripped.params.retain(|p| !p.name.eq_ignore_ascii_case("tag"));
    stripped.to_string()
}

#[cfg(test)]
mod tests;
