//! The REGISTER handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use scscf_hss_client::{HssError, HssProvider, Ifcs, RegOp, RegistrationData, RegistrationState};
use scscf_reg_store::{AoR, ContactEvent, RegStore, SetOutcome, StoreError};
use scscf_sip_core::prelude::*;
use scscf_sproutlet_core::{RequestSender, Sproutlet, SproutletTsx, TsxHelper};

use crate::config::RegistrarConfig;
use crate::third_party;

/// The registrar service: claims REGISTER requests addressed to a home
/// domain (or this node) with no remaining Route headers.
pub struct RegistrarSproutlet {
    config: RegistrarConfig,
    store: Arc<RegStore>,
    remote_store: Option<Arc<RegStore>>,
    hss: Arc<dyn HssProvider>,
    sender: Arc<dyn RequestSender>,
}

impl RegistrarSproutlet {
    pub fn new(
        config: RegistrarConfig,
        store: Arc<RegStore>,
        remote_store: Option<Arc<RegStore>>,
        hss: Arc<dyn HssProvider>,
        sender: Arc<dyn RequestSender>,
    ) -> Self {
        RegistrarSproutlet {
            config,
            store,
            remote_store,
            hss,
            sender,
        }
    }
}

impl Sproutlet for RegistrarSproutlet {
    fn service_name(&self) -> &str {
        "registrar"
    }

    fn get_tsx(&self, _alias: &str, req: &Request) -> Option<Box<dyn SproutletTsx>> {
        if req.method != Method::Register {
            return None;
        }
        if !self.config.is_local_host(&req.uri.host) {
            return None;
        }
        // Route scope check: any remaining Route means the request is only
        // transiting this node.
        if !req.routes().map(|r| r.is_empty()).unwrap_or(false) {
            return None;
        }
        Some(Box::new(RegistrarTsx {
            config: self.config.clone(),
            store: self.store.clone(),
            remote_store: self.remote_store.clone(),
            hss: self.hss.clone(),
            sender: self.sender.clone(),
        }))
    }
}

struct RegistrarTsx {
    config: RegistrarConfig,
    store: Arc<RegStore>,
    remote_store: Option<Arc<RegStore>>,
    hss: Arc<dyn HssProvider>,
    sender: Arc<dyn RequestSender>,
}

#[async_trait]
impl SproutletTsx for RegistrarTsx {
    async fn on_rx_initial_request(&mut self, helper: &mut TsxHelper, req: Request) {
        let to = match req.to() {
            Some(to) if to.uri.is_sip() || to.uri.is_tel() => to,
            _ => {
                debug!("rejecting REGISTER with non-SIP/TEL To URI");
                helper.reject(StatusCode::NOT_FOUND, None);
                return;
            }
        };
        let public_id = to.uri.canonical();

        let contacts = match req.contacts() {
            Ok(c) => c,
            Err(e) => {
                debug!(public_id, error = %e, "rejecting REGISTER with malformed Contact");
                helper.reject(StatusCode::BAD_REQUEST, None);
                return;
            }
        };

        // Contact examination: a wildcard is only valid with expiry 0, and
        // a REGISTER that only de-registers emergency bindings is refused.
        let expires_hdr = req.expires();
        let mut only_expiring_emergencies = !contacts.is_empty();
        let mut any_emergency = false;
        for contact in &contacts {
            let expiry = effective_expiry(contact, expires_hdr, self.config.max_expires);
            if contact.is_wildcard() && expiry != 0 {
                debug!(public_id, "wildcard Contact with non-zero expiry");
                helper.reject(StatusCode::BAD_REQUEST, None);
                return;
            }
            any_emergency |= contact.is_emergency();
            only_expiring_emergencies &= contact.is_emergency() && expiry == 0;
        }
        if only_expiring_emergencies {
            info!(public_id, "refusing de-registration of emergency bindings");
            helper.reject(StatusCode::NOT_IMPLEMENTED, None);
            return;
        }
        if any_emergency && !self.config.allow_emergency {
            helper.reject(StatusCode::NOT_IMPLEMENTED, None);
            return;
        }

        // Private identity: Digest username if offered, else derived from
        // the To URI.
        let auth_private_id = digest_username(&req);
        let private_id_for_binding = auth_private_id
            .clone()
            .unwrap_or_else(|| default_private_id(&public_id));
        let private_id_for_hss = auth_private_id.unwrap_or_default();

        let max_requested = contacts
            .iter()
            .map(|c| effective_expiry(c, expires_hdr, self.config.max_expires))
            .max()
            .unwrap_or(self.config.max_expires);

        // Assert the registration at the HSS; this also fetches the
        // subscription profile.
        let hss_data = match self
            .hss
            .update_registration_state(
                &public_id,
                &private_id_for_hss,
                RegOp::Register,
                max_requested,
            )
            .await
        {
            Ok(data) if data.state == RegistrationState::Registered => data,
            Ok(_) => {
                warn!(public_id, "HSS did not assert registration");
                helper.reject(StatusCode::SERVER_TIMEOUT, None);
                return;
            }
            Err(HssError::NotFound) => {
                info!(public_id, "HSS does not know this public identity");
                helper.reject(StatusCode::FORBIDDEN, None);
                return;
            }
            Err(e) => {
                warn!(public_id, error = %e, "HSS registration update failed");
                helper.reject(StatusCode::SERVER_TIMEOUT, None);
                return;
            }
        };

        // The canonical AoR is the first associated URI.
        let aor = match hss_data.uris.first() {
            Some(aor) => aor.clone(),
            None => {
                warn!(public_id, "HSS returned no associated URIs");
                helper.reject(StatusCode::SERVER_TIMEOUT, None);
                return;
            }
        };
        debug!(public_id, aor, "processing REGISTER");

        // A wildcard de-registration cannot touch emergency bindings; when
        // the record holds nothing else there is nothing it may remove.
        if contacts.iter().any(|c| c.is_wildcard()) {
            if let Ok(record) = self.store.get_aor(&aor).await {
                let now = now_secs();
                let has_bindings = record.active_bindings(now).next().is_some();
                let all_emergency = record.active_bindings(now).all(|(_, b)| b.emergency);
                if has_bindings && all_emergency {
                    info!(aor, "wildcard de-registration against emergency-only record");
                    helper.reject(StatusCode::NOT_IMPLEMENTED, None);
                    return;
                }
            }
        }

        // Local write, then a best-effort replica write.
        let record = match write_to_store(
            &self.store,
            &aor,
            &req,
            &contacts,
            &private_id_for_binding,
            self.config.max_expires,
            true,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(aor, error = %e, "registration store write failed");
                helper.reject(StatusCode::INTERNAL_SERVER_ERROR, None);
                return;
            }
        };

        if let Some(remote) = &self.remote_store {
            if let Err(e) = write_to_store(
                remote,
                &aor,
                &req,
                &contacts,
                &private_id_for_binding,
                self.config.max_expires,
                false,
            )
            .await
            {
                warn!(aor, error = %e, "replica store write failed");
            }
        }

        if record.all_expired {
            debug!(aor, "all bindings expired; releasing HSS registration state");
            if let Err(e) = self
                .hss
                .update_registration_state(&aor, "", RegOp::DeregUser, 0)
                .await
            {
                warn!(aor, error = %e, "HSS de-registration failed");
            }
        }

        let rsp = build_ok_response(
            helper,
            &req,
            &aor,
            &record.record,
            record.now,
            &hss_data,
            &self.config,
        );
        helper.send_response(rsp.clone());

        // Third-party REGISTERs never fire for emergency registrations.
        if !any_emergency {
            let ifcs = hss_data
                .ifcs_by_public
                .get(&public_id)
                .cloned()
                .unwrap_or_else(Ifcs::default);
            third_party::spawn_third_party_registers(
                self.sender.clone(),
                self.store.clone(),
                self.hss.clone(),
                self.config.clone(),
                ifcs,
                req,
                rsp,
                public_id,
                max_requested,
            );
        }
    }
}

pub(crate) struct WriteOutcome {
    pub record: AoR,
    pub all_expired: bool,
    /// The clock instant the committed write used; expiry arithmetic in the
    /// response must use the same one.
    pub now: u64,
}

/// The optimistic write loop: read, apply every contact, write under CAS,
/// retry on contention.
pub(crate) async fn write_to_store(
    store: &RegStore,
    aor: &str,
    req: &Request,
    contacts: &[Contact],
    private_id: &str,
    max_expires: u32,
    send_notify: bool,
) -> std::result::Result<WriteOutcome, StoreError> {
    let cid = req.call_id().unwrap_or_default().to_string();
    let cseq = req.cseq().map(|c| c.seq).unwrap_or(0);
    let expires_hdr = req.expires();
    let path_headers = req
        .paths()
        .unwrap_or_default()
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>();

    loop {
        let mut record = store.get_aor(aor).await?;
        let now = now_secs();

        for contact in contacts {
            let expiry = effective_expiry(contact, expires_hdr, max_expires) as u64;

            if contact.is_wildcard() {
                record.clear_non_emergency();
                break;
            }
            let addr = match &contact.addr {
                Some(addr) if addr.uri.is_sip() => addr,
                _ => continue,
            };
            let contact_uri = addr.uri.to_string();
            let id = binding_id(contact);

            // Apply only when this is a new call or a newer CSeq; an older
            // CSeq on the same Call-ID is a stale retransmission.
            let (is_new_call, is_update) = match record.get_binding(&id) {
                Some(binding) => {
                    let new_call = binding.cid != cid;
                    (new_call, new_call || cseq > binding.cseq)
                }
                None => (true, true),
            };
            if !is_update {
                debug!(aor, binding = id, "stale REGISTER retransmission ignored");
                continue;
            }

            if expiry == 0 {
                record.remove_binding(&id, ContactEvent::Unregistered);
                continue;
            }

            {
                let binding = record.get_or_create_binding(&id);
                binding.uri = contact_uri;
                binding.path_headers = path_headers.clone();
                binding.cid = cid.clone();
                binding.cseq = cseq;
                binding.priority = contact.q1000();
                binding.params = contact
                    .params
                    .iter()
                    .filter(|p| !p.name.eq_ignore_ascii_case("pub-gruu"))
                    .map(|p| (p.name.clone(), p.value.clone().unwrap_or_default()))
                    .collect();
                binding.private_id = private_id.to_string();
                let was_emergency = binding.emergency;
                binding.emergency = contact.is_emergency();

                let new_expiry = now + expiry;
                if was_emergency && binding.expires > new_expiry {
                    debug!(aor, binding = id, "not shortening an emergency registration");
                } else {
                    binding.expires = new_expiry;
                }
            }
            record.note_binding_event(
                &id,
                if is_new_call {
                    ContactEvent::Created
                } else {
                    ContactEvent::Refreshed
                },
            );
        }

        match store.set_aor(aor, &mut record, send_notify).await? {
            SetOutcome::Written {
                all_bindings_expired,
            } => {
                return Ok(WriteOutcome {
                    record,
                    all_expired: all_bindings_expired,
                    now,
                })
            }
            SetOutcome::Contention => continue,
        }
    }
}

fn build_ok_response(
    helper: &TsxHelper,
    req: &Request,
    aor: &str,
    record: &AoR,
    now: u64,
    hss_data: &RegistrationData,
    config: &RegistrarConfig,
) -> Response {
    let mut rsp = helper.create_response(req, StatusCode::OK, None);

    rsp.headers.push(HeaderName::Supported, "outbound");

    let wants_gruu = req.supports("gruu");
    let mut any_binding_with_path = false;
    for (_, binding) in record.active_bindings(now) {
        let mut value = format!("<{}>", binding.uri);
        if binding.priority != 1000 {
            let q = binding.priority;
            if q % 1000 == 0 {
                value.push_str(&format!(";q={}", q / 1000));
            } else {
                let frac = format!("{:03}", q % 1000);
                value.push_str(&format!(";q={}.{}", q / 1000, frac.trim_end_matches('0')));
            }
        }
        value.push_str(&format!(";expires={}", binding.expires - now));
        for (name, param_value) in &binding.params {
            if param_value.is_empty() {
                value.push_str(&format!(";{}", name));
            } else {
                value.push_str(&format!(";{}={}", name, param_value));
            }
        }
        if wants_gruu {
            if let Some(instance) = binding.instance_id() {
                value.push_str(&format!(";pub-gruu={}", pub_gruu(aor, instance)));
            }
        }
        rsp.headers.push(HeaderName::Contact, value);
        any_binding_with_path |= !binding.path_headers.is_empty();
    }

    // Echo Path per RFC 3327, and require outbound processing when a
    // binding depends on a flow through an edge proxy.
    if any_binding_with_path {
        rsp.headers.push(HeaderName::Require, "outbound");
    }
    for path in req.headers.all(&HeaderName::Path) {
        rsp.headers.push(HeaderName::Path, path.to_string());
    }

    rsp.headers.push(
        HeaderName::ServiceRoute,
        format!("<{};lr;orig>", config.scscf_uri),
    );

    for uri in &hss_data.uris {
        rsp.headers
            .push(HeaderName::PAssociatedUri, format!("<{}>", uri));
    }

    let pcfa = PChargingFunctionAddresses::new(hss_data.ccfs.clone(), hss_data.ecfs.clone());
    if !pcfa.is_empty() {
        rsp.headers
            .push(HeaderName::PChargingFunctionAddresses, pcfa.to_string());
    }

    rsp
}

/// Binding identifier: the `+sip.instance` value (with `reg-id` appended
/// when present), else the contact URI; emergency registrations carry the
/// `sos` prefix.
pub(crate) fn binding_id(contact: &Contact) -> String {
    let base = match contact.instance_id() {
        Some(instance) if !instance.is_empty() => match contact.reg_id() {
            Some(reg_id) => format!("{}:{}", instance, reg_id),
            None => instance.to_string(),
        },
        _ => contact
            .addr
            .as_ref()
            .map(|a| a.uri.to_string())
            .unwrap_or_default(),
    };
    if contact.is_emergency() {
        format!("sos{}", base)
    } else {
        base
    }
}

/// Per-contact expiry: the contact's own parameter, else the Expires
/// header, else the maximum; clamped to the maximum.
pub(crate) fn effective_expiry(contact: &Contact, expires_hdr: Option<u32>, max: u32) -> u32 {
    contact.expires.or(expires_hdr).unwrap_or(max).min(max)
}

/// Digest username from the Authorization header, when usable.
pub(crate) fn digest_username(req: &Request) -> Option<String> {
    let value = req.headers.first(&HeaderName::Authorization)?;
    let rest = value.trim().strip_prefix("Digest")?;
    for part in scscf_sip_core::types::param::split_quoted(rest, ',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("username=") {
            let v = v.trim().trim_matches('"');
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// Default private identity: the public identity with its scheme stripped.
pub(crate) fn default_private_id(public_id: &str) -> String {
    public_id
        .strip_prefix("sip:")
        .or_else(|| public_id.strip_prefix("sips:"))
        .or_else(|| public_id.strip_prefix("tel:"))
        .unwrap_or(public_id)
        .to_string()
}

fn pub_gruu(aor: &str, instance: &str) -> String {
    let bare = instance.trim_start_matches('<').trim_end_matches('>');
    let escaped = bare.replace('%', "%25").replace(':', "%3A");
    format!("\"{};gr={}\"", aor, escaped)
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests;
