//! Third-party REGISTER fan-out: after a successful registration, every
//! matching REGISTER-time iFC gets its own REGISTER to the named
//! application server.  A failure against an iFC whose default handling is
//! session-terminated de-registers the public identity (TS 24.229
//! 5.4.1.7).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use scscf_as_chain::{ifc_match, SessionCase};
use scscf_hss_client::{DefaultHandling, HssProvider, Ifcs};
use scscf_reg_store::RegStore;
use scscf_sip_core::prelude::*;
use scscf_sproutlet_core::RequestSender;

use crate::config::RegistrarConfig;
use crate::service;

const THIRD_PARTY_TIMEOUT: Duration = Duration::from_secs(10);

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_third_party_registers(
    sender: Arc<dyn RequestSender>,
    store: Arc<RegStore>,
    hss: Arc<dyn HssProvider>,
    config: RegistrarConfig,
    ifcs: Ifcs,
    original_req: Request,
    final_rsp: Response,
    public_id: String,
    expiry: u32,
) {
    let matched: Vec<_> = ifcs
        .iter()
        .filter(|ifc| {
            ifc_match::ifc_matches(ifc, &original_req, SessionCase::Originating, true)
        })
        .cloned()
        .collect();
    if matched.is_empty() {
        return;
    }

    tokio::spawn(async move {
        for ifc in matched {
            let server = &ifc.app_server;
            let req = match build_third_party_register(
                &config,
                server.server_name.as_str(),
                &public_id,
                expiry,
                server.include_register_request.then_some(&original_req),
                server.include_register_response.then_some(&final_rsp),
                server.service_info.as_deref(),
            ) {
                Some(r) => r,
                None => {
                    warn!(
                        server = server.server_name,
                        "skipping third-party REGISTER to unparseable server URI"
                    );
                    continue;
                }
            };

            debug!(
                server = server.server_name,
                public_id, "sending third-party REGISTER"
            );
            let failed = match sender.send_request(req, THIRD_PARTY_TIMEOUT).await {
                Ok(rsp) if rsp.status.is_success() => false,
                Ok(rsp) => {
                    warn!(
                        server = server.server_name,
                        status = rsp.status.as_u16(),
                        "third-party REGISTER rejected"
                    );
                    true
                }
                Err(e) => {
                    warn!(
                        server = server.server_name,
                        error = %e,
                        "third-party REGISTER failed"
                    );
                    true
                }
            };

            if failed && server.default_handling == DefaultHandling::SessionTerminated {
                warn!(
                    public_id,
                    server = server.server_name,
                    "session-terminated iFC failed; de-registering"
                );
                service::administrative_deregister(&store, hss.as_ref(), &public_id).await;
            }
        }
    });
}

/// Build the REGISTER sent to one application server.  The node itself is
/// the contact, and the original REGISTER (and its 200) ride along as a
/// multipart body when the iFC asks for them.
fn build_third_party_register(
    config: &RegistrarConfig,
    server_uri: &str,
    public_id: &str,
    expiry: u32,
    original_req: Option<&Request>,
    final_rsp: Option<&Response>,
    service_info: Option<&str>,
) -> Option<Request> {
    let uri: Uri = server_uri.parse().ok()?;
    let mut req = Request::new(Method::Register, uri);
    req.headers
        .push(HeaderName::From, format!("<{}>;tag={}", config.scscf_uri, Uuid::new_v4().simple()));
    req.headers.push(HeaderName::To, format!("<{}>", public_id));
    req.headers
        .push(HeaderName::CallId, Uuid::new_v4().to_string());
    req.headers.push(
        HeaderName::CSeq,
        CSeq::new(1, Method::Register).to_string(),
    );
    req.headers.push(HeaderName::MaxForwards, "70");
    req.headers
        .push(HeaderName::Contact, format!("<{}>", config.scscf_uri));
    req.headers.push(HeaderName::Expires, expiry.to_string());

    let mut parts: Vec<(String, Vec<u8>)> = Vec::new();
    if let Some(original) = original_req {
        parts.push(("message/sip".to_string(), original.to_bytes()));
    }
    if let Some(rsp) = final_rsp {
        parts.push(("message/sip".to_string(), rsp.to_bytes()));
    }
    if let Some(info) = service_info {
        parts.push((
            "application/xml".to_string(),
            format!("<ims-3gpp><service-info>{}</service-info></ims-3gpp>", info).into_bytes(),
        ));
    }

    match parts.len() {
        0 => {}
        1 => {
            let (content_type, body) = parts.into_iter().next().unwrap_or_default();
            req.headers.push(HeaderName::ContentType, content_type);
            req.body = body;
        }
        _ => {
            let boundary = format!("boundary-{}", Uuid::new_v4().simple());
            let mut body = Vec::new();
            for (content_type, part) in &parts {
                body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
                body.extend_from_slice(
                    format!("Content-Type: {}\r\n\r\n", content_type).as_bytes(),
                );
                body.extend_from_slice(part);
                body.extend_from_slice(b"\r\n");
            }
            body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
            req.headers.push(
                HeaderName::ContentType,
                format!("multipart/mixed;boundary={}", boundary),
            );
            req.body = body;
        }
    }

    Some(req)
}
