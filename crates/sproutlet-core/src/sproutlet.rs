//! The sproutlet traits: what a pluggable SIP service implements.

use async_trait::async_trait;

use scscf_sip_core::{Request, Response, StatusCode};

use crate::helper::TsxHelper;

/// A named SIP service registered with the proxy at startup.
///
/// A request targets a sproutlet when the host of its top Route (or, with
/// no Route, its Request-URI) is `<service_name>.<home-domain>` or one of
/// the sproutlet's aliases.  Requests addressed to the node itself are
/// offered to each sproutlet in registration order; the first to return a
/// transaction handler takes the request.
pub trait Sproutlet: Send + Sync {
    fn service_name(&self) -> &str;

    /// Extra hostnames this sproutlet answers to.
    fn aliases(&self) -> Vec<String> {
        Vec::new()
    }

    /// Offer a request.  Return `None` to decline, or the per-transaction
    /// handler to take it.
    fn get_tsx(&self, alias: &str, req: &Request) -> Option<Box<dyn SproutletTsx>>;
}

/// Per-transaction handler.
///
/// For every delivered request (initial, in-dialog or cancel) exactly one
/// of `send_request` (possibly several times, forking) or a final
/// `send_response` must happen on the helper before the callback returns,
/// otherwise the proxy answers 503 on the handler's behalf.
#[async_trait]
pub trait SproutletTsx: Send {
    /// An initial (dialog-initiating or out-of-dialog) request.
    async fn on_rx_initial_request(&mut self, helper: &mut TsxHelper, req: Request) {
        helper.send_request(req);
    }

    /// A request within a dialog this sproutlet record-routed itself into.
    async fn on_rx_in_dialog_request(&mut self, helper: &mut TsxHelper, req: Request) {
        helper.send_request(req);
    }

    /// A response on a fork.  Transport errors and fork timeouts surface
    /// here as a synthetic 408/503.
    async fn on_rx_response(&mut self, helper: &mut TsxHelper, rsp: Response, fork_id: u32) {
        let _ = fork_id;
        helper.send_response(rsp);
    }

    /// The inbound transaction was cancelled (487) or failed (408).
    /// Delivered exactly once; no further callbacks follow.  Outstanding
    /// forks are cancelled by the proxy afterwards.
    async fn on_rx_cancel(&mut self, helper: &mut TsxHelper, status: StatusCode, req: Option<Request>) {
        let _ = (helper, status, req);
    }

    /// A timer started through the helper popped.
    async fn on_timer_expiry(&mut self, helper: &mut TsxHelper, context: u64) {
        let _ = (helper, context);
    }
}
