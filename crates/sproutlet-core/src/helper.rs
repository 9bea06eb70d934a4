//! The per-transaction helper: the borrowed handle a sproutlet uses to act
//! on its transaction.
//!
//! Calls record actions; the owning transaction task applies them when the
//! callback returns.  This keeps the sproutlet free of proxy internals and
//! makes the exactly-one-action contract checkable in one place.

use std::time::Duration;

use scscf_sip_core::{NameAddr, Request, Response, StatusCode};

/// Handle for a timer started through the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// An action recorded by the sproutlet during one callback.
#[derive(Debug)]
pub(crate) enum Action {
    SendRequest { fork_id: u32, req: Request },
    SendResponse { rsp: Response },
    CancelFork { fork_id: u32 },
    StartTimer { id: TimerId, delay: Duration, context: u64 },
    CancelTimer { id: TimerId },
}

/// The helper owned by the transaction task and lent to the sproutlet for
/// the duration of each callback.
pub struct TsxHelper {
    service_name: String,
    home_domain: String,
    trail: u64,
    original_req: Request,
    /// The Route entry this request was dispatched on, already popped.
    dispatched_route: Option<NameAddr>,
    dialog_id: Option<String>,
    record_route_requested: bool,
    next_fork_id: u32,
    next_timer_id: u64,
    pub(crate) actions: Vec<Action>,
}

impl TsxHelper {
    /// Constructed by the proxy per transaction; public so sproutlet crates
    /// can drive handlers directly in tests.
    pub fn new(
        service_name: String,
        home_domain: String,
        trail: u64,
        original_req: Request,
        dispatched_route: Option<NameAddr>,
        dialog_id: Option<String>,
    ) -> Self {
        TsxHelper {
            service_name,
            home_domain,
            trail,
            original_req,
            dispatched_route,
            dialog_id,
            record_route_requested: false,
            next_fork_id: 0,
            next_timer_id: 0,
            actions: Vec::new(),
        }
    }

    /// Diagnostics correlation id for this transaction.
    pub fn trail(&self) -> u64 {
        self.trail
    }

    /// The received request, untouched.
    pub fn original_request(&self) -> &Request {
        &self.original_req
    }

    /// The Route header entry that carried this request to the sproutlet,
    /// if it arrived on one.  Already removed from the request.
    pub fn dispatched_route(&self) -> Option<&NameAddr> {
        self.dispatched_route.as_ref()
    }

    /// Deep-copy a request for independent modification (forking).
    pub fn clone_request(&self, req: &Request) -> Request {
        req.clone()
    }

    /// Synthesize a response bound to `req`.
    pub fn create_response(
        &self,
        req: &Request,
        status: StatusCode,
        reason: Option<&str>,
    ) -> Response {
        Response::for_request(req, status, reason)
    }

    /// Forward a request downstream.  May be called repeatedly to fork.
    /// Returns the fork id used to correlate responses.
    pub fn send_request(&mut self, req: Request) -> u32 {
        let fork_id = self.next_fork_id;
        self.next_fork_id += 1;
        self.actions.push(Action::SendRequest { fork_id, req });
        fork_id
    }

    /// Forward a response upstream.  Final responses across forks are
    /// aggregated by the proxy.
    pub fn send_response(&mut self, rsp: Response) {
        self.actions.push(Action::SendResponse { rsp });
    }

    /// Reject the original request.
    pub fn reject(&mut self, status: StatusCode, reason: Option<&str>) {
        let rsp = Response::for_request(&self.original_req, status, reason);
        self.send_response(rsp);
    }

    /// CANCEL an outstanding fork that has not yet answered finally.
    pub fn cancel_fork(&mut self, fork_id: u32) {
        self.actions.push(Action::CancelFork { fork_id });
    }

    /// Join the dialog: ask the proxy to Record-Route this sproutlet with
    /// the given dialog identifier (or a generated one).
    pub fn add_to_dialog(&mut self, dialog_id: Option<String>) {
        self.record_route_requested = true;
        if dialog_id.is_some() {
            self.dialog_id = dialog_id;
        } else if self.dialog_id.is_none() {
            self.dialog_id = Some(format!("{:016x}", rand_dialog_id(&self.original_req)));
        }
    }

    /// The dialog identifier attached to this sproutlet, set either here
    /// or by an earlier transaction in the same dialog.
    pub fn dialog_id(&self) -> Option<&str> {
        self.dialog_id.as_deref()
    }

    pub(crate) fn record_route_requested(&self) -> bool {
        self.record_route_requested
    }

    /// The Record-Route entry for this sproutlet, carrying the dialog id.
    pub(crate) fn record_route_entry(&self) -> NameAddr {
        let mut uri = scscf_sip_core::types::Uri::sip_host(&format!(
            "{}.{}",
            self.service_name, self.home_domain
        ));
        uri.set_param("lr", None);
        if let Some(dlg) = &self.dialog_id {
            uri.set_param("dlg", Some(dlg));
        }
        NameAddr::new(uri)
    }

    /// Start a transaction-scoped timer.  Expiry is delivered to
    /// `on_timer_expiry` with `context`.
    pub fn start_timer(&mut self, delay: Duration, context: u64) -> TimerId {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        self.actions.push(Action::StartTimer { id, delay, context });
        id
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.actions.push(Action::CancelTimer { id });
    }

    pub(crate) fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

/// Default dialog id: a stable hash of the dialog-identifying headers.
fn rand_dialog_id(req: &Request) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    req.call_id().hash(&mut hasher);
    req.from().and_then(|f| f.tag().map(str::to_string)).hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scscf_sip_core::prelude::*;

    fn helper() -> TsxHelper {
        let mut req = Request::new(Method::Invite, Uri::sip("bob", "example.com"));
        req.headers.push(HeaderName::CallId, "cid");
        req.headers.push(HeaderName::From, "<sip:a@x>;tag=1");
        TsxHelper::new(
            "scscf".to_string(),
            "example.com".to_string(),
            9,
            req,
            None,
            None,
        )
    }

    #[test]
    fn fork_ids_are_monotonic() {
        let mut h = helper();
        let req = h.original_request().clone();
        assert_eq!(h.send_request(h.clone_request(&req)), 0);
        assert_eq!(h.send_request(h.clone_request(&req)), 1);
        assert_eq!(h.send_request(req), 2);
    }

    #[test]
    fn add_to_dialog_generates_an_id() {
        let mut h = helper();
        h.add_to_dialog(None);
        assert!(h.dialog_id().is_some());
        let rr = h.record_route_entry();
        assert_eq!(rr.uri.host, "scscf.example.com");
        assert!(rr.uri.has_param("lr"));
        assert!(rr.uri.has_param("dlg"));
    }

    #[test]
    fn explicit_dialog_id_wins() {
        let mut h = helper();
        h.add_to_dialog(Some("billing-orig".to_string()));
        assert_eq!(h.dialog_id(), Some("billing-orig"));
    }
}
