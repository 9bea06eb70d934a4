//! Shared test collaborators: a scripted HSS, a recording request sender
//! and store construction helpers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use scscf_hss_client::{
    HssError, HssProvider, Ifcs, RegOp, RegistrationData, RegistrationState, SubscriberData,
};
use scscf_reg_store::{MemoryKvStore, NoopTimerService, NotifySink, RegStore};
use scscf_sip_core::prelude::*;
use scscf_sproutlet_core::{RequestSender, TransportError};

/// Scripted HSS: registered by default, associated URIs defaulting to the
/// queried identity, optional forced failure.
pub(crate) struct FakeHss {
    pub state: RegistrationState,
    pub uris: Vec<String>,
    pub ifcs: Ifcs,
    pub fail_not_found: bool,
    pub fail_server: bool,
    pub calls: Mutex<Vec<(String, RegOp)>>,
}

impl Default for FakeHss {
    fn default() -> Self {
        FakeHss {
            state: RegistrationState::Registered,
            uris: Vec::new(),
            ifcs: Ifcs::default(),
            fail_not_found: false,
            fail_server: false,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeHss {
    pub fn registered() -> Arc<Self> {
        Arc::new(FakeHss::default())
    }

    pub fn with_ifcs(ifcs: Ifcs) -> Arc<Self> {
        Arc::new(FakeHss {
            ifcs,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<(String, RegOp)> {
        self.calls.lock().clone()
    }

    fn uris_for(&self, public_id: &str) -> Vec<String> {
        if self.uris.is_empty() {
            vec![public_id.to_string()]
        } else {
            self.uris.clone()
        }
    }
}

#[async_trait]
impl HssProvider for FakeHss {
    async fn update_registration_state(
        &self,
        public_id: &str,
        _private_id: &str,
        op: RegOp,
        _expires: u32,
    ) -> std::result::Result<RegistrationData, HssError> {
        self.calls.lock().push((public_id.to_string(), op));
        if self.fail_not_found {
            return Err(HssError::NotFound);
        }
        if self.fail_server {
            return Err(HssError::Http(500));
        }
        let uris = self.uris_for(public_id);
        let mut ifcs_by_public = HashMap::new();
        for uri in &uris {
            ifcs_by_public.insert(uri.clone(), self.ifcs.clone());
        }
        Ok(RegistrationData {
            state: self.state,
            ifcs_by_public,
            uris,
            ccfs: vec!["ccf1.example.com".to_string()],
            ecfs: Vec::new(),
        })
    }

    async fn read(&self, public_id: &str) -> std::result::Result<SubscriberData, HssError> {
        if self.fail_not_found {
            return Err(HssError::NotFound);
        }
        if self.fail_server {
            return Err(HssError::Http(500));
        }
        let uris = self.uris_for(public_id);
        Ok(SubscriberData {
            aliases: uris.clone(),
            uris,
            ifcs: self.ifcs.clone(),
            ccfs: Vec::new(),
            ecfs: Vec::new(),
            registered: self.state == RegistrationState::Registered,
        })
    }
}

/// Records standalone requests and answers them with a fixed status.
pub(crate) struct FakeSender {
    pub requests: Mutex<Vec<Request>>,
    pub detached: Mutex<Vec<Request>>,
    pub response_status: Mutex<StatusCode>,
}

impl FakeSender {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeSender {
            requests: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
            response_status: Mutex::new(StatusCode::OK),
        })
    }

    pub fn answer_with(&self, status: StatusCode) {
        *self.response_status.lock() = status;
    }

    pub async fn wait_for_requests(&self, count: usize) -> Vec<Request> {
        for _ in 0..100 {
            if self.requests.lock().len() >= count {
                return self.requests.lock().clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RequestSender for FakeSender {
    async fn send_request(
        &self,
        req: Request,
        _timeout: Duration,
    ) -> std::result::Result<Response, TransportError> {
        let status = *self.response_status.lock();
        let rsp = Response::for_request(&req, status, None);
        self.requests.lock().push(req);
        Ok(rsp)
    }

    fn send_detached(&self, req: Request) {
        self.detached.lock().push(req);
    }
}

pub(crate) struct NullSink;

#[async_trait]
impl NotifySink for NullSink {
    async fn send_notify(&self, _notify: Request) {}
}

pub(crate) fn memory_store() -> Arc<RegStore> {
    Arc::new(RegStore::new(
        Arc::new(MemoryKvStore::new()),
        Arc::new(NoopTimerService),
        Arc::new(NullSink),
    ))
}

/// A REGISTER in the shape the tests need.
pub(crate) fn register_request(
    public: &str,
    contact: &str,
    expires: u32,
    call_id: &str,
    cseq: u32,
) -> Request {
    let mut req = Request::new(Method::Register, "sip:example.com".parse().unwrap());
    req.headers.push(
        HeaderName::Via,
        format!("SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK{}{}", call_id, cseq),
    );
    req.headers.push(HeaderName::MaxForwards, "70");
    req.headers.push(HeaderName::To, format!("<{}>", public));
    req.headers
        .push(HeaderName::From, format!("<{}>;tag=fromtag", public));
    req.headers.push(HeaderName::CallId, call_id.to_string());
    req.headers
        .push(HeaderName::CSeq, format!("{} REGISTER", cseq));
    req.headers.push(HeaderName::Contact, contact.to_string());
    req.headers.push(HeaderName::Expires, expires.to_string());
    req
}
