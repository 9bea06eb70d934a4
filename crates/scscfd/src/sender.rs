//! Glue between construction-time dependency injection and the proxy that
//! only exists once every service is built.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use scscf_reg_store::NotifySink;
use scscf_sip_core::{Request, Response};
use scscf_sproutlet_core::{RequestSender, SproutletProxy, TransportError};

/// A `RequestSender` whose target proxy is bound after construction.
pub struct LateSender {
    proxy: RwLock<Option<Arc<SproutletProxy>>>,
}

impl LateSender {
    pub fn new() -> Self {
        LateSender {
            proxy: RwLock::new(None),
        }
    }

    pub fn bind(&self, proxy: Arc<SproutletProxy>) {
        *self.proxy.write() = Some(proxy);
    }

    fn proxy(&self) -> Option<Arc<SproutletProxy>> {
        self.proxy.read().clone()
    }
}

#[async_trait]
impl RequestSender for LateSender {
    async fn send_request(
        &self,
        req: Request,
        timeout: Duration,
    ) -> std::result::Result<Response, TransportError> {
        match self.proxy() {
            Some(proxy) => proxy.send_standalone(req, timeout).await,
            None => Err(TransportError::Send("proxy not started".to_string())),
        }
    }

    fn send_detached(&self, req: Request) {
        match self.proxy() {
            Some(proxy) => proxy.send_detached(req),
            None => warn!("dropping request sent before proxy start"),
        }
    }
}

/// NOTIFY delivery for the registration store, via the late-bound sender.
pub struct ProxyNotifySink {
    sender: Arc<LateSender>,
}

impl ProxyNotifySink {
    pub fn new(sender: Arc<LateSender>) -> Self {
        ProxyNotifySink { sender }
    }
}

#[async_trait]
impl NotifySink for ProxyNotifySink {
    async fn send_notify(&self, notify: Request) {
        self.sender.send_detached(notify);
    }
}
