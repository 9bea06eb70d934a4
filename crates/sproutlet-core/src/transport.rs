//! The transport seam: message sending, with a UDP implementation for
//! production and a channel-backed one for tests.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use scscf_sip_core::SipMessage;

use crate::error::TransportError;

/// Message sender.  Receiving is owned by whoever owns the socket; received
/// messages are fed to the proxy's `handle_message`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, msg: SipMessage, dest: SocketAddr) -> Result<(), TransportError>;

    fn local_addr(&self) -> SocketAddr;
}

/// Seam for services that originate their own client transactions
/// (third-party REGISTERs, NOTIFYs).  Implemented by the proxy.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Send a standalone request and wait for its final response.
    async fn send_request(
        &self,
        req: scscf_sip_core::Request,
        timeout: std::time::Duration,
    ) -> Result<scscf_sip_core::Response, TransportError>;

    /// Fire-and-forget send.
    fn send_detached(&self, req: scscf_sip_core::Request);
}

/// UDP transport over one bound socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Arc::new(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
        }))
    }

    /// Run the receive loop, pushing parsed messages into `tx` until the
    /// receiver goes away.  Unparseable datagrams are dropped.
    pub async fn run_rx_loop(&self, tx: mpsc::Sender<(SipMessage, SocketAddr)>) {
        let mut buf = vec![0u8; 65_535];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    continue;
                }
            };
            let text = match std::str::from_utf8(&buf[..len]) {
                Ok(t) => t,
                Err(_) => {
                    debug!(src = %src, "dropping non-UTF8 datagram");
                    continue;
                }
            };
            match SipMessage::parse(text) {
                Ok(msg) => {
                    if tx.send((msg, src)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(src = %src, error = %e, "dropping unparseable datagram");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, msg: SipMessage, dest: SocketAddr) -> Result<(), TransportError> {
        self.socket
            .send_to(&msg.to_bytes(), dest)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Test transport: records everything sent and can simulate send failure.
pub struct TestTransport {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SipMessage, SocketAddr)>>,
    notify: mpsc::UnboundedSender<(SipMessage, SocketAddr)>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<(SipMessage, SocketAddr)>>>,
    fail_sends: Mutex<bool>,
}

impl TestTransport {
    pub fn new() -> Arc<Self> {
        let (notify, rx) = mpsc::unbounded_channel();
        Arc::new(TestTransport {
            local_addr: "127.0.0.1:5054".parse().unwrap(),
            sent: Mutex::new(Vec::new()),
            notify,
            rx: Mutex::new(Some(rx)),
            fail_sends: Mutex::new(false),
        })
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock() = fail;
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<(SipMessage, SocketAddr)> {
        self.sent.lock().clone()
    }

    /// Await the next sent message (consumes from the notification queue).
    pub async fn next_sent(&self) -> Option<(SipMessage, SocketAddr)> {
        let mut rx = self.rx.lock().take()?;
        let item = rx.recv().await;
        *self.rx.lock() = Some(rx);
        item
    }

    /// Await the next sent message with a timeout.
    pub async fn next_sent_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Option<(SipMessage, SocketAddr)> {
        tokio::time::timeout(timeout, self.next_sent()).await.ok()?
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send(&self, msg: SipMessage, dest: SocketAddr) -> Result<(), TransportError> {
        if *self.fail_sends.lock() {
            return Err(TransportError::Send("simulated failure".to_string()));
        }
        self.sent.lock().push((msg.clone(), dest));
        let _ = self.notify.send((msg, dest));
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
