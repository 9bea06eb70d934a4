//! # scscf-sproutlet-core
//!
//! The proxy kernel: multiplexes logical SIP services ("sproutlets") onto
//! one transaction core.  Inbound requests are matched to a sproutlet by
//! the host of their top Route (or Request-URI), handed to a
//! per-transaction handler, and the handler's forwards and forks are
//! managed here: Via and branch bookkeeping, fork timeouts, response
//! aggregation, CANCEL propagation and Record-Route insertion.
//!
//! Within one transaction, callbacks are serialized on a dedicated task;
//! across transactions everything runs in parallel on the runtime.

pub mod aggregate;
pub mod error;
pub mod helper;
pub mod load;
pub mod proxy;
pub mod sproutlet;
pub mod transport;

pub use error::TransportError;
pub use helper::{TimerId, TsxHelper};
pub use load::LoadMonitor;
pub use proxy::{ProxyConfig, SproutletProxy};
pub use sproutlet::{Sproutlet, SproutletTsx};
pub use transport::{RequestSender, TestTransport, Transport, UdpTransport};
