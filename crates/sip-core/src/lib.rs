//! # scscf-sip-core
//!
//! SIP message model for the scscf stack: requests, responses, URIs and the
//! typed headers this node interprets (routing headers, the P- identity
//! family, charging headers, Session-Expires and registration headers).
//!
//! The model is deliberately narrower than a general-purpose SIP parser: it
//! covers the grammar this node produces and consumes, keeps unknown headers
//! as raw name/value pairs, and guarantees parse-then-print idempotence for
//! the typed header set.

pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{Request, Response, SipMessage};
pub use types::{
    CSeq, Contact, Header, HeaderName, Headers, Method, NameAddr, PChargingFunctionAddresses,
    PChargingVector, Param, Refresher, Scheme, SessionExpires, StatusCode, Uri,
};

/// Commonly used types, importable as a block.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::message::{Request, Response, SipMessage};
    pub use crate::types::charging::{PChargingFunctionAddresses, PChargingVector};
    pub use crate::types::contact::Contact;
    pub use crate::types::cseq::CSeq;
    pub use crate::types::headers::{Header, HeaderName, Headers};
    pub use crate::types::method::Method;
    pub use crate::types::name_addr::NameAddr;
    pub use crate::types::param::Param;
    pub use crate::types::session_expires::{Refresher, SessionExpires};
    pub use crate::types::status::StatusCode;
    pub use crate::types::uri::{Scheme, Uri};
}
