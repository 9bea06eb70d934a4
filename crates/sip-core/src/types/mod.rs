//! Typed SIP values: methods, status codes, URIs, name-addrs and the header
//! set this node interprets.

pub mod charging;
pub mod contact;
pub mod cseq;
pub mod headers;
pub mod method;
pub mod name_addr;
pub mod param;
pub mod session_expires;
pub mod status;
pub mod uri;

pub use charging::{PChargingFunctionAddresses, PChargingVector};
pub use contact::Contact;
pub use cseq::CSeq;
pub use headers::{Header, HeaderName, Headers};
pub use method::Method;
pub use name_addr::NameAddr;
pub use param::Param;
pub use session_expires::{Refresher, SessionExpires};
pub use status::StatusCode;
pub use uri::{Scheme, Uri};
