//! # scscf-as-chain
//!
//! The application-server chain engine: for one served user and one session
//! case, walk the subscriber's ordered iFC list, decide which application
//! servers must see the request, and hand out original-dialog-identifier
//! (ODI) tokens so a request looping back from a server resumes the chain
//! at the right position.

pub mod chain;
pub mod ifc_match;
pub mod session_case;
pub mod table;

pub use chain::{AsChain, AsChainLink, Trigger, ODI_PREFIX};
pub use session_case::SessionCase;
pub use table::AsChainTable;
