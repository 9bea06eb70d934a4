//! # scscf-core
//!
//! The S-CSCF service itself: for each initial request, determine the
//! served user and session case, fetch the subscriber's profile, drive the
//! iFC chain through the application servers it names, and finally route
//! toward the next hop (another server, the I-CSCF, the BGCF, the
//! terminating side of this node, or the user's registered contacts).

pub mod config;
pub mod enum_service;
pub mod sproutlet;

pub use config::ScscfConfig;
pub use enum_service::{EnumService, NullEnumService};
pub use sproutlet::ScscfSproutlet;
