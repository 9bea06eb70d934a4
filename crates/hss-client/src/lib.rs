//! # scscf-hss-client
//!
//! Client for the subscriber-profile store: registration-state assertion
//! and profile reads over HTTP, plus the initial-filter-criteria document
//! model those profiles carry.
//!
//! The client is stateless request/response; retry policy belongs to the
//! HTTP layer and caching to the caller.

pub mod client;
pub mod error;
pub mod ifc;
pub mod xml;

pub use client::{
    HssClient, HssProvider, RegOp, RegistrationData, RegistrationState, SubscriberData,
};
pub use error::{HssError, Result};
pub use ifc::{AppServer, DefaultHandling, Ifc, Ifcs, Spt, SptPredicate, TriggerPoint};
