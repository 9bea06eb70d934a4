//! The initial-filter-criteria document model.
//!
//! An iFC pairs a trigger point (a boolean combination of service point
//! triggers) with the application server that should see matching requests.
//! Trigger evaluation itself lives with the chain engine; this module is
//! the data model as carried in subscriber profiles.

use serde::{Deserialize, Serialize};

/// What to do when the application server fails or cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultHandling {
    /// Skip the server and continue the chain.
    SessionContinued,
    /// Reject the session with the server's failure code.
    SessionTerminated,
}

impl DefaultHandling {
    /// Decode the profile's numeric encoding (anything unknown falls back
    /// to continuing, the safe direction).
    pub fn from_profile_value(v: i32) -> Self {
        if v == 1 {
            DefaultHandling::SessionTerminated
        } else {
            DefaultHandling::SessionContinued
        }
    }
}

/// The application-server half of an iFC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppServer {
    /// SIP URI of the server.
    pub server_name: String,
    pub default_handling: DefaultHandling,
    /// Whether third-party REGISTERs to this server embed the original
    /// REGISTER request.
    pub include_register_request: bool,
    /// Whether they embed the REGISTER's 200 response.
    pub include_register_response: bool,
    /// Opaque service data passed through to the server.
    pub service_info: Option<String>,
}

/// One service point trigger predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SptPredicate {
    /// SIP method equals.
    Method(String),
    /// Session case code as carried in the profile (0 originating,
    /// 1 terminating-registered, 2 terminating-unregistered,
    /// 3 originating-unregistered, 4 originating-cdiv).
    SessionCase(u8),
    /// Request-URI matches this regular expression.
    RequestUri(String),
    /// A header with this name (regex) exists, optionally with content
    /// matching the second regex.
    SipHeader {
        header: String,
        content: Option<String>,
    },
    /// An SDP line of this kind exists, optionally with matching content.
    SessionDescription {
        line: String,
        content: Option<String>,
    },
}

/// A service point trigger: predicate, CNF/DNF group membership and an
/// optional negation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spt {
    pub groups: Vec<u32>,
    pub negated: bool,
    pub predicate: SptPredicate,
}

/// A trigger point: service point triggers combined in conjunctive or
/// disjunctive normal form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPoint {
    /// True for CNF (an AND of OR-groups), false for DNF (an OR of
    /// AND-groups).
    pub condition_type_cnf: bool,
    pub spts: Vec<Spt>,
}

/// One initial filter criterion.
///
/// A missing trigger point matches unconditionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ifc {
    pub priority: i32,
    pub trigger: Option<TriggerPoint>,
    pub app_server: AppServer,
}

/// A subscriber's ordered iFC list for one service profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ifcs(Vec<Ifc>);

impl Ifcs {
    /// Build from an unordered list, sorting by ascending priority.
    pub fn new(mut ifcs: Vec<Ifc>) -> Self {
        ifcs.sort_by_key(|i| i.priority);
        Ifcs(ifcs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ifc> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Ifc> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifcs_sort_by_priority() {
        let server = AppServer {
            server_name: "sip:as.example.com".to_string(),
            default_handling: DefaultHandling::SessionContinued,
            include_register_request: false,
            include_register_response: false,
            service_info: None,
        };
        let ifcs = Ifcs::new(vec![
            Ifc {
                priority: 5,
                trigger: None,
                app_server: server.clone(),
            },
            Ifc {
                priority: 1,
                trigger: None,
                app_server: server,
            },
        ]);
        let priorities: Vec<i32> = ifcs.iter().map(|i| i.priority).collect();
        assert_eq!(priorities, vec![1, 5]);
    }

    #[test]
    fn default_handling_decoding() {
        assert_eq!(
            DefaultHandling::from_profile_value(0),
            DefaultHandling::SessionContinued
        );
        assert_eq!(
            DefaultHandling::from_profile_value(1),
            DefaultHandling::SessionTerminated
        );
        assert_eq!(
            DefaultHandling::from_profile_value(7),
            DefaultHandling::SessionContinued
        );
    }
}
