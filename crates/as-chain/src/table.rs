//! The ODI table: live chains indexed by their resumption tokens.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use scscf_hss_client::Ifcs;

use crate::chain::{AsChain, AsChainLink};
use crate::session_case::SessionCase;

/// How long a chain's tokens stay resolvable after creation.  Bounds the
/// window for late-arriving loopbacks well past any transaction timeout.
const CHAIN_TTL: Duration = Duration::from_secs(300);

struct TableEntry {
    chain: Arc<AsChain>,
    pos: usize,
    created_at: Instant,
}

/// In-process map from ODI token to (chain, cursor position).
///
/// Chains are owned exclusively by the transaction currently driving them;
/// the table only resolves tokens back to a fresh link.
#[derive(Default)]
pub struct AsChainTable {
    entries: DashMap<String, TableEntry>,
}

impl AsChainTable {
    pub fn new() -> Self {
        AsChainTable {
            entries: DashMap::new(),
        }
    }

    /// Build a chain, register all its tokens, and hand back a link at
    /// position zero.
    pub fn create_chain(
        &self,
        session_case: SessionCase,
        served_user: String,
        ifcs: Ifcs,
        is_registered: bool,
        trail: u64,
    ) -> AsChainLink {
        let chain = AsChain::new(session_case, served_user, ifcs, is_registered, trail);
        let now = Instant::now();
        for (pos, token) in chain.tokens().iter().enumerate() {
            self.entries.insert(
                token.clone(),
                TableEntry {
                    chain: chain.clone(),
                    pos,
                    created_at: now,
                },
            );
        }
        debug!(
            served_user = chain.served_user(),
            session_case = %chain.session_case(),
            hops = chain.len(),
            "created AS chain"
        );
        AsChainLink::at(chain, 0)
    }

    /// Resolve a token to a link at its stored position.
    pub fn lookup(&self, token: &str) -> Option<AsChainLink> {
        self.entries
            .get(token)
            .map(|e| AsChainLink::at(e.chain.clone(), e.pos))
    }

    /// Drop entries past their lifetime.  Driven by the proxy's
    /// housekeeping tick.
    pub fn purge_expired(&self) {
        let cutoff = Instant::now();
        self.entries
            .retain(|_, e| cutoff.duration_since(e.created_at) < CHAIN_TTL);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scscf_hss_client::{AppServer, DefaultHandling, Ifc};
    use scscf_sip_core::prelude::*;

    fn one_ifc() -> Ifcs {
        Ifcs::new(vec![Ifc {
            priority: 0,
            trigger: None,
            app_server: AppServer {
                server_name: "sip:as.example.com".to_string(),
                default_handling: DefaultHandling::SessionContinued,
                include_register_request: false,
                include_register_response: false,
                service_info: None,
            },
        }])
    }

    #[test]
    fn tokens_resolve_to_their_positions() {
        let table = AsChainTable::new();
        let mut link = table.create_chain(
            SessionCase::Originating,
            "sip:alice@example.com".to_string(),
            one_ifc(),
            true,
            7,
        );
        assert_eq!(table.len(), 2);

        let req = Request::new(Method::Invite, Uri::sip("bob", "example.com"));
        let resume_token = match link.next_trigger(&req) {
            crate::chain::Trigger::Match { resume_token, .. } => resume_token,
            crate::chain::Trigger::End => panic!("expected a match"),
        };

        let resumed = table.lookup(&resume_token).unwrap();
        assert_eq!(resumed.position(), 1);
        assert!(resumed.is_complete());
        assert_eq!(resumed.served_user(), "sip:alice@example.com");
    }

    #[test]
    fn unknown_token_is_none() {
        let table = AsChainTable::new();
        assert!(table.lookup("odi_deadbeef").is_none());
    }
}
