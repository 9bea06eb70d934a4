//! AS chains and the per-hop link cursor.

use std::sync::Arc;

use uuid::Uuid;

use scscf_hss_client::{AppServer, Ifcs};
use scscf_sip_core::Request;

use crate::ifc_match;
use crate::session_case::SessionCase;

/// Reserved prefix of ODI tokens.  User parts starting with this are chain
/// resumption tokens and are never minted by clients.
pub const ODI_PREFIX: &str = "odi_";

/// An immutable AS chain: one served user, one session case, the ordered
/// iFC list, and one pre-minted ODI token per resumable position.
#[derive(Debug)]
pub struct AsChain {
    session_case: SessionCase,
    served_user: String,
    ifcs: Ifcs,
    is_registered: bool,
    trail: u64,
    /// `odi_tokens[i]` resumes the chain with the cursor at position `i`;
    /// position `ifcs.len()` is the completed chain.
    odi_tokens: Vec<String>,
}

impl AsChain {
    pub(crate) fn new(
        session_case: SessionCase,
        served_user: String,
        ifcs: Ifcs,
        is_registered: bool,
        trail: u64,
    ) -> Arc<Self> {
        let odi_tokens = (0..=ifcs.len())
            .map(|_| format!("{}{}", ODI_PREFIX, Uuid::new_v4().simple()))
            .collect();
        Arc::new(AsChain {
            session_case,
            served_user,
            ifcs,
            is_registered,
            trail,
            odi_tokens,
        })
    }

    pub fn session_case(&self) -> SessionCase {
        self.session_case
    }

    pub fn served_user(&self) -> &str {
        &self.served_user
    }

    pub fn is_registered(&self) -> bool {
        self.is_registered
    }

    pub fn trail(&self) -> u64 {
        self.trail
    }

    pub fn len(&self) -> usize {
        self.ifcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ifcs.is_empty()
    }

    pub(crate) fn token_for(&self, pos: usize) -> &str {
        &self.odi_tokens[pos]
    }

    pub(crate) fn tokens(&self) -> &[String] {
        &self.odi_tokens
    }
}

/// Outcome of asking a link for the next matching trigger.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// An iFC matched: route to this server, with this token on the return
    /// Route so the chain resumes past the matched position.
    Match {
        server: AppServer,
        resume_token: String,
    },
    /// No further iFC matches; the chain is complete.
    End,
}

/// A mutable cursor over one chain, owned by the transaction currently
/// driving it.
#[derive(Debug, Clone)]
pub struct AsChainLink {
    chain: Arc<AsChain>,
    pos: usize,
}

impl AsChainLink {
    pub(crate) fn at(chain: Arc<AsChain>, pos: usize) -> Self {
        AsChainLink { chain, pos }
    }

    pub fn chain(&self) -> &Arc<AsChain> {
        &self.chain
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn session_case(&self) -> SessionCase {
        self.chain.session_case()
    }

    pub fn served_user(&self) -> &str {
        self.chain.served_user()
    }

    pub fn is_complete(&self) -> bool {
        self.pos >= self.chain.len()
    }

    /// Advance past non-matching iFCs and return the first match, or `End`.
    ///
    /// On a match the cursor moves past the matched position, so a
    /// subsequent call (the CONTINUED failure path) carries on from the
    /// next iFC.
    pub fn next_trigger(&mut self, req: &Request) -> Trigger {
        while let Some(ifc) = self.chain.ifcs.get(self.pos) {
            self.pos += 1;
            if ifc_match::ifc_matches(
                ifc,
                req,
                self.chain.session_case(),
                self.chain.is_registered(),
            ) {
                return Trigger::Match {
                    server: ifc.app_server.clone(),
                    resume_token: self.chain.token_for(self.pos).to_string(),
                };
            }
        }
        Trigger::End
    }
}
