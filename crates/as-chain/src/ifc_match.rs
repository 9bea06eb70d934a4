//! Trigger-point evaluation: does an iFC's boolean combination of service
//! point triggers hold for a request?

use regex::Regex;
use tracing::warn;

use scscf_hss_client::{Ifc, Spt, SptPredicate, TriggerPoint};
use scscf_sip_core::prelude::*;

use crate::session_case::SessionCase;

/// Evaluate an iFC against a request.  A missing trigger point matches
/// unconditionally.
pub fn ifc_matches(
    ifc: &Ifc,
    req: &Request,
    session_case: SessionCase,
    is_registered: bool,
) -> bool {
    match &ifc.trigger {
        None => true,
        Some(tp) => trigger_matches(tp, req, session_case, is_registered),
    }
}

/// CNF: every group must have at least one true SPT (groups OR internally).
/// DNF: at least one group must have all its SPTs true (groups AND
/// internally).
pub fn trigger_matches(
    tp: &TriggerPoint,
    req: &Request,
    session_case: SessionCase,
    is_registered: bool,
) -> bool {
    let mut group_ids: Vec<u32> = tp.spts.iter().flat_map(|s| s.groups.clone()).collect();
    group_ids.sort_unstable();
    group_ids.dedup();

    if group_ids.is_empty() {
        return true;
    }

    let group_holds = |group: u32| {
        let members = tp.spts.iter().filter(|s| s.groups.contains(&group));
        if tp.condition_type_cnf {
            // Within a CNF group, members are OR'd.
            members
                .into_iter()
                .any(|s| spt_matches(s, req, session_case, is_registered))
        } else {
            // Within a DNF group, members are AND'd.
            members
                .into_iter()
                .all(|s| spt_matches(s, req, session_case, is_registered))
        }
    };

    if tp.condition_type_cnf {
        group_ids.into_iter().all(group_holds)
    } else {
        group_ids.into_iter().any(group_holds)
    }
}

fn spt_matches(spt: &Spt, req: &Request, session_case: SessionCase, is_registered: bool) -> bool {
    let result = predicate_matches(&spt.predicate, req, session_case, is_registered);
    if spt.negated {
        !result
    } else {
        result
    }
}

fn predicate_matches(
    predicate: &SptPredicate,
    req: &Request,
    session_case: SessionCase,
    is_registered: bool,
) -> bool {
    match predicate {
        SptPredicate::Method(m) => req.method.to_string().eq_ignore_ascii_case(m),

        SptPredicate::SessionCase(code) => {
            session_case.matches_profile_code(*code, is_registered)
        }

        SptPredicate::RequestUri(pattern) => match compile(pattern) {
            Some(re) => re.is_match(&req.uri.to_string()),
            None => false,
        },

        SptPredicate::SipHeader { header, content } => {
            let header_re = match compile(header) {
                Some(re) => re,
                None => return false,
            };
            let content_re = content.as_deref().and_then(compile);
            req.headers.iter().any(|h| {
                header_re.is_match(h.name.as_str())
                    && content_re
                        .as_ref()
                        .map(|re| re.is_match(&h.value))
                        .unwrap_or(true)
            })
        }

        SptPredicate::SessionDescription { line, content } => {
            let line_re = match compile(line) {
                Some(re) => re,
                None => return false,
            };
            let content_re = content.as_deref().and_then(compile);
            let body = String::from_utf8_lossy(&req.body);
            body.lines().any(|l| {
                // SDP lines are `type=value`.
                match l.split_once('=') {
                    Some((kind, value)) => {
                        line_re.is_match(kind)
                            && content_re
                                .as_ref()
                                .map(|re| re.is_match(value))
                                .unwrap_or(true)
                    }
                    None => false,
                }
            })
        }
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern, error = %e, "invalid regex in service point trigger");
            None
        }
    }
}
