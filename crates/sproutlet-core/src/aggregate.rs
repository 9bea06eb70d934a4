//! Best-response selection across forks, per RFC 3261 16.7 rule 6.

use scscf_sip_core::StatusCode;

/// Priority class of a final response for aggregation: lower is better.
///
/// 6xx trumps everything (the request was authoritatively declined), then
/// classes in ascending preference of "retryability".
fn class_rank(code: StatusCode) -> u8 {
    match code.class() {
        6 => 0,
        2 => 1,
        3 => 2,
        4 => 3,
        5 => 4,
        _ => 5,
    }
}

/// Whether `a` beats `b` as the aggregated final response.
///
/// Within the same class the lower code wins; on a full tie the earlier
/// received response (`b`) is kept.
pub fn better_response(a: StatusCode, b: StatusCode) -> bool {
    let (ra, rb) = (class_rank(a), class_rank(b));
    if ra != rb {
        return ra < rb;
    }
    a.as_u16() < b.as_u16()
}

/// Fold a candidate into the current best.
pub fn fold_best(best: Option<StatusCode>, candidate: StatusCode) -> StatusCode {
    match best {
        None => candidate,
        Some(best) if better_response(candidate, best) => candidate,
        Some(best) => best,
    }
}
