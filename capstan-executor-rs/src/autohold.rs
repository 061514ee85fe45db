//! Autohold matching: decide whether a failed build's nodes should be
//! retained instead of returned to the allocator.

use capstan_rs::types::{AutoholdRequest, ResultKind};
use regex::Regex;
use tracing::{debug, warn};

/// Results eligible for holding nodes.
pub const HOLD_RESULTS: &[ResultKind] = &[
    ResultKind::Failure,
    ResultKind::RetryLimit,
    ResultKind::PostFailure,
    ResultKind::TimedOut,
];

pub fn should_hold(result: Option<ResultKind>) -> bool {
    result.map(|kind| HOLD_RESULTS.contains(&kind)).unwrap_or(false)
}

/// Precedence of autohold requests: those scoped to a specific ref are
/// fulfilled before those scoped to a change, before generic job-wide
/// requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Scope {
    None,
    Job,
    Change,
    Ref,
}

fn scope_of(ref_filter: &str) -> Scope {
    if ref_filter == ".*" {
        Scope::Job
    } else if ref_filter.ends_with(".*") {
        Scope::Change
    } else {
        Scope::Ref
    }
}

/// Find the most specific live autohold request covering the build.
///
/// Ties between requests of equal scope break to the lexicographically
/// smallest request id, making the selection stable regardless of the
/// listing order of the backing store.
pub fn match_request<'a>(
    requests: &'a [AutoholdRequest],
    tenant: &str,
    project: &str,
    job: &str,
    refname: &str,
) -> Option<&'a AutoholdRequest> {
    let mut best: Option<(&AutoholdRequest, Scope)> = None;
    debug!(tenant, project, job, refname, "checking autohold requests");
    for request in requests {
        if request.exhausted() {
            continue;
        }
        if request.tenant != tenant || request.project != project || request.job != job {
            continue;
        }
        // Filters anchor at the start of the ref, like the admin tooling
        // that creates them expects.
        let anchored = format!("^(?:{})", request.ref_filter);
        let matched = match Regex::new(&anchored) {
            Ok(re) => re.is_match(refname),
            Err(err) => {
                warn!(id = %request.id, %err, "invalid autohold ref filter");
                false
            }
        };
        if !matched {
            continue;
        }
        let scope = scope_of(&request.ref_filter);
        debug!(id = %request.id, ?scope, "autohold candidate");
        best = match best {
            None => Some((request, scope)),
            Some((current, current_scope)) => {
                if scope > current_scope
                    || (scope == current_scope && request.id < current.id)
                {
                    Some((request, scope))
                } else {
                    Some((current, current_scope))
                }
            }
        };
    }
    best.map(|(request, _)| request)
}
