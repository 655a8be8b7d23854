//! Garbage collection: per-domain-key and global capacity enforcement.
//!
//! Runs after every successful insert. The domain pass protects priority
//! quotas in three rounds (Low, then Low+Medium, then all), always evicting
//! the least-recently-accessed records beyond the protected quota. The
//! global pass only considers records whose last access falls outside the
//! safe-from-purge window.
//!
//! Planning is separated from application: these functions inspect the index
//! and return the records to delete (with their causes); the store applies
//! the plan through its single owning-removal path.

use time::OffsetDateTime;

use crate::cookie::{Cookie, CookiePriority};
use crate::events::DeletionCause;
use crate::index::CookieIndex;

pub(crate) const DOMAIN_MAX_COOKIES: usize = 180;
pub(crate) const DOMAIN_PURGE_COOKIES: usize = 30;
pub(crate) const MAX_COOKIES: usize = 3300;
pub(crate) const PURGE_COOKIES: usize = 300;

pub(crate) const DOMAIN_QUOTA_LOW: usize = 30;
pub(crate) const DOMAIN_QUOTA_MEDIUM: usize = 50;
pub(crate) const DOMAIN_QUOTA_HIGH: usize =
    DOMAIN_MAX_COOKIES - DOMAIN_PURGE_COOKIES - DOMAIN_QUOTA_LOW - DOMAIN_QUOTA_MEDIUM;

pub(crate) const SAFE_FROM_GLOBAL_PURGE_DAYS: i64 = 30;

/// One planned deletion from the global pass.
pub(crate) struct GlobalPurge {
    pub key: String,
    pub id: i128,
    pub cause: DeletionCause,
}

#[derive(Clone, Copy)]
struct Candidate {
    id: i128,
    last_access: OffsetDateTime,
    creation: OffsetDateTime,
}

impl Candidate {
    fn of(c: &Cookie) -> Self {
        Self {
            id: c.creation_id(),
            last_access: c.last_access(),
            creation: c.creation(),
        }
    }

    fn access_order(&self) -> (OffsetDateTime, OffsetDateTime) {
        (self.last_access, self.creation)
    }
}

/// Plans the purge for one domain key. Returns nothing unless the bucket is
/// over [`DOMAIN_MAX_COOKIES`].
pub(crate) fn domain_purge_plan(
    bucket: &[Cookie],
    now: OffsetDateTime,
    safe_date: OffsetDateTime,
    keep_expired: bool,
) -> Vec<(i128, DeletionCause)> {
    if bucket.len() <= DOMAIN_MAX_COOKIES {
        return Vec::new();
    }
    log::debug!("domain garbage collection, {} cookies", bucket.len());

    let mut plan = Vec::new();

    // Expired records go first; they are cheap and often enough.
    let mut low = Vec::new();
    let mut medium = Vec::new();
    let mut high = Vec::new();
    for c in bucket {
        if !keep_expired && c.is_expired(now) {
            plan.push((c.creation_id(), DeletionCause::Expired));
        } else {
            match c.priority() {
                CookiePriority::Low => low.push(Candidate::of(c)),
                CookiePriority::Medium => medium.push(Candidate::of(c)),
                CookiePriority::High => high.push(Candidate::of(c)),
            }
        }
    }

    let surviving = low.len() + medium.len() + high.len();
    if surviving <= DOMAIN_MAX_COOKIES {
        return plan;
    }

    let mut purge_goal = surviving - (DOMAIN_MAX_COOKIES - DOMAIN_PURGE_COOKIES);

    // [LLL|MMMM|HHH] with cumulative bounds for the three rounds.
    let bounds = [0, low.len(), low.len() + medium.len(), surviving];
    let mut candidates = low;
    candidates.append(&mut medium);
    candidates.append(&mut high);

    let quotas = [DOMAIN_QUOTA_LOW, DOMAIN_QUOTA_MEDIUM, DOMAIN_QUOTA_HIGH];
    let mut protected = 0;
    let mut purge_begin = 0;
    for round in 0..3 {
        if purge_goal == 0 {
            break;
        }
        protected += quotas[round];

        let bound = bounds[round + 1];
        let considered = bound - purge_begin;
        if considered <= protected {
            continue;
        }

        let round_goal = purge_goal.min(considered - protected);
        purge_goal -= round_goal;

        candidates[purge_begin..bound].sort_by_key(Candidate::access_order);
        for cand in &candidates[purge_begin..purge_begin + round_goal] {
            let cause = if cand.last_access < safe_date {
                DeletionCause::EvictedDomainPreSafe
            } else {
                DeletionCause::EvictedDomainPostSafe
            };
            plan.push((cand.id, cause));
        }
        purge_begin += round_goal;
    }

    plan
}

/// Plans the global purge. Runs only when the store is over [`MAX_COOKIES`]
/// and the tracked earliest access time falls before `safe_date`; records at
/// or after `safe_date` are never deleted here. Also returns the new
/// earliest-access watermark (the oldest retained record) when the deep pass
/// ran.
pub(crate) fn global_purge_plan(
    index: &CookieIndex,
    now: OffsetDateTime,
    safe_date: OffsetDateTime,
    earliest_access: Option<OffsetDateTime>,
    keep_expired: bool,
) -> (Vec<GlobalPurge>, Option<OffsetDateTime>) {
    if index.total_len() <= MAX_COOKIES {
        return (Vec::new(), None);
    }
    if matches!(earliest_access, Some(t) if t >= safe_date) {
        return (Vec::new(), None);
    }
    log::debug!("global garbage collection, {} cookies", index.total_len());

    let mut plan = Vec::new();
    let mut survivors: Vec<(&str, Candidate)> = Vec::with_capacity(index.total_len());
    for (key, c) in index.iter() {
        if !keep_expired && c.is_expired(now) {
            plan.push(GlobalPurge {
                key: key.to_string(),
                id: c.creation_id(),
                cause: DeletionCause::Expired,
            });
        } else {
            survivors.push((key, Candidate::of(c)));
        }
    }

    if survivors.len() <= MAX_COOKIES {
        return (plan, None);
    }

    let purge_goal = survivors.len() - (MAX_COOKIES - PURGE_COOKIES);
    survivors.sort_by_key(|(_, cand)| cand.access_order());

    // Everything accessed on or after the cutoff stays, even if that leaves
    // us over budget.
    let purge_end = survivors[..purge_goal].partition_point(|(_, cand)| cand.last_access < safe_date);
    for (key, cand) in &survivors[..purge_end] {
        plan.push(GlobalPurge {
            key: key.to_string(),
            id: cand.id,
            cause: DeletionCause::EvictedGlobal,
        });
    }
    let new_earliest = survivors[purge_end].1.last_access;

    (plan, Some(new_earliest))
}
