//! Load-time duplicate resolution.
//!
//! A backing store may hand us several cookies sharing one equivalence class
//! `(name, domain, path)`. Within each class only the most recently created
//! record is kept; the rest are deleted (synced back to the store, but never
//! reported to the delegate).

use std::collections::HashMap;

use crate::cookie::Cookie;

/// Returns the creation ids of every record in `bucket` that loses its
/// equivalence class to a more recently created member.
pub(crate) fn duplicate_victims(bucket: &[Cookie]) -> Vec<i128> {
    let mut classes: HashMap<(&str, &str, &str), Vec<&Cookie>> = HashMap::new();
    for c in bucket {
        classes
            .entry((c.name(), c.domain(), c.path()))
            .or_default()
            .push(c);
    }

    let mut victims = Vec::new();
    for (_, mut members) in classes {
        if members.len() <= 1 {
            continue;
        }
        members.sort_by_key(|c| c.creation());
        let (keep, rest) = members.split_last().unwrap();
        log::warn!(
            "trimming {} duplicate cookies for {{name='{}', domain='{}', path='{}'}}",
            rest.len(),
            keep.name(),
            keep.domain(),
            keep.path()
        );
        victims.extend(rest.iter().map(|c| c.creation_id()));
    }
    victims
}
