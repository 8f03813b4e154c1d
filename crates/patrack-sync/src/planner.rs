use std::collections::{HashMap, HashSet};

use patrack_core::{CatalogEntry, ListingItem, Origin, PlannedChange, SyncPlan};

/// Compares a listing against an origin's index and decides what to insert,
/// update and delete.
///
/// Remote entries are updated only when the version changed, local entries on
/// every re-upload. Deletions are only ever inferred for the remote origin.
pub fn plan(listing: &[ListingItem], index: &[CatalogEntry], origin: Origin) -> SyncPlan {
    let existing: HashMap<&str, &CatalogEntry> =
        index.iter().map(|entry| (entry.name.as_str(), entry)).collect();
    let mut seen = HashSet::new();
    let mut plan = SyncPlan::default();

    for item in listing {
        if !seen.insert(item.name.as_str()) {
            continue;
        }
        let change = PlannedChange {
            entry: CatalogEntry::new(item.name.clone(), item.version.clone(), origin),
            source: item.source.clone(),
        };
        match existing.get(item.name.as_str()) {
            None => plan.to_insert.push(change),
            Some(_) if origin == Origin::Local => plan.to_update.push(change),
            Some(current) if current.version != item.version => plan.to_update.push(change),
            Some(_) => {}
        }
    }

    if origin == Origin::Remote {
        plan.to_delete = index
            .iter()
            .filter(|entry| !seen.contains(entry.name.as_str()))
            .cloned()
            .collect();
    }
    plan
}
