//! Per-app worker placement.
//!
//! Decides which apps each new worker slot loads. Unlimited apps go to
//! every worker; limited apps fill up to their cap, counted across the
//! live pool. Failure-driven reassignment takes priority: when a worker
//! dies, the exact app set it hosted is queued and the next spawn consumes
//! it (FIFO) instead of the greedy fill.

use std::collections::{BTreeSet, HashMap, VecDeque};

/// An app spec with its worker cap resolved against the registry:
/// the `:N` suffix when given, otherwise the registered limit, otherwise
/// unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApp {
    pub import_path: String,
    pub worker_count: Option<u32>,
}

impl ResolvedApp {
    pub fn unlimited(import_path: impl Into<String>) -> Self {
        Self {
            import_path: import_path.into(),
            worker_count: None,
        }
    }

    pub fn limited(import_path: impl Into<String>, worker_count: u32) -> Self {
        Self {
            import_path: import_path.into(),
            worker_count: Some(worker_count),
        }
    }
}

/// Minimum pool size: at least one worker, and never below the largest
/// per-app requirement (a limited app must be able to reach its cap).
pub fn worker_floor(specs: &[ResolvedApp]) -> usize {
    specs
        .iter()
        .filter_map(|spec| spec.worker_count)
        .max()
        .unwrap_or(1)
        .max(1) as usize
}

/// Cold-start plan: the app set for each of `num_workers` fresh workers.
/// Slot 0 fills limited apps first, so at steady state every limited app
/// hosts on exactly `min(worker_count, num_workers)` workers.
pub fn initial_plan(specs: &[ResolvedApp], num_workers: usize) -> Vec<BTreeSet<String>> {
    let mut hosted: HashMap<&str, u32> = HashMap::new();
    (0..num_workers)
        .map(|_| {
            let mut set = BTreeSet::new();
            for spec in specs {
                match spec.worker_count {
                    None => {
                        set.insert(spec.import_path.clone());
                    }
                    Some(limit) => {
                        let count = hosted.entry(spec.import_path.as_str()).or_insert(0);
                        if *count < limit {
                            *count += 1;
                            set.insert(spec.import_path.clone());
                        }
                    }
                }
            }
            set
        })
        .collect()
}

/// The app set for one new worker slot.
///
/// Drains the front of the respawn queue first, filtered to specs still
/// present and to limited apps not already at their cap (a deliberate
/// downscale may have raced the crash, and the cap is a hard invariant).
/// Falls back to the greedy fill when the queue is empty or the filtered
/// set comes out empty.
pub fn next_app_set(
    specs: &[ResolvedApp],
    hosted: &HashMap<String, usize>,
    pending_respawns: &mut VecDeque<BTreeSet<String>>,
) -> BTreeSet<String> {
    if let Some(queued) = pending_respawns.pop_front() {
        let filtered: BTreeSet<String> = queued
            .into_iter()
            .filter(|path| {
                specs.iter().any(|spec| {
                    spec.import_path == *path
                        && match spec.worker_count {
                            None => true,
                            Some(limit) => {
                                hosted.get(path).copied().unwrap_or(0) < limit as usize
                            }
                        }
                })
            })
            .collect();
        if !filtered.is_empty() {
            return filtered;
        }
    }

    let mut set = BTreeSet::new();
    for spec in specs {
        match spec.worker_count {
            None => {
                set.insert(spec.import_path.clone());
            }
            Some(limit) => {
                if hosted.get(&spec.import_path).copied().unwrap_or(0) < limit as usize {
                    set.insert(spec.import_path.clone());
                }
            }
        }
    }
    set
}
