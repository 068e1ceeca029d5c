//! Dependency resolution over job descriptors.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::domain::EntityType;
use crate::error::{EtlError, EtlResult};
use crate::jobs::{Job, JobRegistry};

/// Jobs needed to produce `required`, in dependency order.
///
/// Selects every registered job whose outputs intersect the closure of
/// `required` and their transitive dependency types, then orders them so a
/// job runs after every producer of the types it reads. Ties keep
/// registration order.
///
/// # Errors
///
/// Returns a job error if some type in the closure has no producer, or if
/// the selected jobs' dependencies form a cycle.
pub fn resolve(registry: &JobRegistry, required: &[EntityType]) -> EtlResult<Vec<Arc<dyn Job>>> {
    let jobs = registry.jobs();

    let mut closure = BTreeSet::new();
    let mut queue: VecDeque<EntityType> = required.iter().copied().collect();
    while let Some(ty) = queue.pop_front() {
        if !closure.insert(ty) {
            continue;
        }
        let producers: Vec<_> = jobs
            .iter()
            .filter(|j| j.descriptor().output_types.contains(&ty))
            .collect();
        if producers.is_empty() {
            return Err(EtlError::job(format!("no registered job produces '{ty}'"), None));
        }
        for job in producers {
            queue.extend(job.descriptor().dependency_types.iter().copied());
        }
    }

    let selected: Vec<&Arc<dyn Job>> = jobs
        .iter()
        .filter(|j| {
            j.descriptor()
                .output_types
                .iter()
                .any(|ty| closure.contains(ty))
        })
        .collect();

    // Kahn's algorithm; edge a -> b when a writes a type b reads.
    let n = selected.len();
    let depends_on = |b: usize, a: usize| {
        a != b
            && selected[b]
                .descriptor()
                .dependency_types
                .iter()
                .any(|ty| selected[a].descriptor().output_types.contains(ty))
    };
    let self_loop = |b: usize| {
        let d = selected[b].descriptor();
        d.dependency_types.iter().any(|ty| d.output_types.contains(ty))
    };

    let mut in_degree: Vec<usize> = (0..n)
        .map(|b| (0..n).filter(|&a| depends_on(b, a)).count() + usize::from(self_loop(b)))
        .collect();
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(n);

    while let Some(a) = ready.pop_first() {
        ordered.push(selected[a].clone());
        for b in 0..n {
            if depends_on(b, a) {
                in_degree[b] -= 1;
                if in_degree[b] == 0 {
                    ready.insert(b);
                }
            }
        }
    }

    if ordered.len() != n {
        let stuck: Vec<&str> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| selected[i].descriptor().name)
            .collect();
        return Err(EtlError::job(
            format!("dependency cycle among jobs: {}", stuck.join(", ")),
            None,
        ));
    }

    Ok(ordered)
}

/// The subset of `ordered` to run when repairing a reorg.
///
/// Reorg-capable jobs plus every job they transitively depend on, in the
/// same order.
#[must_use]
pub fn reorg_subset(ordered: &[Arc<dyn Job>]) -> Vec<Arc<dyn Job>> {
    let mut keep: Vec<bool> = ordered.iter().map(|j| j.descriptor().reorg_capable).collect();
    // Dependencies precede dependants, so one backward sweep suffices.
    for b in (0..ordered.len()).rev() {
        if !keep[b] {
            continue;
        }
        let deps = ordered[b].descriptor().dependency_types;
        for a in 0..b {
            if ordered[a]
                .descriptor()
                .output_types
                .iter()
                .any(|ty| deps.contains(ty))
            {
                keep[a] = true;
            }
        }
    }
    ordered
        .iter()
        .zip(keep)
        .filter_map(|(job, keep)| keep.then(|| job.clone()))
        .collect()
}
