//! Fetch and delivery task queues.
//!
//! Both queues share one selection rule, applied once per tick:
//!
//! 1. Tasks without a priority function (manifests, indexes) are always
//!    taken first, all at once.
//! 2. Otherwise the task with the smallest `priority * depth` is selected.
//!    Ties go to the shallower task, then to the older one. NaN scores sort
//!    last.
//! 3. Every other queued task whose key is one of the selected task's
//!    siblings joins the batch regardless of its own score.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::key::ResourceKey;
use crate::types::{PriorityFn, SiblingsFn, no_siblings};

/// How a task is ranked against the rest of its queue.
#[derive(Clone)]
pub struct Ranking {
    /// `None` marks an unconditional task.
    pub priority: Option<PriorityFn>,
    pub siblings: SiblingsFn,
    pub depth: u32,
}

impl Ranking {
    /// A ranking for a manifest or index that is scheduled before anything
    /// else.
    #[must_use]
    pub fn unconditional() -> Self {
        Self {
            priority: None,
            siblings: no_siblings(),
            depth: 0,
        }
    }

    /// Evaluate the score of this ranking, or `None` if it is unconditional.
    #[must_use]
    pub fn score(&self) -> Option<f64> {
        self.priority
            .as_ref()
            .map(|priority| priority() * f64::from(self.depth))
    }
}

impl Default for Ranking {
    fn default() -> Self {
        Self::unconditional()
    }
}

impl fmt::Debug for Ranking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ranking")
            .field("unconditional", &self.priority.is_none())
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// Anything a [`TaskQueue`] can schedule.
pub trait Scheduled {
    fn key(&self) -> &ResourceKey;
    fn ranking(&self) -> &Ranking;
}

/// A queued or in-flight fetch.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub key: ResourceKey,
    pub ranking: Ranking,
    /// Fires when the last consumer of the key goes away.
    pub cancel: CancellationToken,
    /// Distinguishes this fetch from earlier fetches of the same key.
    pub generation: u64,
}

impl Scheduled for FetchTask {
    fn key(&self) -> &ResourceKey {
        &self.key
    }

    fn ranking(&self) -> &Ranking {
        &self.ranking
    }
}

/// A pending hand-off of cached content to waiting consumers.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub key: ResourceKey,
    pub ranking: Ranking,
}

impl Scheduled for DeliveryTask {
    fn key(&self) -> &ResourceKey {
        &self.key
    }

    fn ranking(&self) -> &Ranking {
        &self.ranking
    }
}

#[derive(Debug)]
struct Queued<T> {
    seq: u64,
    task: T,
}

/// A multiset of tasks drained in ranked batches.
#[derive(Debug)]
pub struct TaskQueue<T> {
    tasks: Vec<Queued<T>>,
    next_seq: u64,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            next_seq: 0,
        }
    }
}

impl<T: Scheduled> TaskQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(Queued { seq, task });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.tasks.iter().any(|q| q.task.key() == key)
    }

    /// Remove every task for `key`.
    pub fn remove(&mut self, key: &ResourceKey) -> Vec<T> {
        let (removed, kept): (Vec<Queued<T>>, Vec<Queued<T>>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|q| q.task.key() == key);
        self.tasks = kept;
        removed.into_iter().map(|q| q.task).collect()
    }

    /// Remove and return the next batch, at most `limit` tasks long.
    ///
    /// Members of the batch beyond `limit` stay queued. This evaluates the
    /// queued priority and sibling functions in place; callers that guard
    /// the queue with a lock should use [`TaskQueue::candidates`],
    /// [`plan_batch`] and [`TaskQueue::take_planned`] instead, releasing the
    /// lock while planning.
    pub fn next_batch(&mut self, limit: usize) -> Vec<T> {
        let plan = plan_batch(&self.candidates(), limit);
        self.take_planned(&plan, limit)
    }

    /// Snapshot every queued task's key and ranking, oldest first.
    #[must_use]
    pub fn candidates(&self) -> Vec<Candidate> {
        self.tasks
            .iter()
            .map(|q| Candidate {
                seq: q.seq,
                key: q.task.key().clone(),
                ranking: q.task.ranking().clone(),
            })
            .collect()
    }

    /// Remove up to `limit` planned tasks, in plan order.
    ///
    /// Planned tasks that left the queue since the snapshot are skipped;
    /// tasks queued since then are not considered.
    pub fn take_planned(&mut self, plan: &BatchPlan, limit: usize) -> Vec<T> {
        if plan.is_empty() || limit == 0 {
            return Vec::new();
        }

        let index: HashMap<u64, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, q)| (q.seq, i))
            .collect();
        let mut slots: Vec<Option<Queued<T>>> =
            std::mem::take(&mut self.tasks).into_iter().map(Some).collect();
        let taken = plan
            .seqs
            .iter()
            .filter_map(|seq| index.get(seq))
            .filter_map(|&i| slots[i].take())
            .take(limit)
            .map(|q| q.task)
            .collect();
        self.tasks = slots.into_iter().flatten().collect();
        taken
    }
}

/// A queued task's key and ranking, detached from its queue.
#[derive(Debug, Clone)]
pub struct Candidate {
    seq: u64,
    key: ResourceKey,
    ranking: Ranking,
}

/// The tasks chosen by [`plan_batch`], in batch order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    seqs: Vec<u64>,
}

impl BatchPlan {
    #[must_use]
    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }
}

/// Choose the next batch of at most `limit` tasks from `candidates`.
///
/// Calls the candidates' priority functions and the selected task's
/// sibling function.
#[must_use]
pub fn plan_batch(candidates: &[Candidate], limit: usize) -> BatchPlan {
    if limit == 0 || candidates.is_empty() {
        return BatchPlan::default();
    }

    let unconditional: Vec<u64> = candidates
        .iter()
        .filter(|c| c.ranking.priority.is_none())
        .map(|c| c.seq)
        .collect();

    let mut seqs = if unconditional.is_empty() {
        ranked_batch(candidates)
    } else {
        unconditional
    };
    seqs.truncate(limit);
    BatchPlan { seqs }
}

fn ranked_batch(candidates: &[Candidate]) -> Vec<u64> {
    let scored: Vec<(&Candidate, f64)> = candidates
        .iter()
        .map(|c| (c, c.ranking.score().unwrap_or(f64::NAN)))
        .collect();

    let Some(&(selected, _)) = scored.iter().min_by(|(a, sa), (b, sb)| {
        compare_scores(*sa, *sb)
            .then_with(|| a.ranking.depth.cmp(&b.ranking.depth))
            .then_with(|| a.seq.cmp(&b.seq))
    }) else {
        return Vec::new();
    };

    let siblings: HashSet<ResourceKey> = (selected.ranking.siblings)().into_iter().collect();

    let mut batch = vec![selected.seq];
    batch.extend(
        candidates
            .iter()
            .filter(|c| c.seq != selected.seq && siblings.contains(&c.key))
            .map(|c| c.seq),
    );
    batch
}

/// Order scores ascending with NaN after every number.
fn compare_scores(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (false, false) => a.total_cmp(&b),
        (a_nan, b_nan) => a_nan.cmp(&b_nan),
    }
}
