//! Tag-aware candidate selection shared by every store.
//!
//! Stores walk their queued rows in `(priority, insertion)` order and offer
//! each one to an [`AdmissionWindow`]. A row whose tag is saturated is skipped
//! rather than ending the walk, so a busy tag never starves another.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::command::{CommandRequest, WorkType};

/// Caller-supplied constraints for one admission round.
#[derive(Clone, Debug, Default)]
pub struct AdmissionQuery {
    /// Upper bound on returned candidates.
    pub quantity: usize,
    /// Commands currently executing, per parallel tag.
    pub tag_inflight: HashMap<String, u32>,
    /// Smallest limit among the commands executing on each tag. A running
    /// `parallel_max = 1` command keeps its tag exclusive even for newcomers
    /// that would tolerate more company.
    pub running_limits: HashMap<String, u32>,
    /// Operator caps per tag; combined with each row's own `parallel_max`.
    pub tag_caps: HashMap<String, u32>,
    pub excluded_batches: HashSet<String>,
    pub excluded_work_types: HashSet<WorkType>,
    /// Precondition names known to be blocked right now.
    pub blocked_preconditions: HashSet<String>,
}

impl AdmissionQuery {
    pub fn new(quantity: usize) -> Self {
        Self {
            quantity,
            ..Self::default()
        }
    }

    pub fn with_inflight(mut self, tag: impl Into<String>, running: u32) -> Self {
        self.tag_inflight.insert(tag.into(), running);
        self
    }

    pub fn with_running_limit(mut self, tag: impl Into<String>, limit: u32) -> Self {
        self.running_limits.insert(tag.into(), limit);
        self
    }

    pub fn with_tag_cap(mut self, tag: impl Into<String>, cap: u32) -> Self {
        self.tag_caps.insert(tag.into(), cap);
        self
    }

    pub fn excluding_batch(mut self, batch: impl Into<String>) -> Self {
        self.excluded_batches.insert(batch.into());
        self
    }

    pub fn excluding_work_type(mut self, work_type: WorkType) -> Self {
        self.excluded_work_types.insert(work_type);
        self
    }

    pub fn with_blocked_precondition(mut self, name: impl Into<String>) -> Self {
        self.blocked_preconditions.insert(name.into());
        self
    }

    /// Effective concurrency limit for a row: the smaller of its own
    /// `parallel_max` and the operator cap for its tag.
    pub fn limit_for(&self, request: &CommandRequest) -> Option<u32> {
        tighter(
            request.parallel_max,
            self.tag_caps.get(&request.parallel_tag).copied(),
        )
    }
}

/// The stricter of two optional limits; `None` means unbounded.
pub(crate) fn tighter(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Default)]
struct Taken {
    count: u32,
    limit: Option<u32>,
}

/// Why a row was passed over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Skip {
    NotVisible,
    Batch,
    WorkType,
    Precondition,
    TagFull,
    WindowFull,
}

/// Accumulates admitted rows for one round.
#[derive(Debug)]
pub struct AdmissionWindow<'q> {
    query: &'q AdmissionQuery,
    now: DateTime<Utc>,
    taken: HashMap<String, Taken>,
    selected: Vec<CommandRequest>,
}

impl<'q> AdmissionWindow<'q> {
    pub fn new(query: &'q AdmissionQuery, now: DateTime<Utc>) -> Self {
        Self {
            query,
            now,
            taken: HashMap::new(),
            selected: Vec::with_capacity(query.quantity.min(64)),
        }
    }

    pub fn is_full(&self) -> bool {
        self.selected.len() >= self.query.quantity
    }

    /// Checks `request` against the round's constraints and keeps it if it
    /// fits.
    pub fn offer(&mut self, request: &CommandRequest) -> Result<(), Skip> {
        if self.is_full() {
            return Err(Skip::WindowFull);
        }
        if !request.is_visible_at(self.now) {
            return Err(Skip::NotVisible);
        }
        if let Some(batch) = &request.batch
            && self.query.excluded_batches.contains(batch)
        {
            return Err(Skip::Batch);
        }
        if self.query.excluded_work_types.contains(&request.work_type) {
            return Err(Skip::WorkType);
        }
        if request
            .preconditions
            .iter()
            .any(|name| self.query.blocked_preconditions.contains(name))
        {
            return Err(Skip::Precondition);
        }

        let tag = request.parallel_tag.as_str();
        let own = self.query.limit_for(request);
        let taken = self.taken.get(tag);
        let occupied = self.query.tag_inflight.get(tag).copied().unwrap_or(0)
            + taken.map_or(0, |t| t.count);
        let limit = tighter(
            tighter(own, self.query.running_limits.get(tag).copied()),
            taken.and_then(|t| t.limit),
        );
        if limit.is_some_and(|limit| occupied >= limit) {
            return Err(Skip::TagFull);
        }

        let entry = self.taken.entry(tag.to_owned()).or_default();
        entry.count += 1;
        entry.limit = tighter(entry.limit, own);
        self.selected.push(request.clone());
        Ok(())
    }

    pub fn into_selected(self) -> Vec<CommandRequest> {
        self.selected
    }
}
