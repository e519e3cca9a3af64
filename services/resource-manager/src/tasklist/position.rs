//! Manual queue ordering.
//!
//! Every user-visible job of a priority pool carries a `QueuePosition`. Jobs
//! of equal priority are scheduled in position order, and moving a job means
//! writing a new position strictly between two neighbours.
//!
//! Positions are fixed-point: one microsecond of submission time is
//! `TICKS_PER_MICRO` ticks, so a fresh job sits at its submission instant and
//! roughly thirty halvings fit between two adjacent microseconds.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use berth_id::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AllocateRequest, Group, TaskList, TaskListError, TaskListResult};

const TICKS_PER_MICRO: i128 = 1_000_000_000;
const FRACTION_DIGITS: usize = 9;

// =============================================================================
// QueuePosition
// =============================================================================

/// Totally ordered fractional queue key.
///
/// Renders as a decimal number of microseconds with up to nine fraction
/// digits, e.g. `1700000000000000.5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueuePosition(i128);

impl QueuePosition {
    /// Sentinel in front of every real job.
    pub const HEAD: QueuePosition = QueuePosition(0);
    /// Sentinel behind every real job.
    pub const TAIL: QueuePosition = QueuePosition(i128::MAX);

    /// Initial position of a job, derived from its submission time.
    pub fn from_submission_time(time: DateTime<Utc>) -> Self {
        Self(i128::from(time.timestamp_micros()) * TICKS_PER_MICRO)
    }

    /// A position strictly between `anchor` and `second`.
    ///
    /// `ahead` is true when `second` lies in front of `anchor`. The midpoint
    /// is used when it separates both sides; otherwise the position one tick
    /// past `anchor` towards `second`. Fails once the gap is exhausted.
    pub fn between(anchor: Self, second: Self, ahead: bool) -> TaskListResult<Self> {
        let (a, b) = (anchor.0, second.0);
        let mid = a / 2 + b / 2 + (a % 2 + b % 2) / 2;

        let candidate = if mid == a || mid == b {
            let nudged = if ahead { a.checked_sub(1) } else { a.checked_add(1) };
            nudged.ok_or(TaskListError::PositionExhausted(anchor, second))?
        } else {
            mid
        };

        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        if lo < candidate && candidate < hi {
            Ok(Self(candidate))
        } else {
            Err(TaskListError::PositionExhausted(anchor, second))
        }
    }
}

impl fmt::Display for QueuePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let ticks = TICKS_PER_MICRO as u128;
        let (whole, frac) = (abs / ticks, abs % ticks);
        if frac == 0 {
            return write!(f, "{sign}{whole}");
        }
        let digits = format!("{frac:0width$}", width = FRACTION_DIGITS);
        write!(f, "{sign}{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for QueuePosition {
    type Err = TaskListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TaskListError::InvalidPosition(s.to_string());

        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = body.split_once('.').unwrap_or((body, ""));
        if whole.is_empty()
            || frac.len() > FRACTION_DIGITS
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: i128 = whole.parse().map_err(|_| invalid())?;
        let frac: i128 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<width$}", width = FRACTION_DIGITS);
            padded.parse().map_err(|_| invalid())?
        };

        let ticks = whole
            .checked_mul(TICKS_PER_MICRO)
            .and_then(|t| t.checked_add(frac))
            .ok_or_else(invalid)?;
        Ok(Self(if negative { -ticks } else { ticks }))
    }
}

impl TryFrom<String> for QueuePosition {
    type Error = TaskListError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<QueuePosition> for String {
    fn from(value: QueuePosition) -> Self {
        value.to_string()
    }
}

// =============================================================================
// JobSortState
// =============================================================================

/// Queue position of every positioned job in a pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSortState {
    positions: HashMap<JobId, QueuePosition>,
}

impl JobSortState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &JobId) -> Option<QueuePosition> {
        self.positions.get(job_id).copied()
    }

    /// The job's position, with unpositioned jobs at `HEAD`.
    pub fn position_or_head(&self, job_id: &JobId) -> QueuePosition {
        self.get(job_id).unwrap_or(QueuePosition::HEAD)
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.positions.contains_key(job_id)
    }

    pub fn insert(&mut self, job_id: JobId, position: QueuePosition) -> Option<QueuePosition> {
        self.positions.insert(job_id, position)
    }

    pub fn remove(&mut self, job_id: &JobId) -> Option<QueuePosition> {
        self.positions.remove(job_id)
    }

    /// Positions a job by its submission time unless it already has one.
    pub fn initialize(&mut self, job_id: JobId, submitted: DateTime<Utc>) -> QueuePosition {
        *self
            .positions
            .entry(job_id)
            .or_insert_with(|| QueuePosition::from_submission_time(submitted))
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Position of an anchor, sentinels included.
    pub fn anchor_position(&self, anchor: &Anchor) -> QueuePosition {
        match anchor {
            Anchor::Head => QueuePosition::HEAD,
            Anchor::Tail => QueuePosition::TAIL,
            Anchor::Job(job_id) => self.position_or_head(job_id),
        }
    }

    /// Moves a job between `anchor` and `second` and returns its new position.
    pub fn set_job_position(
        &mut self,
        job_id: &JobId,
        anchor: &Anchor,
        second: &Anchor,
        ahead: bool,
    ) -> TaskListResult<QueuePosition> {
        let position = QueuePosition::between(self.anchor_position(anchor), self.anchor_position(second), ahead)?;
        self.positions.insert(job_id.clone(), position);
        Ok(position)
    }

    /// Reinstates a position persisted before a restart.
    pub fn recover_job_position(&mut self, job_id: JobId, position: QueuePosition) {
        self.positions.insert(job_id, position);
    }
}

impl FromIterator<(JobId, QueuePosition)> for JobSortState {
    fn from_iter<T: IntoIterator<Item = (JobId, QueuePosition)>>(iter: T) -> Self {
        Self {
            positions: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Ordering
// =============================================================================

/// A reference point for moving a job in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    Head,
    Tail,
    Job(JobId),
}

/// Result of locating the second anchor of a move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorMatch {
    /// The moved job must first take the anchor's priority.
    pub prio_change: bool,
    /// The job adjacent to the anchor on the side the job moves to.
    pub second_anchor: Anchor,
    pub anchor_priority: i32,
}

fn group_priority(groups: &HashMap<JobId, Group>, job_id: &JobId) -> TaskListResult<i32> {
    groups
        .get(job_id)
        .ok_or_else(|| TaskListError::MissingGroup(job_id.clone()))?
        .priority
        .ok_or_else(|| TaskListError::MissingPriority(job_id.clone()))
}

/// Requests ordered by priority, then queue position, then arrival.
///
/// Requests of unpositioned jobs sort behind positioned ones of the same
/// priority, in arrival order.
pub fn sort_tasks_with_position<'a>(
    task_list: &'a TaskList,
    groups: &HashMap<JobId, Group>,
    positions: &JobSortState,
) -> TaskListResult<Vec<&'a AllocateRequest>> {
    let mut keyed = Vec::with_capacity(task_list.len());
    for (arrival, req) in task_list.iter().enumerate() {
        let priority = group_priority(groups, &req.job_id)?;
        let position = positions.get(&req.job_id).unwrap_or(QueuePosition::TAIL);
        keyed.push(((priority, position, arrival), req));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, req)| req).collect())
}

/// Finds the job on the far side of `anchor_id` for a move of `job_id`.
pub fn find_anchor(
    job_id: &JobId,
    anchor_id: &JobId,
    ahead: bool,
    task_list: &TaskList,
    groups: &HashMap<JobId, Group>,
    positions: &JobSortState,
) -> TaskListResult<AnchorMatch> {
    let mut jobs: Vec<&JobId> = Vec::new();
    for req in sort_tasks_with_position(task_list, groups, positions)? {
        if !jobs.contains(&&req.job_id) {
            jobs.push(&req.job_id);
        }
    }

    let index = jobs
        .iter()
        .position(|j| *j == anchor_id)
        .ok_or_else(|| TaskListError::JobNotFound(anchor_id.clone()))?;

    let second_anchor = if ahead {
        index
            .checked_sub(1)
            .map(|i| Anchor::Job(jobs[i].clone()))
            .unwrap_or(Anchor::Head)
    } else {
        jobs.get(index + 1)
            .map(|j| Anchor::Job((*j).clone()))
            .unwrap_or(Anchor::Tail)
    };

    let anchor_priority = group_priority(groups, anchor_id)?;
    let job_priority = group_priority(groups, job_id)?;

    Ok(AnchorMatch {
        prio_change: job_priority != anchor_priority,
        second_anchor,
        anchor_priority,
    })
}

/// False when the job already sits between the two anchors on the requested side.
pub fn need_move(
    job: QueuePosition,
    anchor: QueuePosition,
    second: QueuePosition,
    ahead: bool,
) -> bool {
    if ahead {
        !(second < job && job < anchor)
    } else {
        !(anchor < job && job < second)
    }
}
