//! Job queue reporting.

use std::collections::HashMap;

use berth_id::JobId;
use serde::{Deserialize, Serialize};

use super::{AllocateRequest, SchedulingState, TaskList};

/// Queue standing of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueueInfo {
    /// Jobs in front of this one; `-1` when the scheduler has no queue order.
    pub jobs_ahead: i64,
    /// Most advanced state among the job's requests.
    pub state: SchedulingState,
    pub requested_slots: usize,
    pub allocated_slots: usize,
}

/// Queued versus scheduled job counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued_count: usize,
    pub scheduled_count: usize,
}

/// Folds ordered requests into per-job queue info.
///
/// Jobs are numbered in order of first appearance. Requests that are not
/// user-visible are skipped.
pub fn reduce_to_job_q_info<'a, I>(requests: I) -> HashMap<JobId, JobQueueInfo>
where
    I: IntoIterator<Item = &'a AllocateRequest>,
{
    let mut jobs: HashMap<JobId, JobQueueInfo> = HashMap::new();
    let mut jobs_ahead = 0;

    for req in requests {
        if !req.is_user_visible {
            continue;
        }
        let info = jobs.entry(req.job_id.clone()).or_insert_with(|| {
            let info = JobQueueInfo {
                jobs_ahead,
                state: req.state,
                requested_slots: 0,
                allocated_slots: 0,
            };
            jobs_ahead += 1;
            info
        });

        info.requested_slots += req.slots_needed;
        if req.state.is_scheduled() {
            info.allocated_slots += req.slots_needed;
        }
        info.state = info.state.max(req.state);
    }

    jobs
}

/// Counts jobs by whether any of their requests is scheduled.
pub fn job_stats(task_list: &TaskList) -> QueueStats {
    let mut stats = QueueStats::default();
    for info in reduce_to_job_q_info(task_list.iter()).values() {
        if info.state == SchedulingState::Queued {
            stats.queued_count += 1;
        } else {
            stats.scheduled_count += 1;
        }
    }
    stats
}
