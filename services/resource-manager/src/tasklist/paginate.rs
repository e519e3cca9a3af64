//! Offset/limit paging over ordered query results.

use serde::{Deserialize, Serialize};

use super::{TaskListError, TaskListResult};

/// Resolved page bounds; `start_index..end_index` is the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: i64,
    pub limit: i64,
    pub total: usize,
    pub start_index: usize,
    pub end_index: usize,
}

/// Resolves a page of `total` entries.
///
/// A negative `offset` counts back from the end, clamped to the first entry.
/// A non-positive `limit` pages to the end.
pub fn paginate(total: usize, offset: i64, limit: i64) -> TaskListResult<Pagination> {
    let total_i = i64::try_from(total).unwrap_or(i64::MAX);

    let start = if offset < 0 {
        (total_i + offset).max(0)
    } else {
        offset
    };
    if start > total_i {
        return Err(TaskListError::OffsetOutOfRange { offset, total });
    }

    let end = if limit > 0 {
        start.saturating_add(limit).min(total_i)
    } else {
        total_i
    };

    Ok(Pagination {
        offset,
        limit,
        total,
        start_index: start as usize,
        end_index: end as usize,
    })
}
