//! Chunk planning.
//!
//! Days that must be fetched are grouped into maximal contiguous runs and each
//! run is cut into chunks of at most `chunk_size_days`.

use chrono::{Days, NaiveDate};

use crate::model::FetchChunk;

/// Every calendar day in `start..=end`, in order. Empty when `start > end`.
pub fn requested_days(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

/// Group sorted, distinct `days` into contiguous runs.
pub fn contiguous_runs(days: &[NaiveDate]) -> Vec<FetchChunk> {
    let mut runs: Vec<FetchChunk> = Vec::new();
    for &day in days {
        match runs.last_mut() {
            Some(run) if run.end == day => run.end = day + Days::new(1),
            _ => runs.push(FetchChunk::single_day(day)),
        }
    }
    runs
}

/// Plan fetch chunks for the given must-fetch days.
///
/// With `range_queries` false the adapter ignores the time window, so each
/// contiguous run becomes a single chunk.
pub fn plan_chunks(days: &[NaiveDate], chunk_size_days: u32, range_queries: bool) -> Vec<FetchChunk> {
    let runs = contiguous_runs(days);
    if !range_queries {
        return runs;
    }

    let size = u64::from(chunk_size_days.max(1));
    let mut chunks = Vec::new();
    for run in runs {
        let mut start = run.start;
        while start < run.end {
            let end = (start + Days::new(size)).min(run.end);
            chunks.push(FetchChunk::new(start, end));
            start = end;
        }
    }
    chunks
}
