//! Fork-join over index ranges.
//!
//! A range is cut into contiguous chunks no smaller than the grain size. Every
//! chunk but the first is queued on the worker pool as a [`StackJob`]; the
//! first runs on the calling thread while the others are in flight. The caller
//! then waits on every chunk's signal, in chunk order, before looking at
//! failures. Each chunk runs inside a [`RegionGuard`] and captures its own
//! panic; the first captured panic wins and is resumed on the caller once all
//! chunks are done.

use alloc::vec::Vec;
use core::cmp;

use tracing::trace;

use crate::failure::FailureSlot;
use crate::job::StackJob;
use crate::region::RegionGuard;
use crate::unwind;
use crate::workers::WorkerPool;

// -----------------------------------------------------------------------------
// Chunk planning

/// How a range `[begin, end)` is divided among the participants of a pool.
///
/// Chunk `i` covers `[begin + i * chunk_size, min(end, begin + (i + 1) * chunk_size))`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    begin: i64,
    end: i64,
    chunk_size: u64,
    num_chunks: usize,
}

impl ChunkPlan {
    /// Plans a non-empty range. The grain size is a hard floor on the chunk
    /// size; otherwise the range is split evenly over `pool_size` chunks.
    pub fn new(begin: i64, end: i64, grain_size: u64, pool_size: usize) -> ChunkPlan {
        debug_assert!(begin < end);
        debug_assert!(pool_size > 0);
        let len = end.abs_diff(begin);
        let chunk_size = cmp::max(grain_size, len.div_ceil(pool_size as u64));
        let num_chunks = len.div_ceil(chunk_size) as usize;
        ChunkPlan {
            begin,
            end,
            chunk_size,
            num_chunks,
        }
    }

    /// Number of chunks, including the one run by the caller.
    #[inline]
    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    /// Number of indices per chunk; the last chunk may be shorter.
    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// The sub-range covered by chunk `task_id`.
    #[inline]
    pub fn bounds(&self, task_id: usize) -> (i64, i64) {
        debug_assert!(task_id < self.num_chunks);
        let start = self
            .begin
            .wrapping_add_unsigned(task_id as u64 * self.chunk_size);
        let len = cmp::min(self.end.abs_diff(start), self.chunk_size);
        (start, start.wrapping_add_unsigned(len))
    }
}

// -----------------------------------------------------------------------------
// Fork-join

/// Runs `body` over every chunk of `plan`, using `workers` for all chunks but
/// the first, and returns the chunk results in chunk order.
///
/// `arg` is called on the calling thread once per chunk to produce the extra
/// argument handed to that chunk (the reduction identity, for reductions).
///
/// If any chunk panics, this waits for every other chunk to finish and then
/// resumes the first captured panic.
pub fn fork_join<A, R, F>(
    workers: &WorkerPool,
    plan: &ChunkPlan,
    mut arg: impl FnMut() -> A,
    body: &F,
) -> Vec<R>
where
    F: Fn(i64, i64, A) -> R + Sync,
    A: Send,
    R: Send,
{
    trace!(
        "forking {} chunk(s) of {} indices",
        plan.num_chunks(),
        plan.chunk_size()
    );

    let failure = FailureSlot::new();

    let task = |task_id: usize, arg: A| -> Option<R> {
        let (start, end) = plan.bounds(task_id);
        let _region = RegionGuard::enter(task_id);
        match unwind::halt_unwinding(|| body(start, end, arg)) {
            Ok(value) => Some(value),
            Err(payload) => {
                failure.claim(payload);
                None
            }
        }
    };
    let task = &task;

    let first_arg = arg();
    let jobs: Vec<_> = (1..plan.num_chunks())
        .map(|task_id| {
            let arg = arg();
            StackJob::new(move || task(task_id, arg))
        })
        .collect();

    // From here until every signal is received, queued jobs point into this
    // stack frame. Unwinding out of it would free them while still queued.
    let abort_guard = unwind::AbortOnDrop;

    for job in &jobs {
        // SAFETY: `jobs` is not moved or modified until every signal has been
        // received below, and the closures only borrow data from this frame.
        // The abort guard makes sure the frame cannot unwind early.
        workers.submit(unsafe { job.as_job_ref() });
    }

    let mut results = Vec::with_capacity(plan.num_chunks());
    results.push(task(0, first_arg));

    for job in &jobs {
        // SAFETY: This thread is the only receiver of each job's signal.
        results.push(unsafe { job.signal().recv() });
    }

    core::mem::forget(abort_guard);
    drop(jobs);

    if let Some(payload) = failure.into_inner() {
        trace!("resuming panic captured in a chunk");
        unwind::resume_unwinding(payload);
    }

    // Without a failure every chunk produced a value.
    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn chunks(plan: &ChunkPlan) -> Vec<(i64, i64)> {
        (0..plan.num_chunks()).map(|id| plan.bounds(id)).collect()
    }

    #[test]
    fn chunks_partition_the_range() {
        for pool_size in 1..=9 {
            for grain in [0, 1, 3, 7, 100] {
                for (begin, end) in [(0, 10), (-5, 5), (3, 4), (0, 1000), (17, 1001)] {
                    let plan = ChunkPlan::new(begin, end, grain, pool_size);
                    let chunks = chunks(&plan);
                    assert_eq!(chunks.first().unwrap().0, begin);
                    assert_eq!(chunks.last().unwrap().1, end);
                    for window in chunks.windows(2) {
                        assert_eq!(window[0].1, window[1].0);
                    }
                    for &(start, stop) in &chunks {
                        assert!(start < stop);
                    }
                }
            }
        }
    }

    #[test]
    fn chunk_count_is_bounded_by_pool_size() {
        let plan = ChunkPlan::new(0, 1000, 0, 4);
        assert_eq!(plan.num_chunks(), 4);
        assert_eq!(plan.chunk_size(), 250);
    }

    #[test]
    fn grain_size_is_a_floor() {
        let plan = ChunkPlan::new(0, 10, 3, 8);
        assert_eq!(plan.chunk_size(), 3);
        assert_eq!(chunks(&plan), [(0, 3), (3, 6), (6, 9), (9, 10)]);
    }

    #[test]
    fn uneven_split_leaves_short_last_chunk() {
        let plan = ChunkPlan::new(0, 10, 0, 3);
        assert_eq!(chunks(&plan), [(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn extreme_bounds_do_not_overflow() {
        let plan = ChunkPlan::new(i64::MIN, i64::MAX, 0, 2);
        assert_eq!(plan.num_chunks(), 2);
        let chunks = chunks(&plan);
        assert_eq!(chunks[0].0, i64::MIN);
        assert_eq!(chunks[1].1, i64::MAX);
        assert_eq!(chunks[0].1, chunks[1].0);
    }

    #[test]
    fn fork_join_returns_results_in_chunk_order() {
        let workers = WorkerPool::new(crate::Role::IntraOp, 4);
        let plan = ChunkPlan::new(0, 100, 0, 4);
        let results = fork_join(&workers, &plan, || (), &|start: i64, end: i64, (): ()| {
            (start, end)
        });
        assert_eq!(results, chunks(&plan));
    }
}
