//! Fan-out of independent work units (block pairs, blocks) to workers.
//!
//! `work` runs on worker threads; `sink` always runs on the calling thread as
//! results arrive, so anything it touches (progress, checkpoint writes) stays
//! single-threaded. Workers poll the cancel token between units: a unit that
//! has started always runs to completion and its result reaches the sink.

use crate::error::MergeError;
use crossbeam_channel::unbounded;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

/// Cooperative interruption request shared by the controller, the executor
/// and whatever delivers the request (a signal handler, a test).
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for `signal_hook::flag::register`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Units handed to `work`.
    pub dispatched: usize,
    /// Units whose result reached the sink.
    pub completed: usize,
    pub cancelled: bool,
}

pub trait Executor: Sync {
    fn workers(&self) -> usize;

    /// Run `work` over `units`, feeding each `(unit index, result)` to `sink`.
    /// A sink error stops dispatch and is returned once in-flight units finish.
    fn execute<U, R, W, S>(
        &self,
        units: &[U],
        cancel: &CancelToken,
        work: W,
        sink: S,
    ) -> Result<ExecutionSummary, MergeError>
    where
        U: Sync,
        R: Send,
        W: Fn(&U) -> R + Sync,
        S: FnMut(usize, R) -> Result<(), MergeError>;
}

/// Worker threads on this machine.
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    workers: usize,
}

impl LocalExecutor {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1) }
    }
}

impl Executor for LocalExecutor {
    fn workers(&self) -> usize {
        self.workers
    }

    fn execute<U, R, W, S>(
        &self,
        units: &[U],
        cancel: &CancelToken,
        work: W,
        mut sink: S,
    ) -> Result<ExecutionSummary, MergeError>
    where
        U: Sync,
        R: Send,
        W: Fn(&U) -> R + Sync,
        S: FnMut(usize, R) -> Result<(), MergeError>,
    {
        if units.is_empty() {
            return Ok(ExecutionSummary { cancelled: cancel.is_cancelled(), ..Default::default() });
        }

        let (task_tx, task_rx) = unbounded::<usize>();
        for i in 0..units.len() {
            // The receiver is alive until the scope below ends.
            let _ = task_tx.send(i);
        }
        drop(task_tx);

        let (result_tx, result_rx) = unbounded::<(usize, R)>();
        let stop = AtomicBool::new(false);
        let dispatched = AtomicUsize::new(0);
        let mut completed = 0;
        let mut sink_error = None;

        thread::scope(|scope| {
            for _ in 0..self.workers.min(units.len()) {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let (work, stop, dispatched) = (&work, &stop, &dispatched);
                scope.spawn(move || {
                    while let Ok(i) = task_rx.recv() {
                        if cancel.is_cancelled() || stop.load(Ordering::Acquire) {
                            break;
                        }
                        dispatched.fetch_add(1, Ordering::Relaxed);
                        let result = work(&units[i]);
                        if result_tx.send((i, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for (i, result) in result_rx.iter() {
                completed += 1;
                if sink_error.is_some() {
                    continue;
                }
                if let Err(e) = sink(i, result) {
                    stop.store(true, Ordering::Release);
                    sink_error = Some(e);
                }
            }
        });

        if let Some(e) = sink_error {
            return Err(e);
        }
        Ok(ExecutionSummary {
            dispatched: dispatched.into_inner(),
            completed,
            cancelled: cancel.is_cancelled(),
        })
    }
}

/// Runs every unit inline on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialExecutor;

impl Executor for SerialExecutor {
    fn workers(&self) -> usize {
        1
    }

    fn execute<U, R, W, S>(
        &self,
        units: &[U],
        cancel: &CancelToken,
        work: W,
        mut sink: S,
    ) -> Result<ExecutionSummary, MergeError>
    where
        U: Sync,
        R: Send,
        W: Fn(&U) -> R + Sync,
        S: FnMut(usize, R) -> Result<(), MergeError>,
    {
        let mut summary = ExecutionSummary::default();
        for (i, unit) in units.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            summary.dispatched += 1;
            let result = work(unit);
            summary.completed += 1;
            sink(i, result)?;
        }
        summary.cancelled = cancel.is_cancelled();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_all<E: Executor>(executor: &E) -> Vec<(usize, u64)> {
        let units: Vec<u64> = (0..200).collect();
        let mut seen = Vec::new();
        let summary = executor
            .execute(&units, &CancelToken::new(), |&u| u * u, |i, r| {
                seen.push((i, r));
                Ok(())
            })
            .unwrap();
        assert_eq!(summary.completed, 200);
        assert_eq!(summary.dispatched, 200);
        assert!(!summary.cancelled);
        seen.sort();
        seen
    }

    #[test]
    fn test_every_unit_reaches_the_sink_once() {
        let expected: Vec<_> = (0..200u64).map(|u| (u as usize, u * u)).collect();
        assert_eq!(collect_all(&LocalExecutor::new(4)), expected);
        assert_eq!(collect_all(&SerialExecutor), expected);
    }

    #[test]
    fn test_cancel_stops_dispatch_after_running_unit() {
        let units: Vec<usize> = (0..50).collect();
        let cancel = CancelToken::new();
        let mut seen = Vec::new();
        let summary = LocalExecutor::new(1)
            .execute(
                &units,
                &cancel,
                |&u| {
                    if u == 5 {
                        cancel.cancel();
                    }
                    u
                },
                |i, _| {
                    seen.push(i);
                    Ok(())
                },
            )
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.completed, 6);
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_serial_cancel() {
        let units: Vec<usize> = (0..10).collect();
        let cancel = CancelToken::new();
        let summary = SerialExecutor
            .execute(&units, &cancel, |&u| u, |i, _| {
                if i == 2 {
                    cancel.cancel();
                }
                Ok(())
            })
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.completed, 3);
    }

    #[test]
    fn test_sink_error_is_returned() {
        let units: Vec<usize> = (0..100).collect();
        let result = LocalExecutor::new(3).execute(&units, &CancelToken::new(), |&u| u, |_, r| {
            if r == 10 {
                return Err(MergeError::Other("sink failed".to_string()));
            }
            Ok(())
        });
        assert!(matches!(result, Err(MergeError::Other(_))));
    }

    #[test]
    fn test_already_cancelled_runs_nothing() {
        let units = [1, 2, 3];
        let cancel = CancelToken::new();
        cancel.cancel();
        let summary = LocalExecutor::new(2)
            .execute(&units, &cancel, |&u| u, |_, _| Ok(()))
            .unwrap();
        assert_eq!(summary.dispatched, 0);
        assert!(summary.cancelled);
    }
}
