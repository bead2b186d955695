//! Background execution of analysis runs with cooperative cancellation.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::Error;

// -------------------------------------------------------------------------------------------------

/// Shared flag to cooperatively cancel a running analysis.
///
/// Analyzers check the token once per processed frame and abort without publishing anything
/// when it got cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Can't be undone: create a new token for the next run.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// -------------------------------------------------------------------------------------------------

fn ignore_progress(_progress: f64) {}

/// Maps an analyzer's local `0.0..=1.0` progress into a sub range of a global progress range,
/// so multiple analysis stages can report one unified progress value.
#[derive(Clone, Copy)]
pub struct Progress<'a> {
    start: f64,
    end: f64,
    report: &'a dyn Fn(f64),
}

impl<'a> Progress<'a> {
    /// Create a new progress range which reports mapped values to the given function.
    pub fn new(start: f64, end: f64, report: &'a dyn Fn(f64)) -> Self {
        debug_assert!(start <= end, "Invalid progress range");
        Self { start, end, report }
    }

    /// A progress range which reports nothing.
    pub fn none() -> Progress<'static> {
        Progress::new(0.0, 1.0, &ignore_progress)
    }

    /// Report local progress in range `0.0..=1.0`.
    pub fn update(&self, fraction: f64) {
        (self.report)(self.start + (self.end - self.start) * fraction.clamp(0.0, 1.0));
    }

    /// Create a nested range which covers the given local fraction of this range.
    pub fn sub_range(&self, from: f64, to: f64) -> Progress<'a> {
        let span = self.end - self.start;
        Progress::new(self.start + span * from, self.start + span * to, self.report)
    }
}

// -------------------------------------------------------------------------------------------------

/// Owns at most one running background analysis thread.
///
/// Spawning a new run first cancels and joins the previous one, waiting at most
/// [`Self::JOIN_TIMEOUT`] for it to finish.
pub struct AnalysisTask {
    name: &'static str,
    running: Option<RunningTask>,
}

struct RunningTask {
    token: CancellationToken,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl AnalysisTask {
    pub const JOIN_TIMEOUT: Duration = Duration::from_millis(4000);

    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: None,
        }
    }

    /// True while a spawned run did not yet finish.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Cancel a running task, then run the given function in a new background thread.
    pub fn spawn<F>(&mut self, run: F) -> Result<(), Error>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        self.cancel();

        let token = CancellationToken::new();
        let (done_send, done) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name(format!("grainbow_{}", self.name))
            .spawn({
                let token = token.clone();
                move || {
                    run(token);
                    let _ = done_send.send(());
                }
            })
            .map_err(|err| Error::ThreadError(format!("failed to spawn {}: {err}", self.name)))?;

        self.running = Some(RunningTask {
            token,
            done,
            handle,
        });
        Ok(())
    }

    /// Request cancellation of a running task and wait for it to finish.
    pub fn cancel(&mut self) {
        if let Some(task) = self.running.take() {
            task.token.cancel();
            Self::join(self.name, task, Self::JOIN_TIMEOUT);
        }
    }

    /// Wait for a running task to finish without cancelling it.
    pub fn wait(&mut self, timeout: Duration) {
        if let Some(task) = self.running.take() {
            Self::join(self.name, task, timeout);
        }
    }

    fn join(name: &str, task: RunningTask, timeout: Duration) {
        match task.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if task.handle.join().is_err() {
                    log::error!("Analysis thread '{name}' panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Analysis thread '{name}' did not finish within {}ms, detaching it",
                    timeout.as_millis()
                );
            }
        }
    }
}

impl Drop for AnalysisTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

// -------------------------------------------------------------------------------------------------
