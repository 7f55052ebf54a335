//! Supervisor - drives a task-source in a cancellable loop.
//!
//! The supervisor knows nothing about what the task-source does. It calls
//! [`Workable::work`] over and over, and coordinates a graceful stop:
//!
//! 1. `shutdown` cancels the work token and sends a handshake request.
//! 2. The loop picks the request up between two steps, runs the task-source's
//!    teardown hook and acknowledges through a oneshot.
//!
//! Parent cancellation takes the same exit, without a requester to answer.
//!
//! # State machine
//! `Idle -> Running -> ShuttingDown -> Stopped (== Idle)`

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::domain::{SupervisorError, WorkError};

/// Capability set of a task-source driven by a [`Supervisor`].
///
/// `work` performs a single step. It is never called concurrently with itself,
/// so implementors can keep plain mutable state. A step should block briefly on
/// its own (timer, channel) and return promptly once `cancel` fires: the
/// supervisor adds no pacing.
#[async_trait]
pub trait Workable: Send {
    fn name(&self) -> &str;

    /// One-time startup hook, run before the first step.
    async fn start(&mut self) -> Result<(), WorkError> {
        Ok(())
    }

    async fn work(&mut self, cancel: &CancellationToken);

    /// Teardown hook, run once the loop has stopped stepping.
    async fn shutdown(&mut self) -> Result<(), WorkError> {
        Ok(())
    }
}

type Ack = oneshot::Sender<Result<(), WorkError>>;

#[derive(Default)]
struct RunState {
    /// Bumped by every `run`; lets a finished run clear only its own state.
    generation: u64,
    running: bool,
    cancel: Option<CancellationToken>,
    /// Taken by the first `shutdown` call. At most one request is ever sent.
    shutdown_tx: Option<mpsc::Sender<Ack>>,
}

enum Stop {
    Parent,
    Requested(Option<Ack>),
}

/// Generic work supervisor. See the module docs.
pub struct Supervisor<W> {
    name: String,
    state: Mutex<RunState>,
    workable: tokio::sync::Mutex<W>,
}

impl<W: Workable> Supervisor<W> {
    pub fn new(workable: W) -> Self {
        Self {
            name: workable.name().to_string(),
            state: Mutex::new(RunState::default()),
            workable: tokio::sync::Mutex::new(workable),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Run the work loop until shutdown or `parent` cancellation.
    ///
    /// Returns [`SupervisorError::AlreadyRunning`] if another `run` is active.
    pub async fn run(&self, parent: &CancellationToken) -> Result<(), SupervisorError> {
        let (generation, work, shutdown_rx) = {
            let mut state = self.lock_state();
            if state.running {
                return Err(SupervisorError::AlreadyRunning {
                    name: self.name.clone(),
                });
            }
            let work = parent.child_token();
            let (tx, rx) = mpsc::channel(1);
            state.generation += 1;
            state.running = true;
            state.cancel = Some(work.clone());
            state.shutdown_tx = Some(tx);
            (state.generation, work, rx)
        };
        let _guard = RunGuard {
            state: &self.state,
            generation,
        };

        let span = info_span!("worker", name = %self.name);
        self.drive(generation, parent, work, shutdown_rx)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        generation: u64,
        parent: &CancellationToken,
        work: CancellationToken,
        mut shutdown_rx: mpsc::Receiver<Ack>,
    ) -> Result<(), SupervisorError> {
        let mut workable = self.workable.lock().await;
        if let Err(e) = workable.start().await {
            warn!(error = %e, "worker start hook failed");
            return Err(SupervisorError::Startup(e));
        }
        info!("worker started");

        let stop = loop {
            if parent.is_cancelled() {
                break Stop::Parent;
            }
            match shutdown_rx.try_recv() {
                Ok(ack) => break Stop::Requested(Some(ack)),
                Err(TryRecvError::Disconnected) => break Stop::Requested(None),
                Err(TryRecvError::Empty) => {}
            }
            if work.is_cancelled() {
                // The handshake request is on its way; wait for it instead of spinning.
                tokio::select! {
                    _ = parent.cancelled() => {}
                    request = shutdown_rx.recv() => break Stop::Requested(request),
                }
                continue;
            }
            workable.work(&work).await;
        };

        work.cancel();
        let result = workable.shutdown().await;
        if let Err(e) = &result {
            warn!(error = %e, "worker shutdown hook failed");
        }

        reset(&self.state, generation);
        let pending = match stop {
            Stop::Requested(ack) => ack,
            // A shutdown call may have raced with the parent cancellation.
            Stop::Parent => shutdown_rx.try_recv().ok(),
        };
        info!("worker stopped");

        match pending {
            Some(ack) => {
                if let Err(Err(e)) = ack.send(result) {
                    return Err(SupervisorError::Teardown(e));
                }
                Ok(())
            }
            None => result.map_err(SupervisorError::Teardown),
        }
    }

    /// Stop the loop and wait for its acknowledgment, or for `ctx` to be cancelled.
    ///
    /// No-op when the supervisor is idle or a shutdown is already pending. When
    /// `ctx` fires first the loop is not forced to stop: it will observe the
    /// cancelled work token on its next step.
    pub async fn shutdown(&self, ctx: &CancellationToken) -> Result<(), SupervisorError> {
        self.shutdown_until(ctx.cancelled(), || SupervisorError::ShutdownCancelled)
            .await
    }

    /// Like [`Supervisor::shutdown`], bounded by a deadline.
    pub async fn shutdown_timeout(&self, timeout: Duration) -> Result<(), SupervisorError> {
        self.shutdown_until(tokio::time::sleep(timeout), || {
            SupervisorError::ShutdownTimeout(timeout)
        })
        .await
    }

    async fn shutdown_until<F>(
        &self,
        interrupted: F,
        on_interrupt: impl FnOnce() -> SupervisorError,
    ) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let ack_rx = {
            let mut state = self.lock_state();
            if !state.running {
                return Ok(());
            }
            let Some(tx) = state.shutdown_tx.take() else {
                return Ok(());
            };
            if let Some(cancel) = &state.cancel {
                cancel.cancel();
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.try_send(ack_tx).is_err() {
                // The loop is gone already.
                return Ok(());
            }
            ack_rx
        };

        tokio::select! {
            ack = ack_rx => match ack {
                Ok(result) => result.map_err(SupervisorError::Teardown),
                Err(_) => Ok(()),
            },
            () = interrupted => Err(on_interrupt()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Workable + 'static> Supervisor<W> {
    /// Drive the loop on its own tokio task.
    pub fn spawn(
        self: Arc<Self>,
        parent: CancellationToken,
    ) -> JoinHandle<Result<(), SupervisorError>> {
        tokio::spawn(async move { self.run(&parent).await })
    }
}

fn reset(state: &Mutex<RunState>, generation: u64) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.generation != generation || !state.running {
        return;
    }
    if let Some(cancel) = state.cancel.take() {
        cancel.cancel();
    }
    state.running = false;
    state.shutdown_tx = None;
}

/// Clears the run state if the `run` future ends early (error or drop).
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
    generation: u64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        reset(self.state, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        steps: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    /// Task-source that sleeps a little per step and counts hook calls.
    struct Probe {
        counters: Arc<Counters>,
        fail_start: bool,
        fail_shutdown: bool,
        ignore_cancel_for: Option<Duration>,
    }

    impl Probe {
        fn new() -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            let probe = Self {
                counters: counters.clone(),
                fail_start: false,
                fail_shutdown: false,
                ignore_cancel_for: None,
            };
            (probe, counters)
        }
    }

    #[async_trait]
    impl Workable for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        async fn start(&mut self) -> Result<(), WorkError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(WorkError::Other("no database".to_string()));
            }
            Ok(())
        }

        async fn work(&mut self, cancel: &CancellationToken) {
            self.counters.steps.fetch_add(1, Ordering::SeqCst);
            if let Some(stuck) = self.ignore_cancel_for {
                tokio::time::sleep(stuck).await;
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }
        }

        async fn shutdown(&mut self) -> Result<(), WorkError> {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown {
                return Err(WorkError::Other("flush failed".to_string()));
            }
            Ok(())
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn shutdown_on_idle_supervisor_is_a_noop() {
        let (probe, counters) = Probe::new();
        let sup = Supervisor::new(probe);

        sup.shutdown(&CancellationToken::new()).await.unwrap();
        assert!(!sup.is_running());
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_steps_until_shutdown_handshake() {
        let (probe, counters) = Probe::new();
        let sup = Arc::new(Supervisor::new(probe));
        let handle = sup.clone().spawn(CancellationToken::new());

        wait_until(|| counters.steps.load(Ordering::SeqCst) >= 3).await;
        assert!(sup.is_running());

        sup.shutdown_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(!sup.is_running());
        handle.await.unwrap().unwrap();

        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_runs_have_exactly_one_winner() {
        let (probe, counters) = Probe::new();
        let sup = Supervisor::new(probe);
        let parent = CancellationToken::new();

        let (first, second, ()) = tokio::join!(sup.run(&parent), sup.run(&parent), async {
            wait_until(|| counters.steps.load(Ordering::SeqCst) >= 1).await;
            sup.shutdown_timeout(Duration::from_secs(1)).await.unwrap();
        });

        let results = [first, second];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let already = results
            .iter()
            .filter(|r| matches!(r, Err(SupervisorError::AlreadyRunning { name }) if name == "probe"))
            .count();
        assert_eq!((ok, already), (1, 1));
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_loop_and_runs_teardown() {
        let (probe, counters) = Probe::new();
        let sup = Arc::new(Supervisor::new(probe));
        let parent = CancellationToken::new();
        let handle = sup.clone().spawn(parent.clone());

        wait_until(|| counters.steps.load(Ordering::SeqCst) >= 1).await;
        parent.cancel();

        handle.await.unwrap().unwrap();
        assert!(!sup.is_running());
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);

        // Shutdown after the loop stopped on its own is a no-op.
        sup.shutdown_timeout(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn failing_start_hook_leaves_supervisor_idle() {
        let (mut probe, counters) = Probe::new();
        probe.fail_start = true;
        let sup = Supervisor::new(probe);

        let err = sup.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Startup(_)));
        assert!(!sup.is_running());
        assert_eq!(counters.steps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn teardown_error_reaches_shutdown_caller() {
        let (mut probe, _counters) = Probe::new();
        probe.fail_shutdown = true;
        let sup = Arc::new(Supervisor::new(probe));
        let handle = sup.clone().spawn(CancellationToken::new());
        wait_until(|| sup.is_running()).await;

        let err = sup
            .shutdown_timeout(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Teardown(WorkError::Other(ref m)) if m == "flush failed"));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_times_out_without_stopping_a_stuck_step() {
        let (mut probe, counters) = Probe::new();
        probe.ignore_cancel_for = Some(Duration::from_millis(200));
        let sup = Arc::new(Supervisor::new(probe));
        let handle = sup.clone().spawn(CancellationToken::new());
        wait_until(|| counters.steps.load(Ordering::SeqCst) >= 1).await;

        let err = sup
            .shutdown_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ShutdownTimeout(_)));
        assert!(sup.is_running());

        // The loop still finishes once the step returns.
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap()
            .unwrap();
        assert!(!sup.is_running());
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_cancelled_by_caller_context() {
        let (mut probe, counters) = Probe::new();
        probe.ignore_cancel_for = Some(Duration::from_millis(200));
        let sup = Arc::new(Supervisor::new(probe));
        let handle = sup.clone().spawn(CancellationToken::new());
        wait_until(|| counters.steps.load(Ordering::SeqCst) >= 1).await;

        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = sup.shutdown(&ctx).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ShutdownCancelled));

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn supervisor_can_be_restarted_after_shutdown() {
        let (probe, counters) = Probe::new();
        let sup = Arc::new(Supervisor::new(probe));

        for round in 1..=2 {
            let handle = sup.clone().spawn(CancellationToken::new());
            wait_until(|| sup.is_running()).await;
            sup.shutdown_timeout(Duration::from_secs(1)).await.unwrap();
            handle.await.unwrap().unwrap();
            assert_eq!(counters.starts.load(Ordering::SeqCst), round);
        }
    }

    #[tokio::test]
    async fn dropping_run_future_clears_state() {
        let (probe, _counters) = Probe::new();
        let sup = Arc::new(Supervisor::new(probe));
        let handle = sup.clone().spawn(CancellationToken::new());
        wait_until(|| sup.is_running()).await;

        handle.abort();
        let _ = handle.await;

        assert!(!sup.is_running());
        sup.shutdown_timeout(Duration::from_millis(10)).await.unwrap();
    }
}
