use ahash::AHashMap as HashMap;
use futures::FutureExt;
use gatekeeper_constraint_controller_k8s_api::Request;
use gatekeeper_constraint_controller_k8s_reconcile::Action;
use std::{fmt, future::Future, panic::AssertUnwindSafe, time::Duration};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, error, warn};

/// Hands requests to a [`Queue`].
#[derive(Clone, Debug)]
pub struct Scheduler(mpsc::UnboundedSender<Request>);

/// Runs reconciles with at most one in flight per request.
///
/// Requests that arrive while their key is in flight are coalesced into a
/// single rerun once it completes. Failed reconciles are retried with
/// exponential backoff, as are reconciles that panic.
#[derive(Debug)]
pub struct Queue {
    rx: mpsc::UnboundedReceiver<Request>,
    scheduler: Scheduler,
    backoff: Backoff,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

#[derive(Debug, Default)]
struct InFlight {
    dirty: bool,
}

pub fn channel(backoff: Backoff) -> (Scheduler, Queue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler(tx);
    let queue = Queue {
        rx,
        scheduler: scheduler.clone(),
        backoff,
    };
    (scheduler, queue)
}

// === impl Scheduler ===

impl Scheduler {
    pub fn schedule(&self, req: Request) {
        // The queue only stops during shutdown.
        let _ = self.0.send(req);
    }

    fn schedule_after(&self, req: Request, delay: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.schedule(req);
        });
    }
}

// === impl Backoff ===

impl Backoff {
    /// The delay before the retry following `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Records another failure of `req` and returns the delay before its retry.
    fn next(&self, failures: &mut HashMap<Request, u32>, req: &Request) -> Duration {
        let count = failures.entry(req.clone()).or_default();
        let delay = self.delay(*count);
        *count = count.saturating_add(1);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(300),
        }
    }
}

// === impl Queue ===

impl Queue {
    /// Processes requests until `shutdown` is signaled, then waits for
    /// in-flight reconciles to finish.
    pub async fn run<F, Fut, E>(self, reconcile: F, shutdown: drain::Watch)
    where
        F: Fn(Request) -> Fut,
        Fut: Future<Output = Result<Action, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let Self {
            mut rx,
            scheduler,
            backoff,
        } = self;
        let mut in_flight = HashMap::<Request, InFlight>::default();
        let mut failures = HashMap::<Request, u32>::default();
        let mut tasks = JoinSet::new();

        // Panics are caught inside the task so the request is never lost.
        let spawn = |tasks: &mut JoinSet<_>, req: Request| {
            let reconcile = AssertUnwindSafe(reconcile(req.clone())).catch_unwind();
            tasks.spawn(async move { (req, reconcile.await) });
        };

        let signaled = shutdown.signaled();
        tokio::pin!(signaled);

        loop {
            tokio::select! {
                release = &mut signaled => {
                    debug!(in_flight = tasks.len(), "Draining reconciles");
                    while tasks.join_next().await.is_some() {}
                    drop(release);
                    return;
                }

                Some(req) = rx.recv() => {
                    if let Some(entry) = in_flight.get_mut(&req) {
                        entry.dirty = true;
                        continue;
                    }
                    in_flight.insert(req.clone(), InFlight::default());
                    spawn(&mut tasks, req);
                }

                Some(joined) = tasks.join_next() => {
                    let (req, result) = match joined {
                        Ok(done) => done,
                        Err(error) => {
                            error!(%error, "Reconcile task failed");
                            continue;
                        }
                    };

                    let retry = match result {
                        Ok(Ok(Action::AwaitChange)) => {
                            failures.remove(&req);
                            None
                        }
                        Ok(Ok(Action::Requeue(after))) => {
                            failures.remove(&req);
                            Some(after)
                        }
                        Ok(Err(error)) => {
                            let delay = backoff.next(&mut failures, &req);
                            warn!(%req, %error, ?delay, "Reconcile failed");
                            Some(delay)
                        }
                        Err(_) => {
                            let delay = backoff.next(&mut failures, &req);
                            error!(%req, ?delay, "Reconcile panicked");
                            Some(delay)
                        }
                    };

                    let rerun = in_flight.get(&req).is_some_and(|e| e.dirty);
                    if rerun {
                        // The rerun observes anything the retry would.
                        in_flight.insert(req.clone(), InFlight::default());
                        spawn(&mut tasks, req);
                    } else {
                        in_flight.remove(&req);
                        if let Some(delay) = retry {
                            scheduler.schedule_after(req, delay);
                        }
                    }
                }
            }
        }
    }
}
