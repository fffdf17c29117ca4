//! Clock & Scheduler
//!
//! Single-threaded cooperative tick driver. One registered task runs to
//! completion before anything else is considered; ticks missed while a
//! task is in flight are coalesced (the next due time is computed from the
//! completion time, never queued). A stop signal interrupts at the next
//! suspension point; in-flight work finishes writing its outcome first.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use types::Result;

use crate::ports::Clock;

/// What a tick handler tells the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Stop scheduling and exit with the given process code.
    Stop(i32),
}

/// Boxed tick handler; each invocation gets a child cancellation token.
pub type TickHandler = Box<
    dyn FnMut(CancellationToken) -> Pin<Box<dyn Future<Output = Result<TickOutcome>> + Send>>
        + Send,
>;

struct TickTask {
    name: &'static str,
    /// Re-read every tick so period changes (emergency doubling) apply
    /// without re-registration.
    period: Box<dyn Fn() -> Duration + Send>,
    handler: TickHandler,
    next_due: DateTime<Utc>,
}

/// Cooperative driver for the cycle tick and maintenance tasks.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    tasks: Vec<TickTask>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            clock,
            cancel,
            tasks: Vec::new(),
        }
    }

    /// Register a periodic task. The first firing happens immediately on
    /// `run`; subsequent firings happen `period()` after each completion.
    pub fn register_tick(
        &mut self,
        name: &'static str,
        period: impl Fn() -> Duration + Send + 'static,
        handler: TickHandler,
    ) {
        let next_due = self.clock.now();
        self.tasks.push(TickTask {
            name,
            period: Box::new(period),
            handler,
            next_due,
        });
    }

    /// Drive registered tasks until a handler stops the loop or the cancel
    /// token fires. Returns the process exit code.
    pub async fn run(&mut self) -> Result<i32> {
        info!(tasks = self.tasks.len(), "scheduler started");
        loop {
            if self.cancel.is_cancelled() {
                info!("scheduler stopping on cancellation");
                return Ok(0);
            }

            let now = self.clock.now();
            let mut ran_any = false;
            for task in &mut self.tasks {
                if task.next_due > now {
                    continue;
                }
                ran_any = true;
                debug!(task = task.name, "tick");

                let outcome = (task.handler)(self.cancel.child_token()).await?;

                // Coalesce: schedule from completion, not from the missed
                // due times.
                let finished = self.clock.now();
                task.next_due = finished
                    + chrono::Duration::from_std((task.period)())
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));

                match outcome {
                    TickOutcome::Continue => {}
                    TickOutcome::Stop(code) => {
                        info!(task = task.name, code, "task requested stop");
                        return Ok(code);
                    }
                }

                if self.cancel.is_cancelled() {
                    info!("scheduler stopping on cancellation");
                    return Ok(0);
                }
            }

            if ran_any {
                continue;
            }

            // Sleep until the earliest due task or cancellation.
            let now = self.clock.now();
            let earliest = self
                .tasks
                .iter()
                .map(|t| t.next_due)
                .min()
                .unwrap_or(now + chrono::Duration::seconds(1));
            let wait = (earliest - now)
                .to_std()
                .unwrap_or(Duration::from_millis(0))
                .max(Duration::from_millis(10));

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("scheduler stopping on cancellation");
                    return Ok(0);
                }
                _ = self.clock.sleep(wait) => {}
            }
        }
    }
}
