//! Agent loop: hands due tests to the executor one at a time and feeds run
//! outcomes back into the scheduler and the report sink.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::context::AgentContext;
use crate::executor::ExecutorEvent;
use crate::probes::ProbeError;
use crate::report::ReportSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Until shutdown.
    Forever,
    /// Until shutdown or the pending set is empty.
    UntilIdle,
}

/// Run the agent loop.  Returns the number of runs executed.
///
/// On exit the pending set is flushed to storage (batched mode only).
pub async fn run(ctx: &mut AgentContext, mode: RunMode) -> usize {
    let shutdown = ctx.shutdown_token();
    let poll = ctx.config.scheduler.poll_interval();
    let mut runs = 0;

    info!(pending = ctx.scheduler.len(), ?mode, "agent loop started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let now = Utc::now();
        if let Some(definition) = ctx.scheduler.take_next_due(now) {
            info!(test_id = %definition.id, probe = %definition.probe, "test due");
            let state = ctx.executor.execute(&definition).await;
            debug!(test_id = %definition.id, %state, "run ended");
            runs += 1;
            dispatch_executor_events(ctx);
            continue;
        }

        if mode == RunMode::UntilIdle && ctx.scheduler.is_empty() {
            break;
        }

        let wait = ctx
            .scheduler
            .next_due_instant()
            .map(|due| (due - now).to_std().unwrap_or(Duration::ZERO))
            .map_or(poll, |until_due| until_due.min(poll));

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    ctx.scheduler.flush();
    info!(
        runs,
        pending = ctx.scheduler.len(),
        traffic_available = ctx.provider.available_traffic(),
        "agent loop stopped"
    );
    runs
}

/// Route finished results to the report sink and completion feedback to the
/// scheduler.  Runs cancelled by shutdown stay pending so they are retried
/// after a restart.
pub(crate) fn dispatch_executor_events(ctx: &mut AgentContext) {
    while let Ok(event) = ctx.executor_events.try_recv() {
        match event {
            ExecutorEvent::StateChanged { .. } => {}
            ExecutorEvent::Finished { test_id, result } => {
                if !result.samples.is_empty() {
                    deliver(&mut ctx.reports, test_id, result);
                }
                ctx.scheduler.complete(&test_id, Utc::now());
            }
            ExecutorEvent::Failed {
                test_id,
                error: ProbeError::Cancelled,
            } => {
                warn!(test_id = %test_id, "run cancelled, test left pending");
            }
            ExecutorEvent::Failed { test_id, error } => {
                debug!(test_id = %test_id, error = %error, "failed run, re-arming per timing");
                ctx.scheduler.complete(&test_id, Utc::now());
            }
        }
    }
}

fn deliver(sink: &mut dyn ReportSink, test_id: uuid::Uuid, result: crate::report::MeasurementResult) {
    sink.submit(test_id, result);
}
