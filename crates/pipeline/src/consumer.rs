//! Watch consumer: drains the change feed into the facade.

use std::sync::Arc;

use futures::StreamExt;
use kindex_feed::EventStream;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::facade::{ApplyOutcome, IndexFacade};
use crate::{PipelineError, WatchState};

/// Per-run tallies returned when the consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerReport {
    pub received: u64,
    pub applied: u64,
    pub stale: u64,
    pub dropped: u64,
}

/// Handle to a running watch consumer.
///
/// The consumer's result is never discarded: feed failures surface from
/// [`WatchHandle::join`] as `FeedSubscription` and in the facade's health.
#[derive(Debug)]
pub struct WatchHandle {
    join: JoinHandle<Result<ConsumerReport, PipelineError>>,
    cancel: CancellationToken,
}

impl WatchHandle {
    pub(crate) fn new(join: JoinHandle<Result<ConsumerReport, PipelineError>>, cancel: CancellationToken) -> Self {
        Self { join, cancel }
    }

    pub fn is_finished(&self) -> bool { self.join.is_finished() }

    pub fn cancel_token(&self) -> CancellationToken { self.cancel.clone() }

    /// Wait for the consumer to end on its own (feed closed or failed, or
    /// the governing token cancelled).
    pub async fn join(self) -> Result<ConsumerReport, PipelineError> {
        match self.join.await {
            Ok(res) => res,
            Err(e) => Err(PipelineError::FeedSubscription(format!("watch consumer task aborted: {e}"))),
        }
    }

    /// Cancel the consumer and wait for it to release the subscription.
    pub async fn stop(self) -> Result<ConsumerReport, PipelineError> {
        self.cancel.cancel();
        self.join().await
    }
}

pub(crate) async fn run(
    facade: Arc<IndexFacade>,
    mut stream: EventStream,
    cancel: CancellationToken,
) -> Result<ConsumerReport, PipelineError> {
    let scope = facade.scope().to_string();
    let mut report = ConsumerReport::default();
    info!(scope = %scope, "watch consumer started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(scope = %scope, received = report.received, "watch consumer cancelled");
                facade.set_watch(WatchState::Detached);
                return Ok(report);
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                report.received += 1;
                match facade.apply(&event) {
                    Ok(ApplyOutcome::Applied) => report.applied += 1,
                    Ok(ApplyOutcome::Stale) => report.stale += 1,
                    Ok(ApplyOutcome::OutOfScope) => {
                        debug!(kind = event.kind.as_str(), "event outside scope");
                        report.dropped += 1;
                    }
                    // One bad event never stalls the stream.
                    Err(e) => {
                        warn!(scope = %scope, kind = event.kind.as_str(), version = %event.version(), reason = e.reason(), error = %e, "event dropped");
                        report.dropped += 1;
                    }
                }
            }
            Some(Err(e)) => {
                let err = PipelineError::FeedSubscription(e.to_string());
                error!(scope = %scope, error = %e, "change feed failed; index no longer follows the source");
                metrics::counter!("kindex_feed_errors_total", 1u64);
                facade.set_watch(WatchState::Lost(err.to_string()));
                return Err(err);
            }
            None => {
                warn!(scope = %scope, received = report.received, "change feed closed");
                facade.set_watch(WatchState::Closed);
                return Ok(report);
            }
        }
    }
}
