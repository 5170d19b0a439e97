//! Polling sweep and queue draining
//!
//! The job queue normally delivers every dispatch. The sweep is the safety
//! net: it scans for `scheduled` entries that are already due and
//! dispatches them directly, which covers lost enqueues and jobs that
//! exhausted their retries while the store was unavailable.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::dispatch::Dispatcher;
use crate::error::{DispatchError, Result, SyndicastError};
use crate::queue::{DispatchJob, JobQueue, RetryPolicy};

/// Dispatches run concurrently per sweep or drain
const DISPATCH_CONCURRENCY: usize = 4;

/// Tally of one sweep or drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Candidates found (due entries or claimed jobs)
    pub found: usize,
    pub published: usize,
    /// Publish failures; the entries are now `failed`
    pub failed: usize,
    /// Refused by a guard: duplicate, stale or already terminal
    pub skipped: usize,
    /// Storage errors, including publishes whose outcome was not written
    pub errored: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &Result<String>) {
        match outcome {
            Ok(_) => self.published += 1,
            Err(SyndicastError::Dispatch(DispatchError::OutcomeNotRecorded { .. })) => {
                self.errored += 1
            }
            Err(SyndicastError::Dispatch(_)) => self.skipped += 1,
            Err(SyndicastError::Platform(_)) => self.failed += 1,
            Err(_) => self.errored += 1,
        }
    }
}

impl Dispatcher {
    /// Dispatch every `scheduled` entry with `scheduled_at <= now`
    pub async fn sweep_due(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let due = self.store().due_posts(now).await?;
        let mut report = DispatchReport {
            found: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        info!("Sweep found {} due post(s)", due.len());

        let jobs: Vec<_> = due
            .iter()
            .map(|d| DispatchJob::for_post(&d.article_id, d.index, &d.post))
            .collect();

        let outcomes: Vec<_> = stream::iter(jobs.iter())
            .map(|job| self.dispatch(job))
            .buffer_unordered(DISPATCH_CONCURRENCY)
            .collect()
            .await;

        for outcome in &outcomes {
            if let Err(e @ SyndicastError::Dispatch(_)) = outcome {
                debug!("sweep skipped: {}", e);
            }
            report.record(outcome);
        }
        Ok(report)
    }

    /// Claim due jobs from the queue, run them, and settle each one
    pub async fn drain_queue(
        &self,
        queue: &JobQueue,
        policy: RetryPolicy,
        now: DateTime<Utc>,
        batch: u32,
    ) -> Result<DispatchReport> {
        let claimed = queue.claim_due(now, batch).await?;
        let mut report = DispatchReport {
            found: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        info!("Claimed {} dispatch job(s)", claimed.len());

        let outcomes: Vec<_> = stream::iter(claimed.iter())
            .map(|queued| async move { (queued, self.dispatch(&queued.job).await) })
            .buffer_unordered(DISPATCH_CONCURRENCY)
            .collect()
            .await;

        for (queued, outcome) in &outcomes {
            report.record(outcome);
            let settled = match outcome {
                Ok(_) => queue.complete(&queued.id).await,
                Err(e) => {
                    let retry_at = policy.retry_at(e, queued.attempts, now);
                    match retry_at {
                        Some(at) => warn!(job_id = %queued.id, %at, "dispatch will be retried: {}", e),
                        None => debug!(job_id = %queued.id, "dispatch job finished with error: {}", e),
                    }
                    queue.fail(&queued.id, &e.to_string(), retry_at).await
                }
            };
            if let Err(e) = settled {
                error!(job_id = %queued.id, "could not update job: {}", e);
            }
        }
        Ok(report)
    }
}
