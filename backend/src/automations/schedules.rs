// Schedule Runner - fires automation invocations from template schedule
// items. Each live item becomes a cron job that invokes its template
// with a `schedule/<itemId>` source trail; the item's TTL is re-checked
// at fire time so an expired schedule stops firing without a restart.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use super::engine::{AutomationEngine, InvocationRequest};
use super::store::DurableStore;
use super::AutomationError;

pub struct ScheduleRunner {
    engine: Arc<AutomationEngine>,
    store: Arc<dyn DurableStore>,
}

impl ScheduleRunner {
    pub fn new(engine: Arc<AutomationEngine>, store: Arc<dyn DurableStore>) -> Self {
        Self { engine, store }
    }

    /// Register a cron job per live schedule item and start the
    /// scheduler. The returned handle keeps the jobs alive.
    pub async fn start(&self) -> Result<JobScheduler, AutomationError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AutomationError::Scheduler(e.to_string()))?;

        let items = self.store.list_schedule_items().await?;
        let mut registered = 0usize;
        for item in items {
            if !item.is_live(Utc::now()) {
                continue;
            }

            let engine = self.engine.clone();
            let item_for_job = item.clone();
            let job = Job::new_async(item.value.as_str(), move |_id, _scheduler| {
                let engine = engine.clone();
                let item = item_for_job.clone();
                Box::pin(async move {
                    if !item.is_live(Utc::now()) {
                        info!(item_id = %item.item_id, "schedule item expired, skipping fire");
                        return;
                    }
                    let request = InvocationRequest {
                        automation: Some(item.template_id.to_string()),
                        source: vec![format!("schedule/{}", item.item_id)],
                        data: Value::Null,
                        ..InvocationRequest::new(&item.tenant_id)
                    };
                    match engine.invoke(request).await {
                        Ok(run_id) => {
                            info!(item_id = %item.item_id, %run_id, "scheduled automation invoked")
                        }
                        Err(e) => {
                            error!(item_id = %item.item_id, error = %e, "scheduled invocation failed")
                        }
                    }
                })
            })
            .map_err(|e| {
                AutomationError::Scheduler(format!(
                    "schedule item {} has an invalid cron expression '{}': {}",
                    item.item_id, item.value, e
                ))
            })?;

            scheduler
                .add(job)
                .await
                .map_err(|e| AutomationError::Scheduler(e.to_string()))?;
            registered += 1;
        }

        if registered == 0 {
            warn!("no live schedule items registered");
        } else {
            info!(jobs = registered, "schedule runner started");
        }
        scheduler
            .start()
            .await
            .map_err(|e| AutomationError::Scheduler(e.to_string()))?;
        Ok(scheduler)
    }
}
