// Run/Step Persistence Adapter - thin interface over the durable store,
// scoped by tenant. Status transitions use a compare-and-not-terminal
// write so a concurrent cancel and the orchestrator's own terminal write
// cannot clobber each other.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use relay_shared::{
    AutomationTemplate, Run, RunContext, RunStatus, ScheduleItem, StepRecord,
};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AutomationError;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn put_run(&self, run: &Run) -> Result<(), AutomationError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, AutomationError>;

    /// Latest non-terminal run carrying the given cancelation token.
    async fn find_run_by_token(
        &self,
        tenant_id: &str,
        token: &str,
    ) -> Result<Option<Run>, AutomationError>;

    /// Transition a run's status. With `expected_not_terminal` the write
    /// applies only while the current status is non-terminal; the return
    /// value reports whether the write took effect.
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        expected_not_terminal: bool,
    ) -> Result<bool, AutomationError>;

    async fn update_run_context(
        &self,
        run_id: Uuid,
        context: &RunContext,
    ) -> Result<(), AutomationError>;

    async fn put_steps(&self, steps: &[StepRecord]) -> Result<(), AutomationError>;

    /// Steps of a run in list-position order.
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, AutomationError>;

    async fn update_step(&self, step: &StepRecord) -> Result<(), AutomationError>;

    async fn put_template(&self, template: &AutomationTemplate) -> Result<(), AutomationError>;

    /// Look up a template by id or alias within a tenant.
    async fn get_template(
        &self,
        tenant_id: &str,
        template_ref: &str,
    ) -> Result<Option<AutomationTemplate>, AutomationError>;

    /// Schedule items across all tenants, for the schedule runner.
    async fn list_schedule_items(&self) -> Result<Vec<ScheduleItem>, AutomationError>;
}

/// In-memory store: the default when no database is configured, and the
/// backing store for the engine test suite.
#[derive(Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<Uuid, Run>>,
    steps: RwLock<HashMap<Uuid, Vec<StepRecord>>>,
    templates: RwLock<Vec<AutomationTemplate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put_run(&self, run: &Run) -> Result<(), AutomationError> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, AutomationError> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn find_run_by_token(
        &self,
        tenant_id: &str,
        token: &str,
    ) -> Result<Option<Run>, AutomationError> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|run| {
                run.tenant_id == tenant_id
                    && run.cancelation_token.as_deref() == Some(token)
                    && !run.status.is_terminal()
            })
            .max_by_key(|run| run.created_at)
            .cloned())
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        expected_not_terminal: bool,
    ) -> Result<bool, AutomationError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or(AutomationError::RunNotFound(run_id))?;
        if expected_not_terminal && run.status.is_terminal() {
            return Ok(false);
        }
        run.status = status;
        run.error = error;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_run_context(
        &self,
        run_id: Uuid,
        context: &RunContext,
    ) -> Result<(), AutomationError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or(AutomationError::RunNotFound(run_id))?;
        run.context = context.clone();
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn put_steps(&self, steps: &[StepRecord]) -> Result<(), AutomationError> {
        let mut store = self.steps.write().await;
        for step in steps {
            store.entry(step.run_id).or_default().push(step.clone());
        }
        Ok(())
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, AutomationError> {
        let mut steps = self
            .steps
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|step| step.position);
        Ok(steps)
    }

    async fn update_step(&self, step: &StepRecord) -> Result<(), AutomationError> {
        let mut store = self.steps.write().await;
        if let Some(steps) = store.get_mut(&step.run_id) {
            if let Some(existing) = steps.iter_mut().find(|s| s.step_id == step.step_id) {
                *existing = step.clone();
            }
        }
        Ok(())
    }

    async fn put_template(&self, template: &AutomationTemplate) -> Result<(), AutomationError> {
        let mut templates = self.templates.write().await;
        templates.retain(|t| {
            !(t.tenant_id == template.tenant_id && t.template_id == template.template_id)
        });
        templates.push(template.clone());
        Ok(())
    }

    async fn get_template(
        &self,
        tenant_id: &str,
        template_ref: &str,
    ) -> Result<Option<AutomationTemplate>, AutomationError> {
        let templates = self.templates.read().await;
        Ok(templates
            .iter()
            .find(|t| {
                t.tenant_id == tenant_id
                    && (t.template_id.to_string() == template_ref
                        || t.alias.as_deref() == Some(template_ref))
            })
            .cloned())
    }

    async fn list_schedule_items(&self) -> Result<Vec<ScheduleItem>, AutomationError> {
        let templates = self.templates.read().await;
        Ok(templates
            .iter()
            .flat_map(|t| t.schedule_items.iter().cloned())
            .collect())
    }
}

/// Postgres-backed store. Runs and steps live in their own tables; the
/// template definition is kept as a JSONB document alongside its lookup
/// columns.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    tenant_id: String,
    status: String,
    source: serde_json::Value,
    context: serde_json::Value,
    cancelation_token: Option<String>,
    error: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = AutomationError;

    fn try_from(row: RunRow) -> Result<Self, AutomationError> {
        let status = RunStatus::parse(&row.status)
            .ok_or_else(|| AutomationError::Store(format!("unknown run status '{}'", row.status)))?;
        Ok(Run {
            run_id: row.id,
            tenant_id: row.tenant_id,
            status,
            source: serde_json::from_value(row.source)
                .map_err(|e| AutomationError::Store(e.to_string()))?,
            context: serde_json::from_value(row.context)
                .map_err(|e| AutomationError::Store(e.to_string()))?,
            cancelation_token: row.cancelation_token,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    run_id: Uuid,
    tenant_id: String,
    position: i32,
    definition: serde_json::Value,
    status: String,
    output: Option<serde_json::Value>,
    skipped: bool,
    error: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<StepRow> for StepRecord {
    type Error = AutomationError;

    fn try_from(row: StepRow) -> Result<Self, AutomationError> {
        let status = relay_shared::StepStatus::parse(&row.status)
            .ok_or_else(|| AutomationError::Store(format!("unknown step status '{}'", row.status)))?;
        Ok(StepRecord {
            step_id: row.id,
            run_id: row.run_id,
            tenant_id: row.tenant_id,
            position: row.position,
            definition: serde_json::from_value(row.definition)
                .map_err(|e| AutomationError::Store(e.to_string()))?,
            status,
            output: row.output,
            skipped: row.skipped,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const RUN_COLUMNS: &str =
    "id, tenant_id, status, source, context, cancelation_token, error, created_at, updated_at";

#[async_trait]
impl DurableStore for PgStore {
    async fn put_run(&self, run: &Run) -> Result<(), AutomationError> {
        sqlx::query(
            r#"
            INSERT INTO automation_runs
            (id, tenant_id, status, source, context, cancelation_token, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.tenant_id)
        .bind(run.status.as_str())
        .bind(serde_json::to_value(&run.source)?)
        .bind(serde_json::to_value(&run.context)?)
        .bind(&run.cancelation_token)
        .bind(&run.error)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, AutomationError> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM automation_runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    async fn find_run_by_token(
        &self,
        tenant_id: &str,
        token: &str,
    ) -> Result<Option<Run>, AutomationError> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM automation_runs
            WHERE tenant_id = $1 AND cancelation_token = $2 AND status = 'processing'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(tenant_id)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        expected_not_terminal: bool,
    ) -> Result<bool, AutomationError> {
        let query = if expected_not_terminal {
            r#"
            UPDATE automation_runs
            SET status = $2, error = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#
        } else {
            r#"
            UPDATE automation_runs
            SET status = $2, error = $3, updated_at = NOW()
            WHERE id = $1
            "#
        };

        let result = sqlx::query(query)
            .bind(run_id)
            .bind(status.as_str())
            .bind(&error)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Distinguish a lost race from a missing run.
        match self.get_run(run_id).await? {
            Some(_) => Ok(false),
            None => Err(AutomationError::RunNotFound(run_id)),
        }
    }

    async fn update_run_context(
        &self,
        run_id: Uuid,
        context: &RunContext,
    ) -> Result<(), AutomationError> {
        sqlx::query(
            "UPDATE automation_runs SET context = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(run_id)
        .bind(serde_json::to_value(context)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_steps(&self, steps: &[StepRecord]) -> Result<(), AutomationError> {
        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO automation_run_steps
                (id, run_id, tenant_id, position, definition, status, output, skipped, error, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(step.step_id)
            .bind(step.run_id)
            .bind(&step.tenant_id)
            .bind(step.position)
            .bind(serde_json::to_value(&step.definition)?)
            .bind(step.status.as_str())
            .bind(&step.output)
            .bind(step.skipped)
            .bind(&step.error)
            .bind(step.created_at)
            .bind(step.updated_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, AutomationError> {
        let rows: Vec<StepRow> = sqlx::query_as(
            r#"
            SELECT id, run_id, tenant_id, position, definition, status, output,
                   skipped, error, created_at, updated_at
            FROM automation_run_steps
            WHERE run_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRecord::try_from).collect()
    }

    async fn update_step(&self, step: &StepRecord) -> Result<(), AutomationError> {
        sqlx::query(
            r#"
            UPDATE automation_run_steps
            SET status = $2, output = $3, skipped = $4, error = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(step.step_id)
        .bind(step.status.as_str())
        .bind(&step.output)
        .bind(step.skipped)
        .bind(&step.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_template(&self, template: &AutomationTemplate) -> Result<(), AutomationError> {
        sqlx::query(
            r#"
            INSERT INTO automation_templates (id, tenant_id, alias, definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE
            SET alias = EXCLUDED.alias, definition = EXCLUDED.definition, updated_at = NOW()
            "#,
        )
        .bind(template.template_id)
        .bind(&template.tenant_id)
        .bind(&template.alias)
        .bind(serde_json::to_value(template)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_template(
        &self,
        tenant_id: &str,
        template_ref: &str,
    ) -> Result<Option<AutomationTemplate>, AutomationError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT definition FROM automation_templates
            WHERE tenant_id = $1 AND (id::text = $2 OR alias = $2)
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(template_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(definition,)| {
            serde_json::from_value(definition).map_err(|e| AutomationError::Store(e.to_string()))
        })
        .transpose()
    }

    async fn list_schedule_items(&self) -> Result<Vec<ScheduleItem>, AutomationError> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT definition FROM automation_templates")
                .fetch_all(&self.pool)
                .await?;

        let mut items = Vec::new();
        for (definition,) in rows {
            let template: AutomationTemplate = serde_json::from_value(definition)
                .map_err(|e| AutomationError::Store(e.to_string()))?;
            items.extend(template.schedule_items);
        }
        Ok(items)
    }
}
