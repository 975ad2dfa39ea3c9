// Automation Engine - orchestrates automation runs: materializes the
// step list, validates the definition before anything is persisted, then
// walks the steps in order, publishing refs into the run context as it
// goes. Runs suspend on delay steps and are resumed by the scheduler;
// cancelation races are settled by the store's compare-and-not-terminal
// status write.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_shared::{
    Field, MergeStrategy, Run, RunContext, RunStatus, StepAction, StepDefinition, StepRecord,
    StepStatus,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::accessor;
use super::conditions;
use super::cycle;
use super::pipeline::{PipelineRequest, ProfileService, SendPipeline};
use super::scheduler::{self, RunScheduler};
use super::store::DurableStore;
use super::templates::TemplateRenderer;
use super::AutomationError;

/// Everything needed to start a run: either a stored template reference
/// or an inline step list, plus the initial context.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub tenant_id: String,
    /// Stored automation template id or alias to render. When set,
    /// inline `steps` are ignored.
    pub automation: Option<String>,
    pub steps: Vec<StepDefinition>,
    /// Root-level defaults layered underneath every step.
    pub defaults: Option<Value>,
    pub data: Value,
    pub profile: Value,
    pub recipient: Value,
    /// Default message template for send steps, exposed to accessors as
    /// the `template` context member.
    pub template: Value,
    pub brand: Value,
    /// Invocation trail, e.g. `["invoke/welcome-series"]`.
    pub source: Vec<String>,
    pub cancelation_token: Option<String>,
}

impl InvocationRequest {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            automation: None,
            steps: Vec::new(),
            defaults: None,
            data: Value::Null,
            profile: Value::Null,
            recipient: Value::Null,
            template: Value::Null,
            brand: Value::Null,
            source: Vec::new(),
            cancelation_token: None,
        }
    }
}

enum StepOutcome {
    Continue(Value),
    Suspend(DateTime<Utc>),
}

pub struct AutomationEngine {
    store: Arc<dyn DurableStore>,
    pipeline: Arc<dyn SendPipeline>,
    profiles: Arc<dyn ProfileService>,
    renderer: Arc<dyn TemplateRenderer>,
    scheduler: Arc<dyn RunScheduler>,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        pipeline: Arc<dyn SendPipeline>,
        profiles: Arc<dyn ProfileService>,
        renderer: Arc<dyn TemplateRenderer>,
        scheduler: Arc<dyn RunScheduler>,
    ) -> Self {
        Self {
            store,
            pipeline,
            profiles,
            renderer,
            scheduler,
        }
    }

    /// Start an automation run. Definition errors reject the invocation
    /// before anything is persisted; execution errors after that point
    /// are recorded on the run instead of being returned here.
    pub async fn invoke(
        self: &Arc<Self>,
        request: InvocationRequest,
    ) -> Result<Uuid, AutomationError> {
        let run_id = self.prepare(request).await?;
        self.execute_run(run_id).await?;
        Ok(run_id)
    }

    /// Continue a suspended run from its first unprocessed step. Runs
    /// that reached a terminal state in the meantime (a cancel during
    /// the delay window) are left alone.
    pub async fn resume(self: &Arc<Self>, run_id: Uuid) -> Result<(), AutomationError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(AutomationError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            info!(%run_id, status = run.status.as_str(), "run already terminal, skipping resumption");
            return Ok(());
        }
        self.execute_run(run_id).await
    }

    /// Cancel a run by id. Returns whether the cancel took effect; a run
    /// that already reached a terminal state is left untouched.
    pub async fn cancel_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<bool, AutomationError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or(AutomationError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        let applied = self
            .store
            .update_run_status(run_id, RunStatus::Canceled, None, true)
            .await?;
        if applied {
            info!(%run_id, "automation run canceled");
        }
        Ok(applied)
    }

    /// Cancel the latest live run carrying the given cancelation token.
    pub async fn cancel_by_token(
        &self,
        tenant_id: &str,
        token: &str,
    ) -> Result<Option<Uuid>, AutomationError> {
        let Some(run) = self.store.find_run_by_token(tenant_id, token).await? else {
            return Ok(None);
        };
        let applied = self
            .store
            .update_run_status(run.run_id, RunStatus::Canceled, None, true)
            .await?;
        if applied {
            info!(run_id = %run.run_id, token, "automation run canceled by token");
        }
        Ok(applied.then_some(run.run_id))
    }

    pub async fn run(&self, tenant_id: &str, run_id: Uuid) -> Result<Run, AutomationError> {
        self.store
            .get_run(run_id)
            .await?
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or(AutomationError::RunNotFound(run_id))
    }

    pub async fn run_steps(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<StepRecord>, AutomationError> {
        // confirms existence and tenant scoping
        self.run(tenant_id, run_id).await?;
        self.store.list_steps(run_id).await
    }

    /// Materialize, validate, and durably create a run without executing
    /// any of its steps.
    async fn prepare(&self, request: InvocationRequest) -> Result<Uuid, AutomationError> {
        let context = RunContext {
            data: request.data,
            profile: request.profile,
            recipient: request.recipient,
            template: request.template,
            brand: request.brand,
            refs: serde_json::Map::new(),
        };
        let mut source = request.source;
        let mut cancelation_token = request.cancelation_token;

        let steps = match &request.automation {
            Some(template_ref) => {
                if source.is_empty() {
                    source.push(cycle::invoke_segment(template_ref));
                }
                let rendered = self
                    .renderer
                    .render(&request.tenant_id, template_ref, &context)
                    .await?;
                if cancelation_token.is_none() {
                    cancelation_token = rendered.cancelation_token;
                }
                rendered.steps
            }
            None => request.steps,
        };

        let steps = match &request.defaults {
            Some(defaults) => steps
                .iter()
                .map(|step| step.apply_defaults(defaults))
                .collect::<Result<Vec<_>, _>>()?,
            None => steps,
        };

        // Reject bad definitions before anything is persisted.
        conditions::validate_conditional_refs(&steps)?;
        cycle::detect_invoke_cycles(&source, &steps)?;

        let run = Run::new(&request.tenant_id, source, context, cancelation_token);
        let records: Vec<StepRecord> = steps
            .into_iter()
            .enumerate()
            .map(|(position, definition)| {
                StepRecord::new(run.run_id, &request.tenant_id, position as i32, definition)
            })
            .collect();

        self.store.put_run(&run).await?;
        self.store.put_steps(&records).await?;
        info!(
            run_id = %run.run_id,
            tenant = %run.tenant_id,
            steps = records.len(),
            "automation run created"
        );
        Ok(run.run_id)
    }

    /// Walk the run's steps from the first unprocessed one until the run
    /// terminates or a delay suspends it.
    ///
    /// Boxed rather than an `async fn`: an `invoke` step spawns a nested
    /// `execute_run`, and the recursive future needs an indirection to
    /// stay `Send`-provable.
    fn execute_run(
        self: &Arc<Self>,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), AutomationError>> + Send>> {
        let engine = self.clone();
        Box::pin(async move { engine.execute_run_inner(run_id).await })
    }

    async fn execute_run_inner(self: &Arc<Self>, run_id: Uuid) -> Result<(), AutomationError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(AutomationError::RunNotFound(run_id))?;
        let steps = self.store.list_steps(run_id).await?;

        for mut step in steps {
            if matches!(step.status, StepStatus::Complete | StepStatus::Error) {
                continue;
            }

            // Re-read status so a cancel that landed since the previous
            // step halts the run before any further side effects.
            let current = self
                .store
                .get_run(run_id)
                .await?
                .ok_or(AutomationError::RunNotFound(run_id))?;
            if current.status.is_terminal() {
                info!(%run_id, status = current.status.as_str(), "run reached terminal state, halting");
                return Ok(());
            }

            if let Some(expr) = step.definition.condition.clone() {
                match conditions::evaluate(&expr, &run.context.as_value()) {
                    Ok(true) => {}
                    Ok(false) => {
                        step.status = StepStatus::Complete;
                        step.skipped = true;
                        step.updated_at = Utc::now();
                        self.store.update_step(&step).await?;
                        continue;
                    }
                    Err(e) => {
                        self.fail_run(&mut step, e).await?;
                        return Ok(());
                    }
                }
            }

            step.status = StepStatus::Processing;
            step.updated_at = Utc::now();
            self.store.update_step(&step).await?;

            match self.execute_step(&mut run, &step.definition).await {
                Ok(StepOutcome::Continue(output)) => {
                    if let Some(name) = step.definition.step_ref.clone() {
                        run.context.set_ref(&name, output.clone());
                    }
                    self.store.update_run_context(run_id, &run.context).await?;
                    step.status = StepStatus::Complete;
                    step.output = Some(output);
                    step.updated_at = Utc::now();
                    self.store.update_step(&step).await?;
                }
                Ok(StepOutcome::Suspend(at)) => {
                    // Completed before suspending, so resumption starts
                    // at the step after the delay.
                    step.status = StepStatus::Complete;
                    step.updated_at = Utc::now();
                    self.store.update_step(&step).await?;
                    self.scheduler.schedule_resume(run_id, at).await?;
                    info!(%run_id, resume_at = %at, "run suspended for delay");
                    return Ok(());
                }
                Err(e) => {
                    self.fail_run(&mut step, e).await?;
                    return Ok(());
                }
            }
        }

        let completed = self
            .store
            .update_run_status(run_id, RunStatus::Completed, None, true)
            .await?;
        if completed {
            info!(%run_id, "automation run completed");
        }
        Ok(())
    }

    async fn fail_run(
        &self,
        step: &mut StepRecord,
        cause: AutomationError,
    ) -> Result<(), AutomationError> {
        warn!(
            run_id = %step.run_id,
            step = step.definition.action.kind(),
            error = %cause,
            "automation step failed"
        );
        step.status = StepStatus::Error;
        step.error = Some(cause.to_string());
        step.updated_at = Utc::now();
        self.store.update_step(step).await?;
        self.store
            .update_run_status(step.run_id, RunStatus::Error, Some(cause.to_string()), true)
            .await?;
        Ok(())
    }

    async fn execute_step(
        self: &Arc<Self>,
        run: &mut Run,
        definition: &StepDefinition,
    ) -> Result<StepOutcome, AutomationError> {
        let ctx = run.context.as_value();
        match &definition.action {
            StepAction::Send { .. } | StepAction::SendList { .. } => {
                let mut fields = action_fields(&definition.action)?;
                fields = accessor::resolve(&fields, &ctx);
                if matches!(definition.action, StepAction::Send { .. }) {
                    backfill_send_context(&mut fields, &run.context);
                }
                let outcome = self
                    .pipeline
                    .execute(PipelineRequest {
                        step_kind: definition.action.kind().to_string(),
                        tenant_id: run.tenant_id.clone(),
                        fields,
                        context: ctx,
                    })
                    .await?;
                Ok(StepOutcome::Continue(outcome.output))
            }
            StepAction::Delay { duration, until } => {
                let duration = resolve_opt_string(duration.as_ref(), &ctx, "duration")?;
                let until = resolve_opt_string(until.as_ref(), &ctx, "until")?;
                let at =
                    scheduler::resume_time(duration.as_deref(), until.as_deref(), Utc::now())?;
                Ok(StepOutcome::Suspend(at))
            }
            StepAction::Invoke { template } => {
                let target = resolve_string(template, &ctx, "template")?;
                // Literal targets were checked at definition time; a target
                // wired through an accessor is only known now, so the trail
                // membership check happens again with the resolved value.
                let segment = cycle::invoke_segment(&target);
                if run.source.iter().any(|hop| *hop == segment) {
                    return Err(AutomationError::AutomationInvokeCycle(segment));
                }
                let mut source = run.source.clone();
                source.push(segment);

                let child = InvocationRequest {
                    automation: Some(target),
                    data: run.context.data.clone(),
                    profile: run.context.profile.clone(),
                    recipient: run.context.recipient.clone(),
                    template: run.context.template.clone(),
                    brand: run.context.brand.clone(),
                    source,
                    ..InvocationRequest::new(&run.tenant_id)
                };

                // The child is validated and durably created here, so
                // definition errors fail this step; its execution then
                // proceeds on its own task and this run continues.
                let child_run = self.prepare(child).await?;
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.execute_run(child_run).await {
                        error!(run_id = %child_run, error = %e, "invoked run failed to execute");
                    }
                });
                Ok(StepOutcome::Continue(json!({ "runId": child_run })))
            }
            StepAction::Cancel {
                run_id,
                cancelation_token,
            } => {
                let target = resolve_opt_string(run_id.as_ref(), &ctx, "run_id")?;
                let token = resolve_opt_string(cancelation_token.as_ref(), &ctx, "cancelation_token")?;
                let canceled = match (target, token) {
                    (Some(id), _) => {
                        let id = Uuid::parse_str(&id).map_err(|_| {
                            AutomationError::Execution(format!(
                                "cancel step: '{}' is not a run id",
                                id
                            ))
                        })?;
                        self.cancel_run(&run.tenant_id, id).await?
                    }
                    (None, Some(token)) => {
                        self.cancel_by_token(&run.tenant_id, &token).await?.is_some()
                    }
                    (None, None) => {
                        return Err(AutomationError::InvalidStepDefinition(
                            "cancel step requires 'run_id' or 'cancelation_token'".to_string(),
                        ))
                    }
                };
                Ok(StepOutcome::Continue(json!({ "canceled": canceled })))
            }
            StepAction::FetchData {
                source,
                merge_strategy,
            } => {
                let resolved = resolve_field(source, &ctx)?;
                let fetched = self.pipeline.fetch_data(&run.tenant_id, &resolved).await?;
                run.context.data = match merge_strategy {
                    MergeStrategy::Replace => fetched.clone(),
                    MergeStrategy::Merge => relay_shared::merge(&run.context.data, &fetched),
                };
                Ok(StepOutcome::Continue(fetched))
            }
            StepAction::UpdateProfile {
                recipient_id,
                profile,
                merge_strategy,
            } => {
                let recipient = resolve_string(recipient_id, &ctx, "recipient_id")?;
                let patch = resolve_field(profile, &ctx)?;
                let replace = *merge_strategy == MergeStrategy::Replace;
                self.profiles
                    .update_profile(&run.tenant_id, &recipient, &patch, replace)
                    .await?;
                run.context.profile = match merge_strategy {
                    MergeStrategy::Replace => patch,
                    MergeStrategy::Merge => relay_shared::merge(&run.context.profile, &patch),
                };
                Ok(StepOutcome::Continue(Value::Null))
            }
            StepAction::Subscribe {
                list_id,
                recipient_id,
            } => {
                let list = resolve_string(list_id, &ctx, "list_id")?;
                let recipient = resolve_string(recipient_id, &ctx, "recipient_id")?;
                self.profiles
                    .subscribe(&run.tenant_id, &list, &recipient)
                    .await?;
                Ok(StepOutcome::Continue(Value::Null))
            }
        }
    }
}

/// Serialize an action to its wire fields, dropping the `action` tag.
fn action_fields(action: &StepAction) -> Result<Value, AutomationError> {
    let mut value = serde_json::to_value(action)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("action");
    }
    Ok(value)
}

/// A send step without explicit recipient/profile/data/brand falls back
/// to the run context's values.
fn backfill_send_context(fields: &mut Value, context: &RunContext) {
    let Some(map) = fields.as_object_mut() else {
        return;
    };
    let defaults = [
        ("recipient", &context.recipient),
        ("profile", &context.profile),
        ("data", &context.data),
        ("brand", &context.brand),
    ];
    for (key, value) in defaults {
        if !map.contains_key(key) && !value.is_null() {
            map.insert(key.to_string(), value.clone());
        }
    }
}

fn resolve_field(field: &Field, ctx: &Value) -> Result<Value, AutomationError> {
    Ok(accessor::resolve(&serde_json::to_value(field)?, ctx))
}

fn resolve_string(field: &Field, ctx: &Value, name: &str) -> Result<String, AutomationError> {
    match resolve_field(field, ctx)? {
        Value::String(s) => Ok(s),
        other => Err(AutomationError::Execution(format!(
            "step field '{}' resolved to {} instead of a string",
            name, other
        ))),
    }
}

fn resolve_opt_string(
    field: Option<&Field>,
    ctx: &Value,
    name: &str,
) -> Result<Option<String>, AutomationError> {
    field.map(|f| resolve_string(f, ctx, name)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automations::pipeline::{
        MockProfileService, MockSendPipeline, ProviderOutcome,
    };
    use crate::automations::scheduler::MockRunScheduler;
    use crate::automations::store::MemoryStore;
    use crate::automations::templates::StoreTemplateRenderer;
    use relay_shared::{AutomationTemplate, StepSource};

    struct Harness {
        store: Arc<MemoryStore>,
        pipeline: MockSendPipeline,
        profiles: MockProfileService,
        scheduler: MockRunScheduler,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                pipeline: MockSendPipeline::new(),
                profiles: MockProfileService::new(),
                scheduler: MockRunScheduler::new(),
            }
        }

        fn engine(self) -> (Arc<AutomationEngine>, Arc<MemoryStore>) {
            let store = self.store.clone();
            let renderer = StoreTemplateRenderer::new(store.clone());
            let engine = Arc::new(AutomationEngine::new(
                self.store,
                Arc::new(self.pipeline),
                Arc::new(self.profiles),
                Arc::new(renderer),
                Arc::new(self.scheduler),
            ));
            (engine, store)
        }
    }

    fn send_step(template: Field) -> StepDefinition {
        StepDefinition::new(StepAction::Send {
            template,
            recipient: None,
            profile: None,
            data: None,
            brand: None,
        })
    }

    fn outcome(output: Value) -> ProviderOutcome {
        ProviderOutcome {
            provider: None,
            output,
        }
    }

    #[tokio::test]
    async fn test_run_resolves_refs_across_steps() {
        let mut harness = Harness::new();
        harness
            .pipeline
            .expect_fetch_data()
            .times(1)
            .returning(|_, _| Ok(json!({"templateName": "welcome", "eligible": true})));
        harness
            .pipeline
            .expect_execute()
            .times(1)
            .withf(|req| req.fields["template"] == json!("welcome"))
            .returning(|_| Ok(outcome(json!({"messageId": "msg-1"}))));
        let (engine, store) = harness.engine();

        let mut fetch = StepDefinition::new(StepAction::FetchData {
            source: Field::literal(json!({"webhook": "https://example.com/hook"})),
            merge_strategy: MergeStrategy::Merge,
        });
        fetch.step_ref = Some("checkout".to_string());
        let send = send_step(Field::accessor("refs.checkout.templateName"))
            .with_condition("refs.checkout.eligible == true");

        let request = InvocationRequest {
            steps: vec![fetch, send],
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            run.context.refs["checkout"]["templateName"],
            json!("welcome")
        );
        // fetch-data folded its payload into the run's data
        assert_eq!(run.context.data["eligible"], json!(true));

        let steps = store.list_steps(run_id).await.unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Complete));
        assert_eq!(steps[1].output, Some(json!({"messageId": "msg-1"})));
    }

    #[tokio::test]
    async fn test_false_condition_skips_step() {
        let mut harness = Harness::new();
        harness.pipeline.expect_execute().times(0);
        let (engine, store) = harness.engine();

        let skipped = send_step(Field::literal(json!("welcome")))
            .with_ref("greeting")
            .with_condition("data.plan == \"enterprise\"");
        let request = InvocationRequest {
            steps: vec![skipped],
            data: json!({"plan": "free"}),
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        // a skipped step publishes no ref
        assert!(!run.context.refs.contains_key("greeting"));

        let steps = store.list_steps(run_id).await.unwrap();
        assert!(steps[0].skipped);
        assert_eq!(steps[0].status, StepStatus::Complete);
    }

    #[tokio::test]
    async fn test_step_failure_marks_run_error() {
        let mut harness = Harness::new();
        harness
            .pipeline
            .expect_execute()
            .times(1)
            .returning(|_| Err(AutomationError::Execution("provider unavailable".to_string())));
        let (engine, store) = harness.engine();

        let request = InvocationRequest {
            steps: vec![
                send_step(Field::literal(json!("welcome"))),
                send_step(Field::literal(json!("followup"))),
            ],
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error.unwrap().contains("provider unavailable"));

        let steps = store.list_steps(run_id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Error);
        // execution halted: the second step was never reached
        assert_eq!(steps[1].status, StepStatus::NotProcessed);
    }

    #[tokio::test]
    async fn test_definition_errors_reject_before_persistence() {
        let (engine, store) = Harness::new().engine();

        let duplicated = vec![
            send_step(Field::literal(json!("a"))).with_ref("first"),
            send_step(Field::literal(json!("b"))).with_ref("first"),
        ];
        let request = InvocationRequest {
            steps: duplicated,
            cancelation_token: Some("dup-check".to_string()),
            ..InvocationRequest::new("tenant-a")
        };
        let result = engine.invoke(request).await;
        assert!(matches!(
            result,
            Err(AutomationError::DuplicateStepRefsDefined(_))
        ));
        // nothing was written
        assert!(
            store
                .find_run_by_token("tenant-a", "dup-check")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_undeclared_conditional_ref_rejected() {
        let (engine, _) = Harness::new().engine();
        let request = InvocationRequest {
            steps: vec![
                send_step(Field::literal(json!("welcome"))).with_condition("refs.ghost == true"),
            ],
            ..InvocationRequest::new("tenant-a")
        };
        let result = engine.invoke(request).await;
        assert!(matches!(
            result,
            Err(AutomationError::InvalidStepReference(_))
        ));
    }

    #[tokio::test]
    async fn test_direct_invoke_cycle_rejected() {
        let (engine, _) = Harness::new().engine();
        let request = InvocationRequest {
            steps: vec![StepDefinition::new(StepAction::Invoke {
                template: Field::literal(json!("flow-a")),
            })],
            source: vec!["invoke/flow-a".to_string()],
            ..InvocationRequest::new("tenant-a")
        };
        let result = engine.invoke(request).await;
        assert!(matches!(
            result,
            Err(AutomationError::AutomationInvokeCycle(_))
        ));
    }

    #[tokio::test]
    async fn test_accessor_invoke_target_cycle_is_cut_off() {
        let mut harness = Harness::new();
        harness.pipeline.expect_execute().times(0);
        let (engine, store) = harness.engine();

        // The invoke target is only known at execution time, so the
        // definition-time check cannot see the self-loop.
        let template_id = Uuid::new_v4();
        let looping = AutomationTemplate {
            template_id,
            tenant_id: "tenant-a".to_string(),
            name: "looping".to_string(),
            alias: Some("looping".to_string()),
            cancelation_token: None,
            steps: StepSource::Steps(vec![StepDefinition::new(StepAction::Invoke {
                template: Field::accessor("data.next"),
            })]),
            published_version: Some(1),
            published_at: None,
            sources: vec![],
            schedule_items: vec![],
            created_at: Utc::now(),
            updated_at: None,
        };
        store.put_template(&looping).await.unwrap();

        let request = InvocationRequest {
            automation: Some("looping".to_string()),
            data: json!({"next": "looping"}),
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        // The resolved target closes a cycle over the trail: the step
        // fails, the run errors, and no child run is ever prepared.
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error.unwrap().contains("invoke/looping"));
        let steps = store.list_steps(run_id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Error);
    }

    #[tokio::test]
    async fn test_inline_invocation_exposes_template_context() {
        let mut harness = Harness::new();
        harness
            .pipeline
            .expect_execute()
            .times(1)
            .withf(|req| {
                req.fields["template"] == json!("foobar")
                    && req.fields["recipient"] == json!("abc")
            })
            .returning(|_| Ok(outcome(json!({}))));
        let (engine, store) = harness.engine();

        let step = StepDefinition::new(StepAction::Send {
            template: Field::accessor("template"),
            recipient: Some(Field::accessor("profile.recipient")),
            profile: None,
            data: None,
            brand: None,
        });
        let request = InvocationRequest {
            steps: vec![step],
            template: json!("foobar"),
            profile: json!({"recipient": "abc"}),
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.context.template, json!("foobar"));
    }

    #[tokio::test]
    async fn test_cancel_during_delay_stops_resumption() {
        let mut harness = Harness::new();
        harness.pipeline.expect_execute().times(0);
        harness
            .scheduler
            .expect_schedule_resume()
            .times(1)
            .returning(|_, _| Ok(()));
        let (engine, store) = harness.engine();

        let delay = StepDefinition::new(StepAction::Delay {
            duration: Some(Field::literal(json!("10 minutes"))),
            until: None,
        });
        let request = InvocationRequest {
            steps: vec![delay, send_step(Field::literal(json!("followup")))],
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        // suspended, not terminal; delay step already complete
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Processing);
        let steps = store.list_steps(run_id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Complete);
        assert_eq!(steps[1].status, StepStatus::NotProcessed);

        assert!(engine.cancel_run("tenant-a", run_id).await.unwrap());

        // the scheduled resumption arrives, but the cancel holds
        engine.resume(run_id).await.unwrap();
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
        let steps = store.list_steps(run_id).await.unwrap();
        assert_eq!(steps[1].status, StepStatus::NotProcessed);
    }

    #[tokio::test]
    async fn test_resume_continues_after_delay() {
        let mut harness = Harness::new();
        harness
            .pipeline
            .expect_execute()
            .times(1)
            .withf(|req| req.fields["template"] == json!("followup"))
            .returning(|_| Ok(outcome(json!({"messageId": "msg-2"}))));
        harness
            .scheduler
            .expect_schedule_resume()
            .times(1)
            .returning(|_, _| Ok(()));
        let (engine, store) = harness.engine();

        let delay = StepDefinition::new(StepAction::Delay {
            duration: Some(Field::literal(json!("1 hour"))),
            until: None,
        });
        let request = InvocationRequest {
            steps: vec![delay, send_step(Field::literal(json!("followup")))],
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        engine.resume(run_id).await.unwrap();
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_invoke_starts_child_run_and_continues() {
        let mut harness = Harness::new();
        // one send from the child's rendered template
        harness
            .pipeline
            .expect_execute()
            .times(1)
            .withf(|req| req.fields["template"] == json!("child-welcome"))
            .returning(|_| Ok(outcome(json!({"messageId": "child-msg"}))));
        let (engine, store) = harness.engine();

        let child_template = AutomationTemplate {
            template_id: Uuid::new_v4(),
            tenant_id: "tenant-a".to_string(),
            name: "child flow".to_string(),
            alias: Some("child-flow".to_string()),
            cancelation_token: None,
            steps: StepSource::Steps(vec![send_step(Field::literal(json!("child-welcome")))]),
            published_version: Some(1),
            published_at: None,
            sources: vec![],
            schedule_items: vec![],
            created_at: Utc::now(),
            updated_at: None,
        };
        store.put_template(&child_template).await.unwrap();

        let invoke = StepDefinition::new(StepAction::Invoke {
            template: Field::literal(json!("child-flow")),
        })
        .with_ref("child");
        let request = InvocationRequest {
            steps: vec![invoke],
            data: json!({"plan": "free"}),
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        let parent = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(parent.status, RunStatus::Completed);
        let child_id: Uuid =
            serde_json::from_value(parent.context.refs["child"]["runId"].clone()).unwrap();

        // the child executes on its own task; wait for it to finish
        let mut child = store.get_run(child_id).await.unwrap().unwrap();
        for _ in 0..50 {
            if child.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            child = store.get_run(child_id).await.unwrap().unwrap();
        }
        assert_eq!(child.status, RunStatus::Completed);
        // the child inherits data and extends the invocation trail
        assert_eq!(child.context.data, json!({"plan": "free"}));
        assert_eq!(child.source, vec!["invoke/child-flow".to_string()]);
    }

    #[tokio::test]
    async fn test_update_profile_merges_into_context() {
        let mut harness = Harness::new();
        harness
            .profiles
            .expect_update_profile()
            .times(1)
            .withf(|tenant, recipient, patch, replace| {
                tenant == "tenant-a"
                    && recipient == "user-1"
                    && patch == &json!({"locale": "fr-FR"})
                    && !replace
            })
            .returning(|_, _, _, _| Ok(()));
        let (engine, store) = harness.engine();

        let step = StepDefinition::new(StepAction::UpdateProfile {
            recipient_id: Field::literal(json!("user-1")),
            profile: Field::literal(json!({"locale": "fr-FR"})),
            merge_strategy: MergeStrategy::Merge,
        });
        let request = InvocationRequest {
            steps: vec![step],
            profile: json!({"email": "user@example.com"}),
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            run.context.profile,
            json!({"email": "user@example.com", "locale": "fr-FR"})
        );
    }

    #[tokio::test]
    async fn test_cancel_by_token() {
        let mut harness = Harness::new();
        harness.pipeline.expect_execute().times(0);
        harness
            .scheduler
            .expect_schedule_resume()
            .returning(|_, _| Ok(()));
        let (engine, store) = harness.engine();

        let delay = StepDefinition::new(StepAction::Delay {
            duration: Some(Field::literal(json!("1 day"))),
            until: None,
        });
        let request = InvocationRequest {
            steps: vec![delay, send_step(Field::literal(json!("reminder")))],
            cancelation_token: Some("order-123".to_string()),
            ..InvocationRequest::new("tenant-a")
        };
        let run_id = engine.invoke(request).await.unwrap();

        let canceled = engine
            .cancel_by_token("tenant-a", "order-123")
            .await
            .unwrap();
        assert_eq!(canceled, Some(run_id));
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Canceled);

        // a second cancel finds no live run
        assert_eq!(
            engine.cancel_by_token("tenant-a", "order-123").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_send_backfills_context_recipient() {
        let mut harness = Harness::new();
        harness
            .pipeline
            .expect_execute()
            .times(1)
            .withf(|req| {
                req.fields["recipient"] == json!("user-7")
                    && req.fields["data"] == json!({"order": 42})
            })
            .returning(|_| Ok(outcome(json!({}))));
        let (engine, _) = harness.engine();

        let request = InvocationRequest {
            steps: vec![send_step(Field::literal(json!("receipt")))],
            recipient: json!("user-7"),
            data: json!({"order": 42}),
            ..InvocationRequest::new("tenant-a")
        };
        engine.invoke(request).await.unwrap();
    }
}
