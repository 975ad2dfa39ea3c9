// Template Renderer - turns a stored automation template into the
// concrete step list for a run. Templates either carry their steps
// inline or as a JSON source string with {{path}} placeholders that are
// substituted from the invocation context before parsing.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use relay_shared::{RunContext, StepDefinition, StepSource};
use serde_json::Value;
use uuid::Uuid;

use super::accessor;
use super::store::DurableStore;
use super::AutomationError;

/// A template materialized against one invocation's context.
#[derive(Debug, Clone)]
pub struct RenderedAutomation {
    pub template_id: Uuid,
    pub steps: Vec<StepDefinition>,
    pub cancelation_token: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        tenant_id: &str,
        template_ref: &str,
        context: &RunContext,
    ) -> Result<RenderedAutomation, AutomationError>;
}

pub struct StoreTemplateRenderer {
    store: Arc<dyn DurableStore>,
}

impl StoreTemplateRenderer {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TemplateRenderer for StoreTemplateRenderer {
    async fn render(
        &self,
        tenant_id: &str,
        template_ref: &str,
        context: &RunContext,
    ) -> Result<RenderedAutomation, AutomationError> {
        let template = self
            .store
            .get_template(tenant_id, template_ref)
            .await?
            .ok_or_else(|| AutomationError::TemplateNotFound(template_ref.to_string()))?;

        let steps = match &template.steps {
            StepSource::Steps(steps) => steps.clone(),
            StepSource::Source(source) => {
                let rendered = substitute_placeholders(source, &context.as_value());
                serde_json::from_str(&rendered).map_err(|e| {
                    AutomationError::InvalidStepDefinition(format!(
                        "template '{}' source did not render to a step list: {}",
                        template_ref, e
                    ))
                })?
            }
        };

        Ok(RenderedAutomation {
            template_id: template.template_id,
            steps,
            cancelation_token: template.cancelation_token.clone(),
        })
    }
}

/// Replace `{{path}}` placeholders with values looked up from the
/// context. String values substitute raw; everything else substitutes
/// as its JSON form; missing paths become empty.
fn substitute_placeholders(source: &str, context: &Value) -> String {
    let pattern = Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap();
    pattern
        .replace_all(source, |caps: &regex::Captures| {
            match accessor::lookup(context, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => String::new(),
            }
        })
        .into_owned()
}
