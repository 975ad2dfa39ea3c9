use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A step field: either a literal JSON value or an accessor into the run
/// context (`{ "$ref": "profile.recipient" }`), resolved at execution time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Field {
    Accessor {
        #[serde(rename = "$ref")]
        path: String,
    },
    Literal(Value),
}

impl Field {
    pub fn accessor(path: &str) -> Self {
        Self::Accessor {
            path: path.to_string(),
        }
    }

    pub fn literal(value: Value) -> Self {
        Self::Literal(value)
    }

    pub fn is_accessor(&self) -> bool {
        matches!(self, Self::Accessor { .. })
    }
}

/// How data produced by a step is folded back into the run context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    Replace,
    Merge,
}

/// The closed set of step kinds the engine knows how to execute.
///
/// Every action-specific field is a [`Field`], so any of them may be wired
/// to the run context with an accessor instead of a literal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum StepAction {
    Send {
        template: Field,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<Field>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<Field>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Field>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        brand: Option<Field>,
    },
    SendList {
        list: Field,
        template: Field,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Field>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        brand: Option<Field>,
    },
    Delay {
        /// Human interval, e.g. "10 minutes". Exactly one of `duration`
        /// and `until` must be set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<Field>,
        /// Absolute RFC 3339 wake time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<Field>,
    },
    Invoke {
        template: Field,
    },
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<Field>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cancelation_token: Option<Field>,
    },
    FetchData {
        source: Field,
        #[serde(default)]
        merge_strategy: MergeStrategy,
    },
    UpdateProfile {
        recipient_id: Field,
        profile: Field,
        #[serde(default)]
        merge_strategy: MergeStrategy,
    },
    Subscribe {
        list_id: Field,
        recipient_id: Field,
    },
}

impl StepAction {
    /// Wire name of the step kind, matching the serialized `action` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::SendList { .. } => "send-list",
            Self::Delay { .. } => "delay",
            Self::Invoke { .. } => "invoke",
            Self::Cancel { .. } => "cancel",
            Self::FetchData { .. } => "fetch-data",
            Self::UpdateProfile { .. } => "update-profile",
            Self::Subscribe { .. } => "subscribe",
        }
    }
}

/// One step of an automation definition: an action plus the optional `ref`
/// it publishes and the optional `if` expression gating its execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub step_ref: Option<String>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl StepDefinition {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            step_ref: None,
            condition: None,
        }
    }

    pub fn with_ref(mut self, step_ref: &str) -> Self {
        self.step_ref = Some(step_ref.to_string());
        self
    }

    pub fn with_condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    /// Layer root-level defaults underneath this step's own fields.
    ///
    /// Step values win at every level; nested objects merge recursively; a
    /// step field that is explicitly `null` stays `null` rather than being
    /// back-filled from the defaults.
    pub fn apply_defaults(&self, defaults: &Value) -> Result<Self, serde_json::Error> {
        if !defaults.is_object() {
            return Ok(self.clone());
        }
        let step_value = serde_json::to_value(self)?;
        serde_json::from_value(merge(defaults, &step_value))
    }
}

/// Deep-extend merge of two JSON trees: `step` values take precedence over
/// `root` values at every level, plain objects are merged key-by-key, and
/// anything else at the step level (including explicit `null`) replaces the
/// root value wholesale.
pub fn merge(root: &Value, step: &Value) -> Value {
    match (root, step) {
        (Value::Object(root_map), Value::Object(step_map)) => {
            let mut out = root_map.clone();
            for (key, step_value) in step_map {
                let merged = match (out.get(key), step_value) {
                    (Some(root_value), Value::Object(_)) if root_value.is_object() => {
                        merge(root_value, step_value)
                    }
                    _ => step_value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        _ => step.clone(),
    }
}

/// Lifecycle of a persisted step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    NotProcessed,
    Processing,
    Complete,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotProcessed => "notProcessed",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notProcessed" => Some(Self::NotProcessed),
            "processing" => Some(Self::Processing),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A step materialized into a run, mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: String,
    /// Zero-based list position; execution order is exactly position order.
    pub position: i32,
    pub definition: StepDefinition,
    pub status: StepStatus,
    /// Resolved output of the executed action, published under
    /// `refs.<ref>` when the step declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// True when the step's `if` expression evaluated to false.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(run_id: Uuid, tenant_id: &str, position: i32, definition: StepDefinition) -> Self {
        let now = Utc::now();
        Self {
            step_id: Uuid::new_v4(),
            run_id,
            tenant_id: tenant_id.to_string(),
            position,
            definition,
            status: StepStatus::NotProcessed,
            output: None,
            skipped: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Run lifecycle: `processing` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Processing,
    Completed,
    Error,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// The tree of values step accessors resolve against. The `data`, `profile`,
/// `recipient`, `template` and `brand` members are immutable trigger input;
/// `refs` accumulates the published output of completed steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunContext {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub profile: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub recipient: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub template: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub brand: Value,
    #[serde(default)]
    pub refs: serde_json::Map<String, Value>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            data: Value::Null,
            profile: Value::Null,
            recipient: Value::Null,
            template: Value::Null,
            brand: Value::Null,
            refs: serde_json::Map::new(),
        }
    }
}

impl RunContext {
    /// Snapshot the whole context as a JSON tree for accessor lookup.
    pub fn as_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Publish a completed step's output under `refs.<name>`.
    pub fn set_ref(&mut self, name: &str, value: Value) {
        self.refs.insert(name.to_string(), value);
    }
}

/// One execution instance of a step list against a concrete context.
/// Terminal runs are retained for audit, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub status: RunStatus,
    /// Ordered trail of invocation path segments, e.g. `invoke/templateA`
    /// or `schedule/<itemId>`; used for cycle detection on nested invokes.
    pub source: Vec<String>,
    pub context: RunContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelation_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        tenant_id: &str,
        source: Vec<String>,
        context: RunContext,
        cancelation_token: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            status: RunStatus::Processing,
            source,
            context,
            cancelation_token,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An automation's published step definition: either a literal step list or
/// a render-time JSON template expanded against the trigger data/profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StepSource {
    Steps(Vec<StepDefinition>),
    Source(String),
}

/// A per-tenant automation definition, read by the orchestrator whenever an
/// `invoke` step or schedule item targets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationTemplate {
    pub template_id: Uuid,
    pub tenant_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelation_token: Option<String>,
    pub steps: StepSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_version: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Trigger sources this template responds to.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub schedule_items: Vec<ScheduleItem>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A recurring trigger attached to a template, with its own lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleItem {
    pub item_id: Uuid,
    pub template_id: Uuid,
    pub tenant_id: String,
    /// Cron schedule expression.
    pub value: String,
    pub enabled: bool,
    /// Expiry after which the schedule no longer fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<DateTime<Utc>>,
}

impl ScheduleItem {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.ttl.map(|t| t > now).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_accessor_serde() {
        let field: Field = serde_json::from_value(json!({ "$ref": "profile.recipient" })).unwrap();
        assert_eq!(field, Field::accessor("profile.recipient"));

        let field: Field = serde_json::from_value(json!({ "nested": true })).unwrap();
        assert!(!field.is_accessor());
    }

    #[test]
    fn test_step_definition_serde() {
        let step: StepDefinition = serde_json::from_value(json!({
            "action": "send",
            "template": { "$ref": "template" },
            "recipient": "user-1",
            "ref": "outreach",
            "if": "refs.previous.status == 'SENT'"
        }))
        .unwrap();

        assert_eq!(step.action.kind(), "send");
        assert_eq!(step.step_ref.as_deref(), Some("outreach"));
        assert!(step.condition.is_some());

        let round_trip = serde_json::to_value(&step).unwrap();
        assert_eq!(round_trip["action"], "send");
        assert_eq!(round_trip["template"]["$ref"], "template");
    }

    #[test]
    fn test_merge_step_wins_at_every_level() {
        let root = json!({
            "brand": "default-brand",
            "data": { "region": "us", "market": { "tier": 1 } }
        });
        let step = json!({
            "data": { "market": { "tier": 2 } },
            "recipient": "abc"
        });

        let merged = merge(&root, &step);
        assert_eq!(merged["brand"], "default-brand");
        assert_eq!(merged["data"]["region"], "us");
        assert_eq!(merged["data"]["market"]["tier"], 2);
        assert_eq!(merged["recipient"], "abc");
    }

    #[test]
    fn test_merge_preserves_explicit_null() {
        let root = json!({ "brand": "default-brand" });
        let step = json!({ "brand": null });

        let merged = merge(&root, &step);
        assert_eq!(merged["brand"], Value::Null);
        assert!(merged.as_object().unwrap().contains_key("brand"));
    }

    #[test]
    fn test_merge_scalar_replaces_object() {
        let root = json!({ "data": { "a": 1 } });
        let step = json!({ "data": "flat" });

        let merged = merge(&root, &step);
        assert_eq!(merged["data"], "flat");
    }

    #[test]
    fn test_apply_defaults() {
        let step = StepDefinition::new(StepAction::Send {
            template: Field::accessor("template"),
            recipient: None,
            profile: None,
            data: None,
            brand: None,
        });

        let merged = step
            .apply_defaults(&json!({ "brand": "spring-sale", "recipient": "user-2" }))
            .unwrap();

        match merged.action {
            StepAction::Send { brand, recipient, .. } => {
                assert_eq!(brand, Some(Field::literal(json!("spring-sale"))));
                assert_eq!(recipient, Some(Field::literal(json!("user-2"))));
            }
            _ => panic!("expected send step"),
        }
    }

    #[test]
    fn test_run_status_state_machine() {
        assert!(!RunStatus::Processing.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert_eq!(RunStatus::parse("canceled"), Some(RunStatus::Canceled));
    }

    #[test]
    fn test_step_status_wire_names() {
        assert_eq!(StepStatus::NotProcessed.as_str(), "notProcessed");
        assert_eq!(StepStatus::parse("complete"), Some(StepStatus::Complete));
        assert_eq!(
            serde_json::to_value(StepStatus::NotProcessed).unwrap(),
            json!("notProcessed")
        );
    }

    #[test]
    fn test_schedule_item_ttl() {
        let item = ScheduleItem {
            item_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            tenant_id: "tenant-a".to_string(),
            value: "0 0 9 * * *".to_string(),
            enabled: true,
            ttl: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        assert!(!item.is_live(Utc::now()));
    }
}
