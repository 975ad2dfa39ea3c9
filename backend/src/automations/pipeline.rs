// Send Pipeline - hands resolved send/send-list payloads to the message
// pipeline and profile mutations to the profile service. The engine only
// sees the traits; the HTTP implementations talk to the downstream
// services over REST.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::AutomationError;

/// A fully resolved request for the downstream message pipeline. Fields
/// have already been through accessor resolution, so everything here is
/// literal JSON.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Wire name of the originating step ("send" or "send-list").
    pub step_kind: String,
    pub tenant_id: String,
    pub fields: Value,
    pub context: Value,
}

/// What the pipeline reports back for a dispatched message. The output
/// becomes the step's ref payload.
#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    pub provider: Option<String>,
    pub output: Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SendPipeline: Send + Sync {
    async fn execute(&self, request: PipelineRequest) -> Result<ProviderOutcome, AutomationError>;

    /// Fetch external data for a fetch-data step.
    async fn fetch_data(
        &self,
        tenant_id: &str,
        source: &Value,
    ) -> Result<Value, AutomationError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileService: Send + Sync {
    async fn update_profile(
        &self,
        tenant_id: &str,
        recipient_id: &str,
        profile: &Value,
        replace: bool,
    ) -> Result<(), AutomationError>;

    async fn subscribe(
        &self,
        tenant_id: &str,
        list_id: &str,
        recipient_id: &str,
    ) -> Result<(), AutomationError>;
}

/// REST client for the message pipeline and profile endpoints.
pub struct HttpSendPipeline {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSendPipeline {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AutomationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AutomationError::Execution(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(
        &self,
        path: &str,
        tenant_id: &str,
        body: &Value,
    ) -> Result<Value, AutomationError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header("X-Tenant-Id", tenant_id)
            .json(body)
            .send()
            .await
            .map_err(|e| AutomationError::Execution(format!("pipeline request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AutomationError::Execution(format!(
                "pipeline returned {}: {}",
                status, detail
            )));
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response
            .json()
            .await
            .map_err(|e| AutomationError::Execution(format!("invalid pipeline response: {}", e)))
    }
}

#[async_trait]
impl SendPipeline for HttpSendPipeline {
    async fn execute(&self, request: PipelineRequest) -> Result<ProviderOutcome, AutomationError> {
        let path = match request.step_kind.as_str() {
            "send-list" => "/send/list",
            _ => "/send",
        };
        let body = json!({
            "message": request.fields,
            "context": request.context,
        });
        let output = self.post_json(path, &request.tenant_id, &body).await?;
        let provider = output
            .get("provider")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(ProviderOutcome { provider, output })
    }

    async fn fetch_data(
        &self,
        tenant_id: &str,
        source: &Value,
    ) -> Result<Value, AutomationError> {
        let body = json!({ "source": source });
        self.post_json("/data/fetch", tenant_id, &body).await
    }
}

#[async_trait]
impl ProfileService for HttpSendPipeline {
    async fn update_profile(
        &self,
        tenant_id: &str,
        recipient_id: &str,
        profile: &Value,
        replace: bool,
    ) -> Result<(), AutomationError> {
        let body = json!({ "profile": profile, "replace": replace });
        self.post_json(
            &format!("/profiles/{}", recipient_id),
            tenant_id,
            &body,
        )
        .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        tenant_id: &str,
        list_id: &str,
        recipient_id: &str,
    ) -> Result<(), AutomationError> {
        let body = json!({});
        self.post_json(
            &format!("/lists/{}/subscriptions/{}", list_id, recipient_id),
            tenant_id,
            &body,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_posts_resolved_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("X-Tenant-Id", "tenant-a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messageId": "msg-1",
                "provider": "sendgrid",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = HttpSendPipeline::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let outcome = pipeline
            .execute(PipelineRequest {
                step_kind: "send".to_string(),
                tenant_id: "tenant-a".to_string(),
                fields: json!({"template": "welcome", "recipient": "user-1"}),
                context: json!({"data": {}}),
            })
            .await
            .unwrap();

        assert_eq!(outcome.provider.as_deref(), Some("sendgrid"));
        assert_eq!(outcome.output["messageId"], json!("msg-1"));
    }

    #[tokio::test]
    async fn test_send_list_uses_list_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"enqueued": 40})))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = HttpSendPipeline::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let outcome = pipeline
            .execute(PipelineRequest {
                step_kind: "send-list".to_string(),
                tenant_id: "tenant-a".to_string(),
                fields: json!({"list": "beta-users", "template": "digest"}),
                context: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(outcome.output["enqueued"], json!(40));
    }

    #[tokio::test]
    async fn test_pipeline_error_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let pipeline = HttpSendPipeline::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let result = pipeline
            .execute(PipelineRequest {
                step_kind: "send".to_string(),
                tenant_id: "tenant-a".to_string(),
                fields: json!({}),
                context: json!({}),
            })
            .await;

        match result {
            Err(AutomationError::Execution(msg)) => assert!(msg.contains("502")),
            other => panic!("expected execution error, got {:?}", other.map(|_| ())),
        }
    }
}
