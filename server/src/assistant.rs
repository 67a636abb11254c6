use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::{
    error::RelayError,
    types::{RunOutcome, ToolCall, Turn},
};

/// Thread-run operations of the assistant provider.
#[async_trait]
pub trait AssistantRuns: Send + Sync {
    /// Starts a run with `turns` appended to the thread and waits for it to
    /// leave the queued/in-progress states.
    async fn create_and_poll(
        &self,
        thread_id: &str,
        assistant_id: &str,
        turns: &[Turn],
    ) -> Result<RunOutcome, RelayError>;

    /// Messages produced by the run, oldest first.
    async fn run_messages(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Vec<ThreadMessage>, RelayError>;

    async fn submit_tool_output(
        &self,
        thread_id: &str,
        run_id: &str,
        tool_call_id: &str,
        output: &str,
    ) -> Result<(), RelayError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThreadMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: TextBlock },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TextBlock {
    pub value: String,
}

impl ThreadMessage {
    pub fn text(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: vec![ContentBlock::Text {
                text: TextBlock {
                    value: value.into(),
                },
            }],
        }
    }

    /// Text of the first content block, when that block is text.
    pub fn first_text(&self) -> Option<&str> {
        match self.content.first()? {
            ContentBlock::Text { text } => Some(text.value.as_str()),
            ContentBlock::Other => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: String,
    #[serde(default)]
    required_action: Option<RequiredAction>,
}

#[derive(Debug, Deserialize)]
struct RequiredAction {
    submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Debug, Deserialize)]
struct SubmitToolOutputs {
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    id: String,
    function: RawFunction,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl RunObject {
    fn is_pending(&self) -> bool {
        matches!(self.status.as_str(), "queued" | "in_progress" | "cancelling")
    }

    fn into_outcome(self) -> RunOutcome {
        let tool_calls = self
            .required_action
            .map(|action| {
                action
                    .submit_tool_outputs
                    .tool_calls
                    .into_iter()
                    .map(|call| ToolCall {
                        id: call.id,
                        name: call.function.name,
                        arguments: call.function.arguments,
                    })
                    .collect()
            })
            .unwrap_or_default();
        RunOutcome::from_status(&self.id, &self.status, tool_calls)
    }
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Serialize)]
struct CreateRun<'a> {
    assistant_id: &'a str,
    additional_messages: &'a [Turn],
}

/// OpenAI Assistants v2 client.
pub struct OpenAiAssistants {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    run_timeout: Duration,
}

impl OpenAiAssistants {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        poll_interval: Duration,
        run_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            poll_interval,
            run_timeout,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, RelayError> {
        let response = request
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .send()
            .await
            .map_err(|err| RelayError::from_transport(what, err))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(scope = "AI", %status, response = %body, "{what} failed");
            return Err(RelayError::Downstream(format!("openai {what} returned {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| RelayError::Downstream(format!("openai {what} parse failed: {err}")))
    }

    async fn run_until_settled(
        &self,
        thread_id: &str,
        assistant_id: &str,
        turns: &[Turn],
    ) -> Result<RunOutcome, RelayError> {
        let mut run: RunObject = self
            .send(
                self.client
                    .post(format!("{}/threads/{thread_id}/runs", self.base_url))
                    .json(&CreateRun {
                        assistant_id,
                        additional_messages: turns,
                    }),
                "run create",
            )
            .await?;

        while run.is_pending() {
            debug!(scope = "AI", run_id = %run.id, status = %run.status, "polling run");
            tokio::time::sleep(self.poll_interval).await;
            run = self
                .send(
                    self.client
                        .get(format!("{}/threads/{thread_id}/runs/{}", self.base_url, run.id)),
                    "run poll",
                )
                .await?;
        }

        Ok(run.into_outcome())
    }
}

#[async_trait]
impl AssistantRuns for OpenAiAssistants {
    async fn create_and_poll(
        &self,
        thread_id: &str,
        assistant_id: &str,
        turns: &[Turn],
    ) -> Result<RunOutcome, RelayError> {
        match tokio::time::timeout(
            self.run_timeout,
            self.run_until_settled(thread_id, assistant_id, turns),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    scope = "AI",
                    thread_id,
                    timeout_secs = self.run_timeout.as_secs_f64(),
                    "run did not settle in time"
                );
                Ok(RunOutcome::timed_out())
            }
        }
    }

    async fn run_messages(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Vec<ThreadMessage>, RelayError> {
        // The provider lists newest first by default; ascending keeps the
        // run's final reply at the end of the list.
        let list: MessageList = self
            .send(
                self.client
                    .get(format!("{}/threads/{thread_id}/messages", self.base_url))
                    .query(&[("run_id", run_id), ("order", "asc")]),
                "message list",
            )
            .await?;
        Ok(list.data)
    }

    async fn submit_tool_output(
        &self,
        thread_id: &str,
        run_id: &str,
        tool_call_id: &str,
        output: &str,
    ) -> Result<(), RelayError> {
        let _: Value = self
            .send(
                self.client
                    .post(format!(
                        "{}/threads/{thread_id}/runs/{run_id}/submit_tool_outputs",
                        self.base_url
                    ))
                    .json(&json!({
                        "tool_outputs": [{ "tool_call_id": tool_call_id, "output": output }]
                    })),
                "tool output submit",
            )
            .await?;
        Ok(())
    }
}
