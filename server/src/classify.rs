//! Turns a settled assistant run into the payload returned to the CRM.

use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    assistant::AssistantRuns,
    error::RelayError,
    types::{ConversationContext, OutwardPayload, RunOutcome},
};

pub const TOOL_ACK_OUTPUT: &str = "success";
pub const UNEXPECTED_FUNCTION: &str = "unexpected function";

const TOOL_ACTIONS: &[(&str, &str)] = &[
    ("handoff", "handoff"),
    ("endConvo", "forced"),
    ("checkTier", "tier 1"),
];

/// Outward `stop` label for a tool name. Unknown names get [`UNEXPECTED_FUNCTION`].
pub fn action_label(tool_name: &str) -> &'static str {
    TOOL_ACTIONS
        .iter()
        .find(|(name, _)| *name == tool_name)
        .map(|(_, label)| *label)
        .unwrap_or(UNEXPECTED_FUNCTION)
}

/// Removes provider citation markers such as `【4:0†source】`. A `【` without a
/// closing `】` after it is kept as-is.
pub fn strip_citations(text: &str) -> String {
    let Some(re) = Regex::new(r"【[^】]*】").ok() else {
        return text.to_string();
    };
    re.replace_all(text, "").into_owned()
}

pub async fn classify(
    outcome: RunOutcome,
    ctx: &ConversationContext,
    runs: &dyn AssistantRuns,
) -> Result<OutwardPayload, RelayError> {
    match outcome {
        RunOutcome::Completed { run_id } => {
            let messages = runs.run_messages(&ctx.thread_id, &run_id).await?;
            let Some(raw) = messages.last().and_then(|message| message.first_text()) else {
                warn!(
                    scope = "AI Message",
                    run_id = %run_id,
                    thread_id = %ctx.thread_id,
                    ghl_contact_id = %ctx.ghl_contact_id,
                    message_count = messages.len(),
                    "no assistant text for completed run"
                );
                return Err(RelayError::NoAiMessage);
            };
            let ai_response = strip_citations(raw);

            info!(
                scope = "AI Message",
                run_id = %run_id,
                thread_id = %ctx.thread_id,
                ghl_contact_id = %ctx.ghl_contact_id,
                ai_message = %ai_response,
                "retrieved assistant response"
            );
            Ok(OutwardPayload::Reply {
                ai_response,
                ghl_convo_id: ctx.ghl_convo_id.clone(),
                add_convo_id_action: ctx.convo_id_resolved,
            })
        }
        RunOutcome::RequiresAction { run_id, tool_calls } => {
            let Some(call) = tool_calls.first() else {
                warn!(scope = "AI Function", run_id = %run_id, "requires_action without tool calls");
                return Ok(OutwardPayload::TechnicalBug {
                    stop: true,
                    technical_bug: "requires_action".to_string(),
                });
            };
            if tool_calls.len() > 1 {
                warn!(
                    scope = "AI Function",
                    run_id = %run_id,
                    pending = tool_calls.len(),
                    "only the first tool call is acknowledged"
                );
            }

            runs.submit_tool_output(&ctx.thread_id, &run_id, &call.id, TOOL_ACK_OUTPUT)
                .await?;

            let label = action_label(&call.name);
            let arguments = serde_json::from_str::<Value>(&call.arguments)
                .unwrap_or_else(|_| Value::String(call.arguments.clone()));
            if label == UNEXPECTED_FUNCTION {
                warn!(
                    scope = "AI Function",
                    function_name = %call.name,
                    tool_call_id = %call.id,
                    run_id = %run_id,
                    ghl_contact_id = %ctx.ghl_contact_id,
                    "unexpected function name"
                );
            }
            info!(
                scope = "AI Function",
                tool_call_id = %call.id,
                run_id = %run_id,
                thread_id = %ctx.thread_id,
                function = %arguments,
                selected_action = label,
                ghl_contact_id = %ctx.ghl_contact_id,
                "processed function call"
            );

            Ok(OutwardPayload::Action {
                ghl_convo_id: ctx.ghl_convo_id.clone(),
                stop: label.to_string(),
                add_convo_id_action: ctx.convo_id_resolved,
            })
        }
        RunOutcome::TerminalFailure { status } | RunOutcome::Unknown { status } => {
            warn!(
                scope = "AI Run",
                status = %status,
                thread_id = %ctx.thread_id,
                ghl_contact_id = %ctx.ghl_contact_id,
                "run ended without a usable result"
            );
            Ok(OutwardPayload::TechnicalBug {
                stop: true,
                technical_bug: status,
            })
        }
    }
}
