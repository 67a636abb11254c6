use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    #[default]
    #[serde(other)]
    Other,
}

/// One entry of a CRM conversation, as returned newest-first by the messages API.
/// Entries without text (calls, attachments) carry a `null` body and read as empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub direction: Direction,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    pub fn inbound(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            direction: Direction::Inbound,
        }
    }

    pub fn outbound(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            direction: Direction::Outbound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

/// A unit submitted to the assistant as an additional thread message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationContext {
    pub thread_id: String,
    pub assistant_id: String,
    pub ghl_contact_id: String,
    pub ghl_convo_id: String,
    pub ghl_recent_message: String,
    /// Set when `ghl_convo_id` was looked up during this call, so the CRM side
    /// can persist it.
    pub convo_id_resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { run_id: String },
    RequiresAction { run_id: String, tool_calls: Vec<ToolCall> },
    TerminalFailure { status: String },
    Unknown { status: String },
}

pub const TIMED_OUT_STATUS: &str = "timed_out";

impl RunOutcome {
    /// Maps a provider run status onto an outcome. `tool_calls` is only
    /// consulted for `requires_action`.
    pub fn from_status(run_id: &str, status: &str, tool_calls: Vec<ToolCall>) -> Self {
        match status {
            "completed" => RunOutcome::Completed {
                run_id: run_id.to_string(),
            },
            "requires_action" => RunOutcome::RequiresAction {
                run_id: run_id.to_string(),
                tool_calls,
            },
            "cancelled" | "failed" | "expired" | "incomplete" | TIMED_OUT_STATUS => {
                RunOutcome::TerminalFailure {
                    status: status.to_string(),
                }
            }
            other => RunOutcome::Unknown {
                status: other.to_string(),
            },
        }
    }

    pub fn timed_out() -> Self {
        RunOutcome::TerminalFailure {
            status: TIMED_OUT_STATUS.to_string(),
        }
    }
}

/// Successful (HTTP 200) response shapes of the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutwardPayload {
    Reply {
        ai_response: String,
        ghl_convo_id: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        add_convo_id_action: bool,
    },
    Action {
        ghl_convo_id: String,
        stop: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        add_convo_id_action: bool,
    },
    TechnicalBug {
        stop: bool,
        technical_bug: String,
    },
    NoNewTurns {
        info: String,
        ghl_convo_id: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        add_convo_id_action: bool,
    },
}

pub const NO_NEW_TURNS_INFO: &str = "No new messages to process";

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn message_deserializes_crm_shape() {
        let messages: Vec<Message> = serde_json::from_value(json!([
            { "id": "m1", "body": "hi", "direction": "inbound", "type": 3 },
            { "direction": "outbound" },
            { "body": "note", "direction": "internal" }
        ]))
        .unwrap();

        assert_eq!(messages[0], Message::inbound("hi"));
        assert_eq!(messages[1], Message::outbound(""));
        assert_eq!(messages[2].direction, Direction::Other);
    }

    #[test]
    fn null_body_and_direction_are_tolerated() {
        let messages: Vec<Message> = serde_json::from_value(json!([
            { "body": "hi", "direction": "inbound" },
            { "body": null, "direction": "outbound" },
            { "body": "call", "direction": null },
            { "body": "no direction" }
        ]))
        .unwrap();

        assert_eq!(messages[0], Message::inbound("hi"));
        assert_eq!(messages[1], Message::outbound(""));
        assert_eq!(messages[2].direction, Direction::Other);
        assert_eq!(messages[3].direction, Direction::Other);
    }

    #[test]
    fn turn_serializes_as_thread_message() {
        let value = serde_json::to_value(Turn::user("hello")).unwrap();
        assert_eq!(value, json!({ "role": "user", "content": "hello" }));
    }

    #[test]
    fn run_status_mapping() {
        assert_eq!(
            RunOutcome::from_status("run_1", "completed", vec![]),
            RunOutcome::Completed {
                run_id: "run_1".into()
            }
        );
        for status in ["cancelled", "failed", "expired", "incomplete"] {
            assert_eq!(
                RunOutcome::from_status("run_1", status, vec![]),
                RunOutcome::TerminalFailure {
                    status: status.into()
                }
            );
        }
        assert_eq!(
            RunOutcome::from_status("run_1", "queued", vec![]),
            RunOutcome::Unknown {
                status: "queued".into()
            }
        );
    }

    #[test]
    fn payload_shapes() {
        let reply = OutwardPayload::Reply {
            ai_response: "hello there".into(),
            ghl_convo_id: "conv1".into(),
            add_convo_id_action: false,
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({ "ai_response": "hello there", "ghl_convo_id": "conv1" })
        );

        let action = OutwardPayload::Action {
            ghl_convo_id: "conv1".into(),
            stop: "handoff".into(),
            add_convo_id_action: true,
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({ "ghl_convo_id": "conv1", "stop": "handoff", "add_convo_id_action": true })
        );

        let bug = OutwardPayload::TechnicalBug {
            stop: true,
            technical_bug: "failed".into(),
        };
        assert_eq!(
            serde_json::to_value(&bug).unwrap(),
            json!({ "stop": true, "technical_bug": "failed" })
        );
    }
}
