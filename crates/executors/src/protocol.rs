//! Line-delimited JSON protocol spoken by the coding agent on stdout.
//!
//! Every newline-terminated line is an independently parseable JSON object.
//! The agent occasionally prints non-protocol status text before streaming
//! begins, so lines that fail to parse are dropped rather than surfaced.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utils::text::truncate_to_char_boundary;

/// Upper bound for tool-call argument summaries shown to humans.
const MAX_SUMMARY_BYTES: usize = 80;

/// Top-level message shapes recognized on the agent's stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Assistant {
        #[serde(default)]
        message: Option<MessageBody>,
        #[serde(default)]
        content: Option<Vec<ContentBlock>>,
    },
    User {
        #[serde(default)]
        message: Option<MessageBody>,
        #[serde(default)]
        content: Option<Vec<ContentBlock>>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: Option<bool>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        num_turns: Option<u64>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    #[serde(untagged)]
    Other(Value),
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    #[serde(untagged)]
    Other(Value),
}

/// Envelope for follow-up input sent to a bidirectional agent over stdin,
/// one JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    User { message: OutboundUserMessage },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundUserMessage {
    role: String,
    content: String,
}

impl OutboundMessage {
    pub fn new_user(content: impl Into<String>) -> Self {
        Self::User {
            message: OutboundUserMessage {
                role: "user".to_string(),
                content: content.into(),
            },
        }
    }
}

/// Summary of one completed agent turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    /// Session identifier reported by the agent itself, usable for resume.
    pub agent_session_id: Option<String>,
    /// Terminal result text, falling back to the last text block of the turn.
    pub text: String,
    /// Cumulative turn count.
    pub turns: u64,
    pub duration_ms: Option<u64>,
    /// Cumulative cost. None when the agent does not report cost.
    pub cost_usd: Option<f64>,
}

/// The single tagged event union delivered per session. Channel close means
/// the backing process is gone and finalization may run.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Thinking { text: String },
    ToolCall { tool: String, summary: String },
    ToolResult,
    TurnResult(SessionResult),
    Error { message: String },
}

/// Stateful decoder for one session's stdout stream.
///
/// The only state carried across lines is the most recent assistant text
/// block, retained until the next result event consumes it as fallback
/// display text.
#[derive(Debug, Default)]
pub struct StreamParser {
    last_text: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one stdout line into zero or more session events.
    ///
    /// Empty, non-JSON and unrecognized lines yield nothing.
    pub fn parse_line(&mut self, line: &str) -> Vec<SessionEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let msg: AgentMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(_) => return Vec::new(),
        };
        match msg {
            AgentMessage::Assistant { message, content } => {
                let blocks = message.map(|m| m.content).or(content).unwrap_or_default();
                let mut events = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            self.last_text = Some(text.clone());
                            events.push(SessionEvent::Thinking { text });
                        }
                        ContentBlock::ToolUse { name, input } => {
                            let summary = summarize_tool_input(&name, &input);
                            events.push(SessionEvent::ToolCall {
                                tool: name,
                                summary,
                            });
                        }
                        ContentBlock::ToolResult { .. } | ContentBlock::Other(_) => {}
                    }
                }
                events
            }
            AgentMessage::User { message, content } => {
                let blocks = message.map(|m| m.content).or(content).unwrap_or_default();
                blocks
                    .into_iter()
                    .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
                    .map(|_| SessionEvent::ToolResult)
                    .collect()
            }
            AgentMessage::Result {
                subtype,
                is_error,
                result,
                session_id,
                num_turns,
                duration_ms,
                total_cost_usd,
            } => {
                let failed = is_error.unwrap_or(false)
                    || subtype.as_deref().is_some_and(|s| s.starts_with("error"));
                let text = result.filter(|t| !t.trim().is_empty());
                if failed {
                    self.last_text = None;
                    let message =
                        text.unwrap_or_else(|| "agent reported an error result".to_string());
                    vec![SessionEvent::Error { message }]
                } else {
                    let text = text.or_else(|| self.last_text.take()).unwrap_or_default();
                    self.last_text = None;
                    vec![SessionEvent::TurnResult(SessionResult {
                        agent_session_id: session_id,
                        text,
                        turns: num_turns.unwrap_or(0),
                        duration_ms,
                        cost_usd: total_cost_usd.filter(|c| *c >= 0.0),
                    })]
                }
            }
            AgentMessage::Other(_) => Vec::new(),
        }
    }
}

/// Bounded, human-readable summary of a tool invocation's input: the file
/// path for file tools, the truncated command for the shell tool, the
/// truncated pattern for search tools. Unrecognized shapes summarize to an
/// empty string.
pub fn summarize_tool_input(tool: &str, input: &Value) -> String {
    let field = match tool {
        "Read" | "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => "file_path",
        "Bash" => "command",
        "Grep" | "Glob" => "pattern",
        "LS" => "path",
        "WebFetch" => "url",
        _ => return String::new(),
    };
    input
        .get(field)
        .and_then(Value::as_str)
        .map(|s| truncate_to_char_boundary(s, MAX_SUMMARY_BYTES).to_string())
        .unwrap_or_default()
}
