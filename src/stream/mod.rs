//! Agent stream-json wire format and the incremental parser built on it.

pub mod parser;

pub use parser::{ParseOutput, ParseState, ParsedBatch, parse_line, parse_lines};

use serde::Deserialize;
use serde_json::Value;

/// Tools whose `content_block_start` events are surfaced as activities.
pub const RECOGNIZED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "NotebookEdit",
    "Bash",
    "Glob",
    "Grep",
    "LS",
    "Task",
    "TodoWrite",
    "WebFetch",
    "WebSearch",
];

pub fn is_recognized_tool(name: &str) -> bool {
    RECOGNIZED_TOOLS.contains(&name)
}

/// One line of the agent CLI's stream-json output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentLine {
    Assistant {
        message: AssistantMessage,
    },
    ContentBlockStart {
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    Result {
        #[serde(default)]
        result: Value,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<f64>,
    },
    Error {
        #[serde(default)]
        error: Value,
        #[serde(default)]
        message: Option<String>,
    },
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub partial_json: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Pull the interesting argument out of a tool's input.
pub fn summarize_tool_input(name: &str, input: &Value) -> Option<String> {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str()).map(str::to_string);
    match name {
        "Read" | "Write" | "Edit" | "MultiEdit" => field("file_path"),
        "NotebookEdit" => field("notebook_path").or_else(|| field("file_path")),
        "Bash" => field("command").map(|c| truncate_str(&c, 60)),
        "Glob" | "Grep" => field("pattern"),
        "LS" => field("path"),
        "Task" => field("description"),
        "WebFetch" => field("url"),
        "WebSearch" => field("query"),
        "TodoWrite" => input
            .get("todos")
            .and_then(|v| v.as_array())
            .map(|todos| format!("{} todos", todos.len())),
        _ => None,
    }
}

/// Get an emoji for a tool
pub fn tool_emoji(name: &str) -> &'static str {
    match name {
        "Read" => "\u{1F4D6}",                     // 📖
        "Write" => "\u{1F4DD}",                    // 📝
        "Edit" | "MultiEdit" => "\u{270F}\u{FE0F}", // ✏️
        "Bash" => "\u{2699}\u{FE0F}",              // ⚙️
        "Glob" | "LS" => "\u{1F50D}",              // 🔍
        "Grep" => "\u{1F50E}",                     // 🔎
        "Task" => "\u{1F916}",                     // 🤖
        "WebFetch" | "WebSearch" => "\u{1F310}",   // 🌐
        _ => "\u{1F527}",                          // 🔧
    }
}

pub const ELLIPSIS: &str = "...";

/// Truncate a string to at most `max_len` characters, the trailing
/// [`ELLIPSIS`] included when it is cut.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(ELLIPSIS.len())).collect();
        format!("{}{}", kept, ELLIPSIS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_text() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello world"}]},"session_id":"abc"}"#;
        let line: AgentLine = serde_json::from_str(json).unwrap();

        if let AgentLine::Assistant { message } = line {
            if let ContentBlock::Text { text } = &message.content[0] {
                assert_eq!(text, "Hello world");
            } else {
                panic!("Expected Text");
            }
        } else {
            panic!("Expected Assistant line");
        }
    }

    #[test]
    fn test_parse_content_block_start_tool_use() {
        let json = r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"Grep","input":{}}}"#;
        let line: AgentLine = serde_json::from_str(json).unwrap();
        match line {
            AgentLine::ContentBlockStart {
                content_block: ContentBlock::ToolUse { name, id, .. },
            } => {
                assert_eq!(name, "Grep");
                assert_eq!(id, "toolu_1");
            }
            other => panic!("Expected tool_use start, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_line_type_is_explicit_variant() {
        let line: AgentLine = serde_json::from_str(r#"{"type":"message_stop"}"#).unwrap();
        assert!(matches!(line, AgentLine::Unknown));
    }

    #[test]
    fn test_unknown_content_block_type() {
        let json = r#"{"type":"content_block_start","content_block":{"type":"thinking","thinking":""}}"#;
        let line: AgentLine = serde_json::from_str(json).unwrap();
        assert!(matches!(
            line,
            AgentLine::ContentBlockStart {
                content_block: ContentBlock::Other
            }
        ));
    }

    #[test]
    fn test_summarize_tool_input() {
        let input = serde_json::json!({"file_path": "/Users/foo/project/src/main.rs"});
        assert_eq!(
            summarize_tool_input("Read", &input).as_deref(),
            Some("/Users/foo/project/src/main.rs")
        );

        let long = "x".repeat(100);
        let input = serde_json::json!({ "command": long });
        let summary = summarize_tool_input("Bash", &input).unwrap();
        assert_eq!(summary.chars().count(), 60);
        assert!(summary.ends_with("..."));

        let input = serde_json::json!({"pattern": "fn main"});
        assert_eq!(summarize_tool_input("Grep", &input).as_deref(), Some("fn main"));

        let input = serde_json::json!({"todos": [{}, {}, {}]});
        assert_eq!(summarize_tool_input("TodoWrite", &input).as_deref(), Some("3 todos"));

        assert_eq!(summarize_tool_input("Read", &serde_json::json!({})), None);
    }

    #[test]
    fn test_truncate_str_is_char_safe() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("ééééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_recognized_tools() {
        assert!(is_recognized_tool("Bash"));
        assert!(!is_recognized_tool("mcp__custom__thing"));
    }
}
