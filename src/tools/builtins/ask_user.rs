//! `ask_user`: pause the turn with a clarifying question.
//!
//! The agent loop intercepts this tool before dispatch; the handler only
//! runs when something dispatches it directly.

use serde_json::{json, Value};

use super::required_str;
use crate::tools::{ToolDef, ASK_USER};

pub fn def() -> ToolDef {
    ToolDef::new(
        ASK_USER,
        "Ask the user a clarifying question and wait for their response. Use this when you \
         need more information to fulfill a request. Keep the question concise.",
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The question to ask the user" }
            },
            "required": ["question"]
        }),
    )
}

pub async fn ask_user(args: Value) -> anyhow::Result<Value> {
    let question = required_str(&args, ASK_USER, "question")?;
    Ok(json!({ "status": "question_sent", "question": question }))
}
