//! Memory tools: `store_memory` and `recall_memory`.

use serde_json::{json, Value};

use super::{required_str, string_list};
use crate::memory::MemoryTier;
use crate::tools::{ToolContext, ToolDef};

pub fn store_def() -> ToolDef {
    ToolDef::new(
        "store_memory",
        "Store a piece of information about the user in memory. Use this when the user tells \
         you something important they want remembered, or when you identify a significant \
         preference or fact.",
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "The fact or information to remember" },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Keywords/tags for retrieval (e.g. [\"preference\", \"food\"])"
                },
                "tier": {
                    "type": "string",
                    "enum": ["short_term", "long_term"],
                    "description": "Memory tier. Use long_term for important persistent facts."
                }
            },
            "required": ["content"]
        }),
    )
}

pub fn recall_def() -> ToolDef {
    ToolDef::new(
        "recall_memory",
        "Search memories by keywords or tags. Use this to recall information about the user \
         that may not be in the current conversation.",
        json!({
            "type": "object",
            "properties": {
                "keywords": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Keywords to search for in memory content and tags"
                },
                "limit": { "type": "number", "description": "Maximum number of memories to return (default: 5)" }
            },
            "required": ["keywords"]
        }),
    )
}

pub async fn store_memory(ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
    let content = required_str(&args, "store_memory", "content")?;
    let tags = string_list(&args, "tags");
    let tier = match args.get("tier").and_then(Value::as_str) {
        Some(t) => t.parse()?,
        None => MemoryTier::LongTerm,
    };

    let entry = ctx.memory.save(content, &tags, tier)?;
    Ok(json!({
        "stored": true,
        "memory_id": entry.id,
        "message": format!("Remembered: \"{content}\""),
    }))
}

pub async fn recall_memory(ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
    let keywords = string_list(&args, "keywords");
    let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;

    let memories = ctx.memory.recall(&keywords, limit)?;
    if memories.is_empty() {
        return Ok(json!({ "found": false, "message": "No relevant memories found." }));
    }
    let items: Vec<Value> = memories
        .iter()
        .map(|m| {
            json!({
                "content": m.content,
                "tier": m.tier,
                "tags": m.tags,
                "priority": m.priority,
            })
        })
        .collect();
    Ok(json!({ "found": true, "memories": items }))
}
