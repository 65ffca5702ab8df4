//! Catalog tools: `lookup_capability`, `request_capability`,
//! `execute_capability`, plus the execution path used for `cap_*` calls.

use serde_json::{json, Value};
use tracing::info;

use super::required_str;
use crate::capabilities::{CapabilityStatus, NewCapability};
use crate::tools::{ToolContext, ToolDef, REQUEST_CAPABILITY};

const FUZZY_LIMIT: usize = 10;

pub fn lookup_def() -> ToolDef {
    ToolDef::new(
        "lookup_capability",
        "Check if a capability exists in the catalog by name or keyword. Returns the \
         capability metadata if found, or a message indicating it does not exist. Use this \
         before trying to execute a capability to verify it exists.",
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Exact name or search keyword for the capability" }
            },
            "required": ["name"]
        }),
    )
}

pub fn request_def() -> ToolDef {
    ToolDef::new(
        REQUEST_CAPABILITY,
        "Request the creation of a new capability. This starts a builder that writes Python \
         code, tests it in a sandbox, and registers it in the catalog. Use this when the user \
         asks for something that needs a tool you do not have.",
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Short snake_case name for the capability (e.g. \"send_email\", \"weather_lookup\")"
                },
                "description": {
                    "type": "string",
                    "description": "Detailed description of what the capability should do, including expected inputs and outputs"
                },
                "input_schema": {
                    "type": "object",
                    "description": "JSON Schema describing the expected input parameters"
                }
            },
            "required": ["name", "description"]
        }),
    )
}

pub fn execute_def() -> ToolDef {
    ToolDef::new(
        "execute_capability",
        "Execute an existing capability from the catalog by name. The capability must have \
         status \"active\". Provide the input parameters as a JSON object matching its input_schema.",
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Name of the capability to execute" },
                "input": {
                    "type": "object",
                    "description": "Input parameters for the capability, matching its input_schema"
                }
            },
            "required": ["name"]
        }),
    )
}

/// Exact lookup by name (any status), then a case-insensitive substring
/// search over active capabilities.
pub async fn lookup_capability(ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
    let name = required_str(&args, "lookup_capability", "name")?;

    if let Some(cap) = ctx.catalog.get_by_name(name)? {
        return Ok(json!({
            "found": true,
            "capability": {
                "id": cap.id,
                "name": cap.name,
                "description": cap.description,
                "status": cap.status,
                "input_schema": cap.input_schema,
            }
        }));
    }

    let matches: Vec<Value> = ctx
        .catalog
        .search(name, FUZZY_LIMIT)?
        .into_iter()
        .map(|c| json!({ "id": c.id, "name": c.name, "description": c.description }))
        .collect();

    if matches.is_empty() {
        return Ok(json!({
            "found": false,
            "message": format!("No capability matching \"{name}\" found."),
        }));
    }
    Ok(json!({ "found": true, "matches": matches }))
}

/// Create a `building` catalog entry.  The agent loop turns a `building`
/// result into a build job.
pub async fn request_capability(ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
    let name = required_str(&args, REQUEST_CAPABILITY, "name")?;
    let description = required_str(&args, REQUEST_CAPABILITY, "description")?;

    if let Some(existing) = ctx.catalog.get_by_name(name)? {
        return Ok(json!({
            "status": "already_exists",
            "capability_id": existing.id,
            "message": format!(
                "Capability \"{name}\" already exists with status: {}",
                existing.status
            ),
        }));
    }

    let input_schema = args
        .get("input_schema")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));

    let cap = ctx.catalog.create(NewCapability {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: Some(input_schema),
        ..Default::default()
    })?;
    info!(capability_id = %cap.id, name = %cap.name, "capability requested");

    Ok(json!({
        "status": "building",
        "capability_id": cap.id,
        "capability_name": cap.name,
        "message": format!(
            "Capability \"{name}\" is being built. It will be available once the builder completes."
        ),
    }))
}

pub async fn execute_capability(ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
    let name = required_str(&args, "execute_capability", "name")?;
    let input = args
        .get("input")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| json!({}));

    let cap = ctx
        .catalog
        .get_by_name(name)?
        .ok_or_else(|| anyhow::anyhow!("Capability \"{name}\" not found in catalog."))?;
    if cap.status != CapabilityStatus::Active {
        anyhow::bail!("Capability \"{name}\" is not active (status: {}).", cap.status);
    }
    run_capability(ctx, &cap.id, &cap.name, &input).await
}

/// Run a capability through the executor and shape the result for the model.
pub async fn run_capability(
    ctx: &ToolContext,
    id: &str,
    name: &str,
    input: &Value,
) -> anyhow::Result<Value> {
    let out = ctx.executor.execute(id, input).await?;
    if !out.success {
        let error = out
            .error
            .unwrap_or_else(|| "Capability execution failed".to_string());
        anyhow::bail!("{name}: {error}");
    }
    Ok(json!({ "status": "success", "result": out.result }))
}
