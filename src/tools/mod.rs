//! Tool dispatcher for the interactive agent.
//!
//! The tool table is rebuilt every turn by [`assemble`] from an immutable
//! snapshot of the catalog: the fixed built-ins first, then every `active`
//! capability under its `cap_` name.  [`dispatch`] routes a tool call
//! through the table, so a capability that is not active in the snapshot is
//! simply not callable.

pub mod builtins;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::capabilities::catalog::tool_input_schema;
use crate::capabilities::{Capability, Catalog, Executor};
use crate::memory::MemoryStore;

pub const ASK_USER: &str = "ask_user";
pub const REQUEST_CAPABILITY: &str = "request_capability";

// ── Tool definitions ────────────────────────────────────────

/// A tool as exposed to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDef {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// `{name, description, parameters}` for function-calling providers.
    pub fn to_function_def(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.input_schema,
        })
    }
}

/// Built-in primitives of the interactive agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    LookupCapability,
    RequestCapability,
    ExecuteCapability,
    AskUser,
    StoreMemory,
    RecallMemory,
}

impl Builtin {
    pub const ALL: [Builtin; 6] = [
        Builtin::LookupCapability,
        Builtin::RequestCapability,
        Builtin::ExecuteCapability,
        Builtin::AskUser,
        Builtin::StoreMemory,
        Builtin::RecallMemory,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::LookupCapability => "lookup_capability",
            Builtin::RequestCapability => REQUEST_CAPABILITY,
            Builtin::ExecuteCapability => "execute_capability",
            Builtin::AskUser => ASK_USER,
            Builtin::StoreMemory => "store_memory",
            Builtin::RecallMemory => "recall_memory",
        }
    }

    pub fn from_name(name: &str) -> Option<Builtin> {
        Builtin::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn def(&self) -> ToolDef {
        match self {
            Builtin::LookupCapability => builtins::capability::lookup_def(),
            Builtin::RequestCapability => builtins::capability::request_def(),
            Builtin::ExecuteCapability => builtins::capability::execute_def(),
            Builtin::AskUser => builtins::ask_user::def(),
            Builtin::StoreMemory => builtins::memory::store_def(),
            Builtin::RecallMemory => builtins::memory::recall_def(),
        }
    }
}

// ── Tool table ──────────────────────────────────────────────

/// Where a tool call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRoute {
    Builtin(Builtin),
    Capability { id: String, name: String },
}

/// The tools available for one turn.
#[derive(Debug, Clone, Default)]
pub struct ToolTable {
    defs: Vec<ToolDef>,
    capabilities: HashMap<String, (String, String)>,
}

impl ToolTable {
    pub fn defs(&self) -> &[ToolDef] {
        &self.defs
    }

    pub fn function_defs(&self) -> Vec<Value> {
        self.defs.iter().map(ToolDef::to_function_def).collect()
    }

    pub fn route(&self, name: &str) -> Option<ToolRoute> {
        if let Some(b) = Builtin::from_name(name) {
            return Some(ToolRoute::Builtin(b));
        }
        self.capabilities.get(name).map(|(id, cap_name)| ToolRoute::Capability {
            id: id.clone(),
            name: cap_name.clone(),
        })
    }
}

/// Build the tool table from a catalog snapshot.  Non-active capabilities
/// in the snapshot are ignored.
pub fn assemble(snapshot: &[Capability]) -> ToolTable {
    let mut table = ToolTable {
        defs: Builtin::ALL.iter().map(Builtin::def).collect(),
        capabilities: HashMap::new(),
    };
    for cap in snapshot.iter().filter(|c| c.is_active()) {
        let tool_name = cap.tool_name();
        if table.capabilities.contains_key(&tool_name) {
            continue;
        }
        table.defs.push(ToolDef {
            name: tool_name.clone(),
            description: format!("[Capability] {}", cap.description),
            input_schema: tool_input_schema(cap),
        });
        table
            .capabilities
            .insert(tool_name, (cap.id.clone(), cap.name.clone()));
    }
    table
}

// ── Dispatch ────────────────────────────────────────────────

/// Shared handles the built-in handlers need.
#[derive(Clone)]
pub struct ToolContext {
    pub catalog: Arc<Catalog>,
    pub executor: Arc<Executor>,
    pub memory: Arc<MemoryStore>,
}

/// Execute one tool call; the result is the text handed back to the model.
pub async fn dispatch(
    table: &ToolTable,
    name: &str,
    input: Value,
    ctx: &ToolContext,
) -> anyhow::Result<String> {
    let route = table
        .route(name)
        .ok_or_else(|| anyhow::anyhow!("Unknown tool: {name}"))?;

    let value = match route {
        ToolRoute::Builtin(b) => match b {
            Builtin::LookupCapability => builtins::capability::lookup_capability(ctx, input).await?,
            Builtin::RequestCapability => builtins::capability::request_capability(ctx, input).await?,
            Builtin::ExecuteCapability => builtins::capability::execute_capability(ctx, input).await?,
            Builtin::AskUser => builtins::ask_user::ask_user(input).await?,
            Builtin::StoreMemory => builtins::memory::store_memory(ctx, input).await?,
            Builtin::RecallMemory => builtins::memory::recall_memory(ctx, input).await?,
        },
        ToolRoute::Capability { id, name } => {
            builtins::capability::run_capability(ctx, &id, &name, &input).await?
        }
    };
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityStatus;

    fn cap(name: &str, status: CapabilityStatus) -> Capability {
        Capability {
            id: format!("id-{name}"),
            name: name.into(),
            description: format!("does {name}"),
            version: 1,
            status,
            input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}, "required": ["q"]}),
            output_schema: json!({}),
            tags: vec![],
            path: String::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn builtins_come_first() {
        let table = assemble(&[cap("weather", CapabilityStatus::Active)]);
        let names: Vec<_> = table.defs().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names[..Builtin::ALL.len()], Builtin::ALL.map(|b| b.name()));
        assert_eq!(names.last(), Some(&"cap_weather"));
    }

    #[test]
    fn only_active_capabilities_are_routable() {
        let table = assemble(&[
            cap("live", CapabilityStatus::Active),
            cap("pending", CapabilityStatus::Building),
            cap("off", CapabilityStatus::Disabled),
        ]);
        assert_eq!(
            table.route("cap_live"),
            Some(ToolRoute::Capability { id: "id-live".into(), name: "live".into() })
        );
        assert_eq!(table.route("cap_pending"), None);
        assert_eq!(table.route("cap_off"), None);
        assert_eq!(table.route("ask_user"), Some(ToolRoute::Builtin(Builtin::AskUser)));
    }

    #[test]
    fn capability_def_uses_prefix_and_object_schema() {
        let table = assemble(&[cap("weather", CapabilityStatus::Active)]);
        let def = table.defs().last().unwrap().to_function_def();
        assert_eq!(def["name"], "cap_weather");
        assert_eq!(def["description"], "[Capability] does weather");
        assert_eq!(def["parameters"]["type"], "object");
        assert_eq!(def["parameters"]["required"], json!(["q"]));
    }
}
