//! Capability execution against a fake sandbox.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};
use toolsmith::capabilities::{CapabilityStatus, NewCapability, Registration};
use toolsmith::runtime::Runtime;
use toolsmith::sandbox::{CodeError, CodeOutput, LocalSandboxProvider};

use common::{FakeSandboxProvider, ScriptedProvider};

fn runtime_with(sandboxes: Arc<FakeSandboxProvider>) -> (tempfile::TempDir, Arc<Runtime>) {
    let dir = tempfile::tempdir().unwrap();
    let rt = common::runtime(
        &dir,
        common::test_config(),
        Arc::new(ScriptedProvider::new(Vec::new())),
        sandboxes,
    );
    (dir, rt)
}

fn install(rt: &Runtime, name: &str, requirements: &str) -> String {
    install_code(rt, name, "def run(args, context):\n    return 'x'\n", requirements)
}

fn install_code(rt: &Runtime, name: &str, main_py: &str, requirements: &str) -> String {
    let cap = rt
        .catalog
        .create(NewCapability {
            name: name.into(),
            description: "test capability".into(),
            ..Default::default()
        })
        .unwrap();
    rt.catalog
        .register(
            name,
            Registration {
                description: "test capability".into(),
                main_py: main_py.into(),
                requirements_txt: requirements.into(),
                input_schema: json!({"type": "object", "properties": {}}),
                tags: None,
                required_secrets: vec![],
            },
        )
        .unwrap();
    cap.id
}

#[tokio::test]
async fn successful_run_merges_storage_and_passes_context() {
    let sandboxes = Arc::new(FakeSandboxProvider::returning(json!({
        "response": "sunny",
        "storage": {"calls": 1}
    })));
    let (_dir, rt) = runtime_with(sandboxes.clone());
    let id = install(&rt, "weather_lookup", "");
    rt.secrets.set(&id, "API_KEY", "k-123").unwrap();
    let mut prior = serde_json::Map::new();
    prior.insert("region".into(), json!("eu"));
    rt.storage.merge(&id, &prior).unwrap();

    let out = rt
        .executor
        .execute(&id, &json!({"city": "Oslo"}))
        .await
        .unwrap();
    assert!(out.success, "{out:?}");
    assert_eq!(out.result.as_deref(), Some("sunny"));
    assert_eq!(out.stdout, "working...");

    let storage = rt.storage.get(&id).unwrap();
    assert_eq!(storage["calls"], json!(1));
    assert_eq!(storage["region"], json!("eu"));

    let files = sandboxes.log.files.lock().unwrap().clone();
    assert!(files["main.py"].contains("def run"));
    let args: Value = serde_json::from_str(&files["__args.json"]).unwrap();
    assert_eq!(args, json!({"city": "Oslo"}));
    let context: Value = serde_json::from_str(&files["__context.json"]).unwrap();
    assert_eq!(context["secrets"]["API_KEY"], "k-123");
    assert_eq!(context["storage"]["region"], "eu");

    // no requirements, no pip
    assert!(sandboxes.log.commands.lock().unwrap().is_empty());
    assert_eq!(sandboxes.log.created.load(Ordering::SeqCst), 1);
    assert_eq!(sandboxes.log.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn python_exception_is_reported_as_failure() {
    let sandboxes = Arc::new(FakeSandboxProvider::with_output(CodeOutput {
        stderr: vec!["warning: deprecated".into()],
        error: Some(CodeError {
            name: "ValueError".into(),
            value: "city is required".into(),
            traceback: "Traceback (most recent call last): ...".into(),
        }),
        ..CodeOutput::default()
    }));
    let (_dir, rt) = runtime_with(sandboxes.clone());
    let id = install(&rt, "weather_lookup", "");

    let out = rt.executor.execute(&id, &json!({})).await.unwrap();
    assert!(!out.success);
    assert_eq!(out.error.as_deref(), Some("ValueError: city is required"));
    assert!(out.stderr.contains("deprecated"));
    assert!(out.stderr.contains("Traceback"));
    assert_eq!(sandboxes.log.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_result_marker_fails() {
    let sandboxes = Arc::new(FakeSandboxProvider::with_output(CodeOutput {
        stdout: vec!["printed but never returned".into()],
        ..CodeOutput::default()
    }));
    let (_dir, rt) = runtime_with(sandboxes);
    let id = install(&rt, "weather_lookup", "");

    let out = rt.executor.execute(&id, &json!({})).await.unwrap();
    assert!(!out.success);
    assert_eq!(out.error.as_deref(), Some("Capability produced no result"));
    assert_eq!(out.stdout, "printed but never returned");
}

#[tokio::test]
async fn failed_install_stops_before_running() {
    let sandboxes = Arc::new(
        FakeSandboxProvider::returning(json!({"response": "unused"})).failing_commands(1),
    );
    let (_dir, rt) = runtime_with(sandboxes.clone());
    let id = install(&rt, "weather_lookup", "requests\n");

    let out = rt.executor.execute(&id, &json!({})).await.unwrap();
    assert!(!out.success);
    assert!(out
        .error
        .unwrap()
        .starts_with("Failed to install requirements"));
    assert_eq!(sandboxes.log.code_runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        sandboxes.log.commands.lock().unwrap().as_slice(),
        ["pip install -r requirements.txt"]
    );
    assert_eq!(sandboxes.log.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn inactive_or_unknown_capability_is_rejected_without_a_sandbox() {
    let sandboxes = Arc::new(FakeSandboxProvider::new());
    let (_dir, rt) = runtime_with(sandboxes.clone());
    let id = install(&rt, "weather_lookup", "");
    rt.catalog
        .set_status(&id, CapabilityStatus::Disabled)
        .unwrap();

    let err = rt.executor.execute(&id, &json!({})).await.unwrap_err();
    assert!(err.to_string().contains("is not active"));

    let err = rt.executor.execute("nope", &json!({})).await.unwrap_err();
    assert!(err.to_string().contains("not found"));

    assert_eq!(sandboxes.log.created.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Real wrapper over the local sandbox (needs python3 on PATH)
// ---------------------------------------------------------------------------

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

const LEGACY: &str = "def run(args):\n    return 'hi ' + args['name']\n";

const COUNTER: &str = "\
def run(args, context):
    n = context['storage'].get('count', 2) + 1
    return {'response': f\"{n}:{context['secrets']['TOKEN']}\", 'storage': {'count': n}}
";

const ECHO_STORAGE: &str = "\
def run(args, context):
    return {'response': context['storage']}
";

#[tokio::test]
async fn local_sandbox_runs_both_entry_point_signatures() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let sandbox_root = dir.path().join("sandboxes");
    let rt = common::runtime(
        &dir,
        common::test_config(),
        Arc::new(ScriptedProvider::new(Vec::new())),
        Arc::new(LocalSandboxProvider::new(&sandbox_root, "python3")),
    );

    let legacy = install_code(&rt, "greeter", LEGACY, "");
    let out = rt
        .executor
        .execute(&legacy, &json!({"name": "bob"}))
        .await
        .unwrap();
    assert!(out.success, "{out:?}");
    assert_eq!(out.result.as_deref(), Some("hi bob"));

    let counter = install_code(&rt, "counter", COUNTER, "");
    rt.secrets.set(&counter, "TOKEN", "v").unwrap();
    let first = rt.executor.execute(&counter, &json!({})).await.unwrap();
    assert_eq!(first.result.as_deref(), Some("3:v"), "{first:?}");
    let second = rt.executor.execute(&counter, &json!({})).await.unwrap();
    assert_eq!(second.result.as_deref(), Some("4:v"), "{second:?}");
    assert_eq!(rt.storage.get(&counter).unwrap()["count"], json!(4));

    // another capability never sees the counter's storage; a non-string
    // response is JSON-encoded
    let other = install_code(&rt, "storage_echo", ECHO_STORAGE, "");
    let out = rt.executor.execute(&other, &json!({})).await.unwrap();
    assert!(out.success, "{out:?}");
    assert_eq!(out.result.as_deref(), Some("{}"));
    assert!(rt.storage.get(&other).unwrap().is_empty());

    let leftover = std::fs::read_dir(&sandbox_root).unwrap().count();
    assert_eq!(leftover, 0, "sandbox directories were not cleaned up");
}
