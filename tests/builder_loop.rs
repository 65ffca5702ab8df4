//! Builder runs end to end against a scripted model and a fake sandbox.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use toolsmith::builder::{BuildJob, NOT_REGISTERED, ROUNDS_EXCEEDED};
use toolsmith::capabilities::{CapabilityStatus, NewCapability};
use toolsmith::relay::{Direction, MessageKind};
use toolsmith::runtime::Runtime;

use common::{call, calls, reply, FakeSandboxProvider, ScriptedProvider};

fn setup(
    provider: Arc<ScriptedProvider>,
) -> (tempfile::TempDir, Arc<Runtime>, Arc<FakeSandboxProvider>) {
    let dir = tempfile::tempdir().unwrap();
    let sandboxes = Arc::new(FakeSandboxProvider::returning(json!({"response": "ok"})));
    let rt = common::runtime(&dir, common::test_config(), provider, sandboxes.clone());
    (dir, rt, sandboxes)
}

fn requested(rt: &Runtime, name: &str) -> BuildJob {
    let cap = rt
        .catalog
        .create(NewCapability {
            name: name.into(),
            description: "Weather by city".into(),
            ..Default::default()
        })
        .unwrap();
    BuildJob::for_capability(cap.id, cap.name, "Weather by city")
}

fn kinds(rt: &Runtime, build_id: &str) -> Vec<MessageKind> {
    rt.relay
        .peek(build_id, Direction::ToUser)
        .unwrap()
        .into_iter()
        .map(|m| m.kind)
        .collect()
}

#[tokio::test]
async fn build_registers_capability_and_completes() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        calls(&[
            ("write_file", json!({"path": "main.py", "content": "def run(args): pass"})),
            ("report_progress", json!({"step": "Testing", "detail": "running smoke test"})),
        ]),
        call("run_code", json!({"code": "print('hi')"})),
        call("register_capability", common::register_args("weather_lookup")),
    ]));
    let (_dir, rt, sandboxes) = setup(provider.clone());
    let job = requested(&rt, "weather_lookup");

    let outcome = rt.builder.run(job.clone()).await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.capability_id, job.capability_id);
    assert_eq!(provider.call_count(), 3);

    let cap = rt.catalog.get_by_name("weather_lookup").unwrap().unwrap();
    assert_eq!(cap.status, CapabilityStatus::Active);
    assert_eq!(cap.version, 2);
    let manifest = rt.catalog.load_manifest(&cap).unwrap().unwrap();
    assert_eq!(manifest.required_secrets[0].name, "API_KEY");

    assert_eq!(
        kinds(&rt, &job.build_id),
        vec![MessageKind::Progress, MessageKind::Progress, MessageKind::Complete]
    );
    let complete = rt
        .relay
        .peek(&job.build_id, Direction::ToUser)
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(complete.payload["capability_name"], "weather_lookup");

    assert_eq!(
        sandboxes.log.files.lock().unwrap()["main.py"],
        "def run(args): pass"
    );
    assert_eq!(sandboxes.log.created.load(Ordering::SeqCst), 1);
    assert_eq!(sandboxes.log.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_budget_fails_exactly_once() {
    let provider = Arc::new(ScriptedProvider::repeating(call(
        "run_command",
        json!({"command": "ls"}),
    )));
    let (_dir, rt, sandboxes) = setup(provider.clone());
    let job = requested(&rt, "weather_lookup");

    let outcome = rt.builder.run(job.clone()).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some(ROUNDS_EXCEEDED));
    assert_eq!(provider.call_count(), rt.config.builder.max_rounds);

    let messages = rt.relay.peek(&job.build_id, Direction::ToUser).unwrap();
    let errors: Vec<_> = messages
        .iter()
        .filter(|m| m.kind == MessageKind::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload["error"], ROUNDS_EXCEEDED);
    assert_eq!(messages.last().unwrap().kind, MessageKind::Error);

    let cap = rt.catalog.get_by_name("weather_lookup").unwrap().unwrap();
    assert_eq!(cap.status, CapabilityStatus::Failed);
    assert_eq!(sandboxes.log.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stopping_without_registration_is_a_failure() {
    let provider = Arc::new(ScriptedProvider::new(vec![reply("I think I'm done.")]));
    let (_dir, rt, sandboxes) = setup(provider);
    let job = requested(&rt, "weather_lookup");

    let outcome = rt.builder.run(job.clone()).await;
    assert_eq!(outcome.error.as_deref(), Some(NOT_REGISTERED));
    assert_eq!(
        kinds(&rt, &job.build_id),
        vec![MessageKind::Progress, MessageKind::Error]
    );
    assert_eq!(
        rt.catalog.get(&job.build_id).unwrap().unwrap().status,
        CapabilityStatus::Failed
    );
    assert_eq!(sandboxes.log.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn model_failure_fails_the_build() {
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let (_dir, rt, _sandboxes) = setup(provider);
    let job = requested(&rt, "weather_lookup");

    let outcome = rt.builder.run(job.clone()).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("builder model call failed"));
    assert_eq!(
        rt.catalog.get(&job.build_id).unwrap().unwrap().status,
        CapabilityStatus::Failed
    );
}

#[tokio::test]
async fn registering_an_unrequested_name_is_reported_to_the_model() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        call("register_capability", common::register_args("something_else")),
        call("register_capability", common::register_args("weather_lookup")),
    ]));
    let (_dir, rt, _sandboxes) = setup(provider.clone());
    let job = requested(&rt, "weather_lookup");

    let outcome = rt.builder.run(job).await;
    assert!(outcome.success);
    let results = provider.tool_results();
    assert!(results[0].starts_with("Tool error:"));
    assert!(results[0].contains("something_else"));
    assert!(rt.catalog.get_by_name("something_else").unwrap().is_none());
}

#[tokio::test]
async fn ask_user_waits_for_an_answer_on_the_relay() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        call("ask_user", json!({"question": "Celsius or Fahrenheit?"})),
        call("register_capability", common::register_args("weather_lookup")),
    ]));
    let (_dir, rt, _sandboxes) = setup(provider.clone());
    let job = requested(&rt, "weather_lookup");

    let relay = rt.relay.clone();
    let build_id = job.build_id.clone();
    let answerer = tokio::spawn(async move {
        for _ in 0..100 {
            let pending = relay.poll(&build_id, Direction::ToUser).unwrap();
            if let Some(q) = pending.iter().find(|m| m.kind == MessageKind::Question) {
                assert_eq!(q.payload["question"], "Celsius or Fahrenheit?");
                relay.push_answer(&build_id, "Celsius").unwrap();
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    });

    let outcome = rt.builder.run(job).await;
    assert!(answerer.await.unwrap(), "question never reached the user queue");
    assert!(outcome.success);
    assert_eq!(provider.tool_results()[0], "Celsius");
}

#[tokio::test]
async fn unanswered_secret_request_times_out() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        call(
            "request_secret",
            json!({"name": "API_KEY", "description": "weather service key"}),
        ),
        call("register_capability", common::register_args("weather_lookup")),
    ]));
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::test_config();
    config.builder.secret_timeout_secs = 0;
    let rt = common::runtime(
        &dir,
        config,
        provider.clone(),
        Arc::new(FakeSandboxProvider::new()),
    );
    let job = requested(&rt, "weather_lookup");

    let outcome = rt.builder.run(job.clone()).await;
    assert!(outcome.success);

    let request = rt
        .relay
        .peek(&job.build_id, Direction::ToUser)
        .unwrap()
        .into_iter()
        .find(|m| m.kind == MessageKind::SecretRequest)
        .unwrap();
    assert_eq!(request.payload["name"], "API_KEY");
    assert_eq!(request.payload["capability_id"], job.build_id.as_str());
    assert!(provider.tool_results()[0].contains("did not provide the secret"));
}
