//! Tracing setup and live log broadcasting.
//!
//! [`init_tracing`] installs an `EnvFilter` (default `info`, `RUST_LOG`
//! overrides), the usual `fmt` layer and a [`BroadcastLayer`] that turns
//! every event into one JSON line on a global broadcast channel.  The
//! gateway streams that channel on `/ws/logs`.

use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_CHANNEL_CAPACITY: usize = 512;

static LOGS_TX: OnceLock<broadcast::Sender<String>> = OnceLock::new();

/// Sender of the global log channel, created on first use.
pub fn init_broadcast() -> broadcast::Sender<String> {
    LOGS_TX
        .get_or_init(|| broadcast::channel::<String>(LOG_CHANNEL_CAPACITY).0)
        .clone()
}

/// `None` until [`init_broadcast`] has run.
pub fn subscribe() -> Option<broadcast::Receiver<String>> {
    LOGS_TX.get().map(broadcast::Sender::subscribe)
}

/// Install the global subscriber.  Safe to call more than once; later
/// calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(BroadcastLayer::new(init_broadcast()))
        .try_init();
}

// ── Layer ───────────────────────────────────────────────────

#[derive(Serialize)]
struct LogLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    level: &'static str,
    target: &'a str,
    message: String,
    fields: Map<String, Value>,
    ts: String,
}

pub struct BroadcastLayer {
    tx: broadcast::Sender<String>,
}

impl BroadcastLayer {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Nobody listening: skip the formatting.
        if self.tx.receiver_count() == 0 {
            return;
        }
        let meta = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let line = LogLine {
            kind: "log",
            level: meta.level().as_str(),
            target: meta.target(),
            message: fields.message.unwrap_or_default(),
            fields: fields.fields,
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        };
        if let Ok(json) = serde_json::to_string(&line) {
            let _ = self.tx.send(json);
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}
