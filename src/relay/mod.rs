//! Durable message relay between interactive sessions and detached builds.
//!
//! Messages are append-only rows partitioned by `(build_id, direction)`.
//! [`Relay::poll`] is a destructive read: it returns every unconsumed row of
//! one partition in creation order and marks them consumed in the same
//! transaction.  [`Relay::peek`] reads without consuming.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::store::Database;
use crate::utils::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToUser,
    ToBuilder,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToUser => "to_user",
            Self::ToBuilder => "to_builder",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "to_user" => Ok(Self::ToUser),
            "to_builder" => Ok(Self::ToBuilder),
            other => anyhow::bail!("unknown relay direction: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Question,
    Answer,
    Progress,
    Complete,
    Error,
    SecretRequest,
    SecretResponse,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Answer => "answer",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::SecretRequest => "secret_request",
            Self::SecretResponse => "secret_response",
        }
    }

    /// `complete` and `error` end a build's `to_user` stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl std::str::FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "question" => Self::Question,
            "answer" => Self::Answer,
            "progress" => Self::Progress,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "secret_request" => Self::SecretRequest,
            "secret_response" => Self::SecretResponse,
            other => anyhow::bail!("unknown relay message kind: {other}"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: String,
    pub build_id: String,
    pub direction: Direction,
    pub kind: MessageKind,
    pub payload: Value,
    pub consumed: bool,
    pub created_at: i64,
}

const COLUMNS: &str = "seq, id, build_id, direction, kind, payload, consumed, created_at";

type RawMessage = (i64, String, String, String, String, String, bool, i64);

fn from_row(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_message(raw: RawMessage) -> anyhow::Result<RelayMessage> {
    let (_seq, id, build_id, direction, kind, payload, consumed, created_at) = raw;
    Ok(RelayMessage {
        id,
        build_id,
        direction: direction.parse()?,
        kind: kind.parse()?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::String(payload)),
        consumed,
        created_at,
    })
}

pub struct Relay {
    db: Arc<Database>,
}

impl Relay {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a message to the `(build_id, direction)` queue.
    pub fn push(
        &self,
        build_id: &str,
        direction: Direction,
        kind: MessageKind,
        payload: Value,
    ) -> anyhow::Result<RelayMessage> {
        let msg = RelayMessage {
            id: uuid::Uuid::new_v4().to_string(),
            build_id: build_id.to_string(),
            direction,
            kind,
            payload,
            consumed: false,
            created_at: now_millis(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO relay_messages (id, build_id, direction, kind, payload, consumed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    msg.id,
                    msg.build_id,
                    direction.as_str(),
                    kind.as_str(),
                    msg.payload.to_string(),
                    msg.created_at,
                ],
            )?;
            Ok(())
        })?;
        debug!(build_id, direction = direction.as_str(), kind = kind.as_str(), "relay push");
        Ok(msg)
    }

    /// Return and consume every pending message of one queue, oldest first.
    pub fn poll(&self, build_id: &str, direction: Direction) -> anyhow::Result<Vec<RelayMessage>> {
        let raws = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let raws = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {COLUMNS} FROM relay_messages
                     WHERE build_id = ?1 AND direction = ?2 AND consumed = 0
                     ORDER BY seq"
                ))?;
                let raws = stmt
                    .query_map(params![build_id, direction.as_str()], from_row)?
                    .collect::<rusqlite::Result<Vec<RawMessage>>>()?;
                raws
            };
            if let Some(last) = raws.last() {
                tx.execute(
                    "UPDATE relay_messages SET consumed = 1
                     WHERE build_id = ?1 AND direction = ?2 AND consumed = 0 AND seq <= ?3",
                    params![build_id, direction.as_str(), last.0],
                )?;
            }
            tx.commit()?;
            Ok(raws)
        })?;
        raws.into_iter()
            .map(|raw| {
                into_message(raw).map(|mut m| {
                    m.consumed = true;
                    m
                })
            })
            .collect()
    }

    /// All messages of one queue, consumed or not, without marking anything.
    pub fn peek(&self, build_id: &str, direction: Direction) -> anyhow::Result<Vec<RelayMessage>> {
        let raws = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM relay_messages
                 WHERE build_id = ?1 AND direction = ?2
                 ORDER BY seq"
            ))?;
            let raws = stmt
                .query_map(params![build_id, direction.as_str()], from_row)?
                .collect::<rusqlite::Result<Vec<RawMessage>>>()?;
            Ok(raws)
        })?;
        raws.into_iter().map(into_message).collect()
    }

    /// Poll until a message of one of `kinds` shows up or `timeout` elapses.
    ///
    /// Messages of other kinds consumed along the way are discarded.  A
    /// timeout yields `Ok(None)`.
    pub async fn wait_for(
        &self,
        build_id: &str,
        direction: Direction,
        kinds: &[MessageKind],
        timeout: Duration,
        interval: Duration,
    ) -> anyhow::Result<Option<RelayMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            let found = self
                .poll(build_id, direction)?
                .into_iter()
                .find(|m| kinds.contains(&m.kind));
            if found.is_some() {
                return Ok(found);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }

    // ── Payload helpers ────────────────────────────────────────

    pub fn push_progress(&self, build_id: &str, step: &str, detail: Option<&str>) -> anyhow::Result<RelayMessage> {
        let mut payload = json!({ "step": step });
        if let Some(detail) = detail {
            payload["detail"] = json!(detail);
        }
        self.push(build_id, Direction::ToUser, MessageKind::Progress, payload)
    }

    pub fn push_error(&self, build_id: &str, error: &str) -> anyhow::Result<RelayMessage> {
        self.push(
            build_id,
            Direction::ToUser,
            MessageKind::Error,
            json!({ "error": error, "recoverable": false }),
        )
    }

    pub fn push_answer(&self, build_id: &str, answer: &str) -> anyhow::Result<RelayMessage> {
        self.push(
            build_id,
            Direction::ToBuilder,
            MessageKind::Answer,
            json!({ "answer": answer }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> Relay {
        Relay::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn poll_consumes_in_order() {
        let relay = relay();
        for step in ["one", "two", "three"] {
            relay.push_progress("b1", step, None).unwrap();
        }
        let got = relay.poll("b1", Direction::ToUser).unwrap();
        let steps: Vec<_> = got.iter().map(|m| m.payload["step"].as_str().unwrap()).collect();
        assert_eq!(steps, ["one", "two", "three"]);
        assert!(relay.poll("b1", Direction::ToUser).unwrap().is_empty());
    }

    #[test]
    fn partitions_are_isolated() {
        let relay = relay();
        relay.push_answer("b1", "yes").unwrap();
        relay.push_progress("b2", "x", None).unwrap();

        assert!(relay.poll("b1", Direction::ToUser).unwrap().is_empty());
        assert_eq!(relay.poll("b1", Direction::ToBuilder).unwrap().len(), 1);
        assert_eq!(relay.poll("b2", Direction::ToUser).unwrap().len(), 1);
    }

    #[test]
    fn peek_does_not_consume() {
        let relay = relay();
        relay.push_error("b1", "boom").unwrap();
        assert_eq!(relay.peek("b1", Direction::ToUser).unwrap().len(), 1);
        let polled = relay.poll("b1", Direction::ToUser).unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].payload["recoverable"], false);

        let peeked = relay.peek("b1", Direction::ToUser).unwrap();
        assert_eq!(peeked.len(), 1);
        assert!(peeked[0].consumed);
    }

    #[tokio::test]
    async fn wait_for_times_out_with_none() {
        let relay = relay();
        let got = relay
            .wait_for(
                "b1",
                Direction::ToBuilder,
                &[MessageKind::Answer],
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn wait_for_returns_matching_kind() {
        let relay = relay();
        relay
            .push("b1", Direction::ToBuilder, MessageKind::SecretResponse, json!({"ok": true}))
            .unwrap();
        let got = relay
            .wait_for(
                "b1",
                Direction::ToBuilder,
                &[MessageKind::Answer, MessageKind::SecretResponse],
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, MessageKind::SecretResponse);
    }
}
