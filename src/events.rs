// Decode boundary for the server's event stream.
//
// The server has shipped several payload shapes for the same event names:
// full entity documents, prefixed field names (`account_name`), and bare
// broker envelopes that carry little more than an id. Everything funnels
// through `decode_event`, which normalizes whatever arrives into one
// canonical `StreamEvent` so the rest of the client never sees the
// variation. An undecodable payload is an error for the caller to log and
// drop; it never takes the stream down.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::store::{Account, AccountId, Batch, BatchId, Bet, BetStatus};

/// A normalized event from the server stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A new account exists. Bare envelopes decode with empty display
    /// fields; the store keeps known values over those placeholders.
    AccountCreated(Account),
    AccountDeleted { id: AccountId },
    /// A batch appeared. `completed` may already be true when creation and
    /// completion share one delivery channel during replays.
    BatchCreated(Batch),
    BatchCompleted { id: BatchId },
    BetStatusUpdated { batch_id: BatchId, pid: String, status: BetStatus },
    /// Keepalive. Confirms the channel is live, mutates nothing.
    Ping,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unrecognized event name: {name}")]
    UnknownEvent { name: String },
    #[error("{event} payload is not valid JSON: {source}")]
    Json {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{event} payload missing required field `{field}`")]
    MissingField { event: &'static str, field: &'static str },
    #[error("{event} payload has invalid `{field}`: {value}")]
    InvalidField {
        event: &'static str,
        field: &'static str,
        value: String,
    },
}

/// Decode one named event with its raw data payload.
pub fn decode_event(name: &str, data: &str) -> Result<StreamEvent, DecodeError> {
    // Pings may arrive with an empty or arbitrary body; never parse it.
    if name == "ping" {
        return Ok(StreamEvent::Ping);
    }

    let value: Value = serde_json::from_str(data).map_err(|source| DecodeError::Json {
        event: name.to_string(),
        source,
    })?;

    match name {
        "account_created" => decode_account_created(&value),
        "account_deleted" => {
            let id = subject_id(&value, &["id", "pk", "account_id"])
                .ok_or(DecodeError::MissingField { event: "account_deleted", field: "id" })?;
            Ok(StreamEvent::AccountDeleted { id })
        }
        "batch_created" => decode_batch_created(&value),
        "batch_completed" => {
            let id = subject_id(&value, &["id", "pk", "batch_id"])
                .ok_or(DecodeError::MissingField { event: "batch_completed", field: "id" })?;
            Ok(StreamEvent::BatchCompleted { id })
        }
        "bet_status_updated" => decode_bet_status_updated(&value),
        _ => Err(DecodeError::UnknownEvent { name: name.to_string() }),
    }
}

/// Expected shapes:
///   {"id": 1, "name": "A", "hostname": "h", "created_at": "...", ...}
///   {"account_id": 1, "account_name": "A", "account_hostname": "h"}
///   {"pk": 1, "event": "account_created"}
fn decode_account_created(value: &Value) -> Result<StreamEvent, DecodeError> {
    let id = subject_id(value, &["id", "pk", "account_id"])
        .ok_or(DecodeError::MissingField { event: "account_created", field: "id" })?;

    Ok(StreamEvent::AccountCreated(Account {
        id,
        name: text_field(value, &["name", "account_name"]),
        hostname: text_field(value, &["hostname", "account_hostname"]),
        created_at: timestamp_field(value, "created_at"),
        updated_at: timestamp_field(value, "updated_at"),
    }))
}

/// Expected shapes:
///   {"id": 10, "account_id": 1, "completed": false, "meta": {...}, "bets": [...]}
///   {"batch_id": 10, "account_id": 1, "event": "batch_created"}
fn decode_batch_created(value: &Value) -> Result<StreamEvent, DecodeError> {
    let id = subject_id(value, &["id", "pk", "batch_id"])
        .ok_or(DecodeError::MissingField { event: "batch_created", field: "id" })?;
    let account_id = subject_id(value, &["account_id"])
        .ok_or(DecodeError::MissingField { event: "batch_created", field: "account_id" })?;

    let bets = match value.get("bets") {
        Some(raw) => serde_json::from_value::<Vec<Bet>>(raw.clone()).map_err(|_| {
            DecodeError::InvalidField {
                event: "batch_created",
                field: "bets",
                value: raw.to_string(),
            }
        })?,
        None => Vec::new(),
    };

    Ok(StreamEvent::BatchCreated(Batch {
        id,
        account_id,
        meta: value.get("meta").cloned().unwrap_or(Value::Null),
        completed: value.get("completed").and_then(Value::as_bool).unwrap_or(false),
        created_at: timestamp_field(value, "created_at"),
        updated_at: timestamp_field(value, "updated_at"),
        bets,
    }))
}

/// Expected shapes:
///   {"batch_id": 10, "pid": "p1", "status": "successful"}
///   {"batch_id": 10, "bet_id": 7, "status": "failed", "event": "..."}
///   or a full bet document with selection, stake, and cost alongside.
fn decode_bet_status_updated(value: &Value) -> Result<StreamEvent, DecodeError> {
    let pid = bet_identity(value)
        .ok_or(DecodeError::MissingField { event: "bet_status_updated", field: "pid" })?;
    let batch_id = subject_id(value, &["batch_id"])
        .ok_or(DecodeError::MissingField { event: "bet_status_updated", field: "batch_id" })?;
    let raw_status = value
        .get("status")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField { event: "bet_status_updated", field: "status" })?;
    let status =
        BetStatus::from_wire(raw_status).ok_or_else(|| DecodeError::InvalidField {
            event: "bet_status_updated",
            field: "status",
            value: raw_status.to_string(),
        })?;

    Ok(StreamEvent::BetStatusUpdated { batch_id, pid, status })
}

// ---------------------------------------------------------------------------
// Field extraction helpers
// ---------------------------------------------------------------------------

/// First integer found under any of the candidate keys.
fn subject_id(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_i64))
}

/// First string found under any of the candidate keys, else empty.
fn text_field(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// Bet identity under `pid` or `bet_id`, as string or bare integer. The
/// generic `id` key is never consulted here: on a full bet document it is
/// the display index, not the identity.
fn bet_identity(value: &Value) -> Option<String> {
    ["pid", "bet_id"].iter().find_map(|k| match value.get(*k) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// RFC 3339 timestamp under the given key, if present and well-formed.
fn timestamp_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}
