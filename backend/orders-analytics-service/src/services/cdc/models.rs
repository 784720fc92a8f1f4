use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Debezium delete sentinel in the envelope's `op` field.
const DELETE_OP: &str = "d";

/// Cap on how much of a bad payload is echoed into errors and logs.
const RAW_EXCERPT_LEN: usize = 512;

/// A record payload that could not be turned into a [`ChangeEvent`].
///
/// Decode failures never terminate the run: the loop reports them and
/// commits past the record, so a permanently malformed message cannot stall
/// the partition.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid change event payload: {source}; raw: {raw}")]
    Json {
        #[source]
        source: serde_json::Error,
        raw: String,
    },
    #[error("change event `after` row has an invalid shape: {source}; raw: {raw}")]
    Row {
        #[source]
        source: serde_json::Error,
        raw: String,
    },
}

/// The decoded unit of work: the entity-level effect of one CDC record.
///
/// Create and Update are deliberately collapsed — both resolve to an upsert
/// of the full row, and nothing downstream needs the distinction.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Upsert(OrderRow),
    /// Delete keyed by the prior row snapshot's id.
    Delete { id: i64 },
    /// No `after` and not a delete; applied as a no-op.
    Unknown,
}

/// Row snapshot carried in a change event.
///
/// `id` is the sole identity; every other column is freely overwritable.
/// `total` stays a raw JSON value here — coercion is the applier's job —
/// and `created_at` is opaque to this service, passed through verbatim.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderRow {
    pub id: i64,
    pub customer_id: Option<i64>,
    pub customer_name: Option<String>,
    pub total: Option<Value>,
    pub status: Option<String>,
    pub created_at: Option<String>,
}

/// Debezium envelope, either bare or nested inside the Kafka Connect
/// transport wrapper (`value.converter.schemas.enable = true` puts the
/// envelope under `payload`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Wrapped { payload: ChangeRecord },
    Bare(ChangeRecord),
}

impl Envelope {
    fn into_record(self) -> ChangeRecord {
        match self {
            Envelope::Wrapped { payload } => payload,
            Envelope::Bare(record) => record,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangeRecord {
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
    #[serde(default)]
    op: Option<String>,
}

/// Decode one raw record payload into a [`ChangeEvent`].
///
/// A truthy `after` wins over everything else (insert or update — both
/// upsert). Otherwise `op == "d"` with a usable `before.id` is a delete,
/// and anything else is [`ChangeEvent::Unknown`]. No numeric coercion
/// happens here.
pub fn decode(raw: &[u8]) -> Result<ChangeEvent, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(raw).map_err(|source| DecodeError::Json {
        source,
        raw: raw_excerpt(raw),
    })?;
    let record = envelope.into_record();

    if let Some(after) = record.after.filter(is_present) {
        let row: OrderRow = serde_json::from_value(after).map_err(|source| DecodeError::Row {
            source,
            raw: raw_excerpt(raw),
        })?;
        return Ok(ChangeEvent::Upsert(row));
    }

    if record.op.as_deref() == Some(DELETE_OP) {
        if let Some(id) = record
            .before
            .as_ref()
            .and_then(|before| before.get("id"))
            .and_then(Value::as_i64)
        {
            return Ok(ChangeEvent::Delete { id });
        }
    }

    Ok(ChangeEvent::Unknown)
}

/// Truthiness of the `after` field: null and `{}` both mean "no row".
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(fields) => !fields.is_empty(),
        _ => true,
    }
}

fn raw_excerpt(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    if text.len() <= RAW_EXCERPT_LEN {
        text.into_owned()
    } else {
        let truncated: String = text.chars().take(RAW_EXCERPT_LEN).collect();
        format!("{truncated}...")
    }
}
