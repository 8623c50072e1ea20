//! Timestamp resolution
//!
//! Content and child records arrive with timestamps in several shapes depending on
//! which path wrote them: a native date, epoch seconds, epoch milliseconds, fractional
//! epoch seconds, or the document store's tagged `{seconds, nanoseconds}` object.
//! Everything is normalized to `DateTime<Utc>` so sort keys are directly comparable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Epoch values above this are treated as milliseconds (year 5138 in seconds).
const MILLIS_CUTOFF: i64 = 100_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum RawTimestamp {
    Native(DateTime<Utc>),
    EpochSeconds(i64),
    EpochMillis(i64),
    /// Seconds with a sub-second fraction, e.g. `1700000000.25`
    EpochFractional(f64),
    /// Store-specific tagged object
    Tagged { seconds: i64, nanoseconds: u32 },
}

impl RawTimestamp {
    pub fn resolve(&self) -> Option<DateTime<Utc>> {
        match *self {
            RawTimestamp::Native(dt) => Some(dt),
            RawTimestamp::EpochSeconds(secs) => DateTime::from_timestamp(secs, 0),
            RawTimestamp::EpochMillis(ms) => DateTime::from_timestamp_millis(ms),
            RawTimestamp::EpochFractional(secs) => {
                if !secs.is_finite() {
                    return None;
                }
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1_000_000_000.0).round() as u32;
                DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
            }
            RawTimestamp::Tagged {
                seconds,
                nanoseconds,
            } => DateTime::from_timestamp(seconds, nanoseconds),
        }
    }

    /// Unparseable values resolve to the epoch and sort last.
    pub fn resolve_or_epoch(&self) -> DateTime<Utc> {
        self.resolve().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        RawTimestamp::Native(dt)
    }
}

impl TryFrom<Value> for RawTimestamp {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        parse_value(&value).ok_or_else(|| format!("unrecognized timestamp: {}", value))
    }
}

impl From<RawTimestamp> for Value {
    fn from(ts: RawTimestamp) -> Self {
        match ts {
            RawTimestamp::Native(dt) => Value::String(dt.to_rfc3339()),
            RawTimestamp::EpochSeconds(secs) => Value::from(secs),
            RawTimestamp::EpochMillis(ms) => Value::from(ms),
            RawTimestamp::EpochFractional(secs) => Value::from(secs),
            RawTimestamp::Tagged {
                seconds,
                nanoseconds,
            } => serde_json::json!({ "seconds": seconds, "nanoseconds": nanoseconds }),
        }
    }
}

fn parse_value(value: &Value) -> Option<RawTimestamp> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| RawTimestamp::Native(dt.with_timezone(&Utc))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i.abs() >= MILLIS_CUTOFF {
                    Some(RawTimestamp::EpochMillis(i))
                } else {
                    Some(RawTimestamp::EpochSeconds(i))
                }
            } else {
                n.as_f64().map(RawTimestamp::EpochFractional)
            }
        }
        Value::Object(map) => {
            // Both the wire form ({seconds, nanoseconds}) and the admin SDK
            // form ({_seconds, _nanoseconds}) show up in stored documents
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanoseconds = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Some(RawTimestamp::Tagged {
                seconds,
                nanoseconds: u32::try_from(nanoseconds).ok()?,
            })
        }
        _ => None,
    }
}

/// Resolve an arbitrary JSON value to an instant, if it looks like a timestamp.
pub fn resolve_value(value: &Value) -> Option<DateTime<Utc>> {
    parse_value(value)?.resolve()
}

/// Latest of the given instants; `None` entries are ignored.
pub fn latest<I>(instants: I) -> Option<DateTime<Utc>>
where
    I: IntoIterator<Item = Option<DateTime<Utc>>>,
{
    instants.into_iter().flatten().max()
}
