/// Utility functions and helpers
use bson::{Bson, Document};
use std::time::Duration;

/// Weight given to the newest sample in round trip time averages
pub const RTT_ALPHA: f64 = 0.2;

/// Exponentially weighted moving average of round trip times
pub fn ewma(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        None => sample,
        Some(previous) => {
            Duration::from_secs_f64(RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * previous.as_secs_f64())
        }
    }
}

/// Server-style truthiness for fields such as `ok` that arrive as any numeric type
pub fn is_truthy(value: Option<&Bson>) -> bool {
    match value {
        Some(Bson::Boolean(b)) => *b,
        Some(Bson::Int32(n)) => *n != 0,
        Some(Bson::Int64(n)) => *n != 0,
        Some(Bson::Double(n)) => *n != 0.0,
        Some(Bson::Null) | None => false,
        Some(_) => true,
    }
}

/// Read an integer field regardless of its numeric width
pub fn get_int(document: &Document, key: &str) -> Option<i64> {
    match document.get(key)? {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

/// Recursively remove `$` prefixes from keys.
///
/// `{"$gt": 1}` becomes `{"gt": 1}`. When both `$k` and `k` are present the
/// unprefixed entry wins.
pub fn sanitize(document: &Document) -> Document {
    let mut sanitized = Document::new();
    for (key, value) in document {
        match key.strip_prefix('$') {
            Some(stripped) => {
                if !document.contains_key(stripped) && !sanitized.contains_key(stripped) {
                    sanitized.insert(stripped, sanitize_value(value));
                }
            }
            None => {
                sanitized.insert(key.clone(), sanitize_value(value));
            }
        }
    }
    sanitized
}

fn sanitize_value(value: &Bson) -> Bson {
    match value {
        Bson::Document(document) => Bson::Document(sanitize(document)),
        Bson::Array(items) => Bson::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
