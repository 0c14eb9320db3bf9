//! Small helpers shared by the adapters.

use raffel_core::Metadata;
use serde_json::Value;

/// Fold a query string into a JSON object payload.
///
/// Values that parse as integers, floats or booleans are coerced so
/// `?count=3` reaches the handler as `{"count": 3}`; everything else stays
/// a string. Repeated keys keep the last value.
pub(crate) fn query_to_payload(query: &str) -> Value {
    let mut object = serde_json::Map::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        object.insert(key.into_owned(), coerce(&value));
    }
    Value::Object(object)
}

fn coerce(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_owned()),
    }
}

/// Copy credential-bearing query parameters into request metadata, for
/// transports that cannot carry headers on the streaming path.
pub(crate) fn fold_query_credentials(query: &str, metadata: &mut Metadata) {
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if matches!(&*key, "access_token" | "api_key") {
            metadata.insert(key.into_owned(), value.into_owned());
        }
    }
}

/// `/users/create` and `/users.create` both address `users.create`.
pub(crate) fn procedure_from_path(path: &str) -> String {
    path.trim_matches('/').replace('/', ".")
}
