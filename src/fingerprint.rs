use serde_json::Value;

/// Keys that are part of the wire request but excluded from a request's
/// fingerprint (spec §3).
const TRANSIENT_KEYS: [&str; 3] = ["req_id", "passthrough", "subscribe"];

/// Canonical identity of a request, ignoring transient fields.
///
/// `serde_json`'s default `Map` is a `BTreeMap` (the `preserve_order`
/// feature is not enabled here), so `serde_json::to_string` on a `Value`
/// already serialises object keys in sorted order at every nesting level.
/// That gives us the "sorted-key JSON encoding" stability spec §9 asks for
/// without any extra canonicalisation pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of `request`, a JSON object.
    pub fn of(request: &Value) -> Fingerprint {
        let mut cloned = request.clone();
        if let Value::Object(map) = &mut cloned {
            for key in TRANSIENT_KEYS {
                map.remove(key);
            }
        }
        // `to_string` on a `Value` backed by `BTreeMap` never fails.
        Fingerprint(serde_json::to_string(&cloned).expect("json values always serialize"))
    }
}
