use serde_json::Value;

/// Recognised streaming message types, closed set, ordered by first
/// registration (spec.md §4.6). A request's `msg_type` is the first of
/// these keys present at its top level.
pub const STREAM_TYPES: [&str; 12] = [
    "balance",
    "candles",
    "p2p_advertiser",
    "p2p_order",
    "proposal",
    "proposal_array",
    "proposal_open_contract",
    "ticks",
    "ticks_history",
    "transaction",
    "website_status",
    "buy",
];

/// The `msg_type` of `request`, if it is subscribable: the first key (in
/// `STREAM_TYPES` order) present at the request's top level.
pub fn msg_type(request: &Value) -> Option<&'static str> {
    let object = request.as_object()?;
    STREAM_TYPES.iter().copied().find(|key| object.contains_key(*key))
}

/// `true` iff `request.proposal_open_contract` is present and
/// `request.contract_id` is absent — the "parent" stream that survives
/// per-contract child errors (spec.md §4.5 step 5, GLOSSARY).
pub fn is_parent_poc_subscription(request: &Value) -> bool {
    request.get("proposal_open_contract").is_some() && request.get("contract_id").is_none()
}

/// `buyKeyToContract` entry: which fingerprint's open `buy` stream a
/// `contract_id` is aliased to.
#[derive(Debug, Clone)]
pub struct BuyContract {
    pub contract_id: Value,
    pub buy_key: crate::fingerprint::Fingerprint,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn picks_first_recognised_key_in_order() {
        // `buy` precedes nothing else here; `ticks` should win over `buy`
        // if both present, since it comes first in STREAM_TYPES.
        let req = json!({"buy": 1, "ticks": "R_50"});
        assert_eq!(msg_type(&req), Some("ticks"));
    }

    #[test]
    fn unsubscribable_request_has_no_msg_type() {
        let req = json!({"ping": 1});
        assert_eq!(msg_type(&req), None);
    }

    #[test]
    fn parent_poc_lacks_contract_id() {
        assert!(is_parent_poc_subscription(&json!({"proposal_open_contract": 1})));
        assert!(!is_parent_poc_subscription(&json!({"proposal_open_contract": 1, "contract_id": 42})));
        assert!(!is_parent_poc_subscription(&json!({"ticks": "R_50"})));
    }
}
