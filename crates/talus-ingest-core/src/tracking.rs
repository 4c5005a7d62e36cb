//! Correlation-identifier extraction from free-form payloads.
//!
//! Payloads are schema-less: the same field shows up at the top level or
//! under a nested `data` object, in camelCase or snake_case, as a string or
//! a number. Each target has an explicit ordered candidate list; the first
//! coercible hit wins. The function is total; any JSON value, including
//! non-objects, yields a (possibly all-empty) result.

use serde_json::Value;
use talus_events::TrackingFields;

#[derive(Debug, Clone, Copy)]
enum Location {
    Root,
    Data,
}

const LOCATIONS: [Location; 2] = [Location::Root, Location::Data];

fn coerce_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => {
            if n.as_f64().is_some_and(f64::is_finite) {
                Some(n.to_string())
            } else {
                None
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lookup(payload: &Value, keys: &[&str]) -> Option<String> {
    for location in LOCATIONS {
        let scope = match location {
            Location::Root => payload,
            Location::Data => payload.get("data")?,
        };
        if !scope.is_object() {
            continue;
        }
        for key in keys {
            if let Some(found) = scope.get(*key).and_then(coerce_scalar) {
                return Some(found);
            }
        }
    }
    None
}

pub fn extract_tracking_fields(payload: &Value) -> TrackingFields {
    if !payload.is_object() {
        return TrackingFields::default();
    }

    TrackingFields {
        device_sn: lookup(payload, &["deviceSn", "device_sn", "sn"]),
        device_mac: lookup(payload, &["deviceMac", "device_mac", "mac"]),
        link_code: lookup(payload, &["linkCode", "link_code"]),
        request_id: lookup(payload, &["requestId", "request_id"]),
        attempt_id: lookup(payload, &["attemptId", "attempt_id"]),
        error_code: lookup(payload, &["errorCode", "error_code"]),
        reason_code: lookup(payload, &["reasonCode", "reason_code", "reason"]),
        stage: lookup(payload, &["stage"]),
        op: lookup(payload, &["op"]),
        result: lookup(payload, &["result"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_object_payloads_yield_all_none() {
        for payload in [
            Value::Null,
            json!("just a string"),
            json!(42),
            json!(true),
            json!([{"linkCode": "lk-1"}]),
        ] {
            assert!(extract_tracking_fields(&payload).is_empty());
        }
    }

    #[test]
    fn deeply_nested_structures_do_not_panic() {
        let mut payload = json!({"x": 1});
        for _ in 0..64 {
            payload = json!({ "data": payload });
        }
        let fields = extract_tracking_fields(&payload);
        assert!(fields.is_empty());
    }

    #[test]
    fn top_level_wins_over_nested_data() {
        let payload = json!({
            "linkCode": "outer",
            "data": { "linkCode": "inner" }
        });
        let fields = extract_tracking_fields(&payload);
        assert_eq!(fields.link_code.as_deref(), Some("outer"));
    }

    #[test]
    fn nested_data_is_searched_when_top_level_misses() {
        let payload = json!({
            "data": {
                "requestId": "req-9",
                "errorCode": "E-CONN"
            }
        });
        let fields = extract_tracking_fields(&payload);
        assert_eq!(fields.request_id.as_deref(), Some("req-9"));
        assert_eq!(fields.error_code.as_deref(), Some("E-CONN"));
    }

    #[test]
    fn numbers_and_booleans_coerce_to_strings() {
        let payload = json!({
            "attemptId": 3,
            "result": true
        });
        let fields = extract_tracking_fields(&payload);
        assert_eq!(fields.attempt_id.as_deref(), Some("3"));
        assert_eq!(fields.result.as_deref(), Some("true"));
    }

    #[test]
    fn empty_strings_do_not_count_as_hits() {
        let payload = json!({
            "linkCode": "",
            "data": { "linkCode": "lk-2" }
        });
        let fields = extract_tracking_fields(&payload);
        assert_eq!(fields.link_code.as_deref(), Some("lk-2"));
    }

    #[test]
    fn snake_case_spellings_are_accepted() {
        let payload = json!({
            "device_sn": "SN123",
            "device_mac": "AA:BB:CC",
            "reason": "READY"
        });
        let fields = extract_tracking_fields(&payload);
        assert_eq!(fields.device_sn.as_deref(), Some("SN123"));
        assert_eq!(fields.device_mac.as_deref(), Some("AA:BB:CC"));
        assert_eq!(fields.reason_code.as_deref(), Some("READY"));
    }

    #[test]
    fn stage_op_result_triple_extracts() {
        let payload = json!({
            "stage": "ble",
            "op": "connect",
            "result": "start"
        });
        let fields = extract_tracking_fields(&payload);
        assert_eq!(fields.stage.as_deref(), Some("ble"));
        assert_eq!(fields.op.as_deref(), Some("connect"));
        assert_eq!(fields.result.as_deref(), Some("start"));
    }
}
