use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{RepoError, RepoResult};

/// Keyset cursor over (timestamp_ms, event_id). `filter_sig` pins the cursor
/// to the filter it was issued for so a reused token cannot skew results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCursor {
    pub last_timestamp_ms: i64,
    pub last_event_id: String,
    pub filter_sig: String,
}

pub fn encode_cursor<T: Serialize>(cursor: &T) -> RepoResult<String> {
    let json = serde_json::to_vec(cursor)
        .map_err(|err| RepoError::internal(format!("failed to serialize cursor: {err}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_cursor<T: for<'de> Deserialize<'de>>(token: &str) -> RepoResult<T> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|err| RepoError::bad_cursor(format!("token is not base64: {err}")))?;
    serde_json::from_slice(&raw)
        .map_err(|err| RepoError::bad_cursor(format!("token payload does not decode: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = EventCursor {
            last_timestamp_ms: 1_700_000_000_123,
            last_event_id: "abc123".to_string(),
            filter_sig: "p1|0|0".to_string(),
        };

        let token = encode_cursor(&cursor).expect("encode");
        let back: EventCursor = decode_cursor(&token).expect("decode");
        assert_eq!(back.last_timestamp_ms, cursor.last_timestamp_ms);
        assert_eq!(back.last_event_id, cursor.last_event_id);
        assert_eq!(back.filter_sig, cursor.filter_sig);
    }

    #[test]
    fn garbage_token_is_rejected() {
        let err = decode_cursor::<EventCursor>("!!not-base64!!").expect_err("should fail");
        assert!(matches!(err, RepoError::BadCursor(_)));
    }
}
