//! Resume tokens: opaque handles that let a session's table identities be
//! reattached after a reconnect.
//!
//! Tokens never travel on the wire during normal operation; they are
//! exchanged out of band. Only same-process restoration is provided here;
//! cross-process restoration needs an external store keyed by session ID.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use capnweb::RpcError;
use serde_json::Value as JsonValue;

use crate::session::SessionSnapshot;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// An opaque session-reattachment handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeToken {
    pub session_id: String,
    /// Import-to-export identity map, letting the holder re-derive its
    /// capability references.
    pub capabilities: HashMap<i64, i64>,
    /// Unix timestamp, seconds.
    pub created_at: f64,
    /// Unix timestamp, seconds.
    pub expires_at: f64,
    pub metadata: Option<JsonValue>,
}

impl ResumeToken {
    pub fn to_json(&self) -> String {
        let mut obj = serde_json::Map::new();
        obj.insert("session_id".into(), JsonValue::String(self.session_id.clone()));
        obj.insert(
            "capabilities".into(),
            JsonValue::Object(
                self.capabilities
                    .iter()
                    .map(|(k, v)| (k.to_string(), JsonValue::from(*v)))
                    .collect(),
            ),
        );
        obj.insert("created_at".into(), JsonValue::from(self.created_at));
        obj.insert("expires_at".into(), JsonValue::from(self.expires_at));
        if let Some(metadata) = &self.metadata {
            obj.insert("metadata".into(), metadata.clone());
        }
        JsonValue::Object(obj).to_string()
    }

    pub fn from_json(data: &str) -> Result<Self, RpcError> {
        let value: JsonValue = serde_json::from_str(data)
            .map_err(|e| RpcError::bad_request(format!("invalid resume token: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| RpcError::bad_request("invalid resume token: not an object"))?;
        let session_id = obj
            .get("session_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::bad_request("invalid resume token: missing session_id"))?
            .to_owned();
        let mut capabilities = HashMap::new();
        if let Some(caps) = obj.get("capabilities").and_then(|v| v.as_object()) {
            for (k, v) in caps {
                let import_id: i64 = k
                    .parse()
                    .map_err(|_| RpcError::bad_request("invalid resume token: bad import id"))?;
                let export_id = v.as_i64().ok_or_else(|| {
                    RpcError::bad_request("invalid resume token: bad export id")
                })?;
                capabilities.insert(import_id, export_id);
            }
        }
        let created_at = obj
            .get("created_at")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| RpcError::bad_request("invalid resume token: missing created_at"))?;
        let expires_at = obj
            .get("expires_at")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| RpcError::bad_request("invalid resume token: missing expires_at"))?;
        Ok(Self {
            session_id,
            capabilities,
            created_at,
            expires_at,
            metadata: obj.get("metadata").cloned(),
        })
    }

    pub fn is_expired(&self) -> bool {
        now_secs() > self.expires_at
    }

    /// Structurally well-formed and not expired. Whether the session still
    /// exists is the manager's call.
    pub fn is_valid(&self) -> bool {
        !self.is_expired() && !self.session_id.is_empty() && self.created_at <= self.expires_at
    }
}

struct StoredSession {
    snapshot: SessionSnapshot,
    expires_at: f64,
}

/// Holds session snapshots keyed by token session ID, with TTL-based
/// expiry.
pub struct ResumeTokenManager {
    default_ttl: Duration,
    sessions: HashMap<String, StoredSession>,
}

impl ResumeTokenManager {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            sessions: HashMap::new(),
        }
    }

    /// Snapshots the given table identities under a fresh random session ID
    /// and hands back the matching token.
    pub fn create_token(
        &mut self,
        snapshot: SessionSnapshot,
        ttl: Option<Duration>,
        metadata: Option<JsonValue>,
    ) -> ResumeToken {
        // Two v4 UUIDs' worth of randomness for the session identifier.
        let session_id = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let created_at = now_secs();
        let expires_at = created_at + ttl.unwrap_or(self.default_ttl).as_secs_f64();
        let capabilities = snapshot
            .import_ids()
            .iter()
            .map(|id| (*id, *id))
            .collect();
        self.sessions.insert(
            session_id.clone(),
            StoredSession {
                snapshot,
                expires_at,
            },
        );
        ResumeToken {
            session_id,
            capabilities,
            created_at,
            expires_at,
            metadata,
        }
    }

    /// True when the token is well-formed, unexpired, and names a session
    /// this manager still holds.
    pub fn validate_token(&mut self, token: &ResumeToken) -> bool {
        if !token.is_valid() {
            return false;
        }
        match self.sessions.get(&token.session_id) {
            Some(stored) if now_secs() > stored.expires_at => {
                self.sessions.remove(&token.session_id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Hands back a copy of the stored snapshot, leaving the stored state
    /// in place so the token stays usable until invalidated or expired.
    pub fn restore_session(&mut self, token: &ResumeToken) -> Option<SessionSnapshot> {
        if !self.validate_token(token) {
            return None;
        }
        self.sessions
            .get(&token.session_id)
            .map(|stored| stored.snapshot.duplicate())
    }

    pub fn invalidate(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Drops every expired session; returns how many were removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = now_secs();
        let before = self.sessions.len();
        self.sessions.retain(|_, stored| stored.expires_at >= now);
        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_json_round_trips() {
        let token = ResumeToken {
            session_id: "abc123".into(),
            capabilities: HashMap::from([(1, 1), (7, 7)]),
            created_at: 1000.0,
            expires_at: 2000.0,
            metadata: Some(serde_json::json!({"user": "alice"})),
        };
        let parsed = ResumeToken::from_json(&token.to_json()).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(ResumeToken::from_json("not json").is_err());
        assert!(ResumeToken::from_json("{}").is_err());
        assert!(ResumeToken::from_json("{\"session_id\": \"x\"}").is_err());
    }

    #[test]
    fn expired_token_is_invalid() {
        let token = ResumeToken {
            session_id: "abc".into(),
            capabilities: HashMap::new(),
            created_at: 0.0,
            expires_at: 1.0,
            metadata: None,
        };
        assert!(token.is_expired());
        assert!(!token.is_valid());
    }
}
