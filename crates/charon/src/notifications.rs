//! Notification types supported over the Charon tunnel.
//!
//! A notification type defines what JSON data a server pushes and how a
//! full state maps onto its identifier, which is what dedup and the
//! wait-for-change comparison work on.  It deliberately says nothing about
//! how the server obtains updates from its backend; that is the update
//! waiter's concern.

use serde_json::Value;

/// Capability describing one notification type.
pub trait NotificationType: Send + Sync + 'static {
    /// The type string used on the wire and in API calls.
    fn type_name(&self) -> &str;

    /// Extracts the identifier of a full state.  Equal identifiers denote
    /// equivalent states for dedup purposes.  Must be a pure function of
    /// its input; returns None for states of the wrong shape.
    fn extract_state_id(&self, full_state: &Value) -> Option<Value>;

    /// The identifier value meaning "never matches any state", used by
    /// callers without a previously known state to block unconditionally.
    fn always_block_id(&self) -> Value;
}

/// State updates keyed by the current best block, matching a
/// `waitforchange` style long poll.  The state itself is its identifier
/// (typically a block-hash string).
pub struct StateChangeNotification;

impl NotificationType for StateChangeNotification {
    fn type_name(&self) -> &str {
        "state"
    }

    fn extract_state_id(&self, full_state: &Value) -> Option<Value> {
        full_state.is_string().then(|| full_state.clone())
    }

    fn always_block_id(&self) -> Value {
        Value::String(String::new())
    }
}

/// Pending-update notifications, matching a `waitforpendingchange` style
/// long poll.  The identifier is the integer `version` field of the state
/// object.
pub struct PendingChangeNotification;

impl NotificationType for PendingChangeNotification {
    fn type_name(&self) -> &str {
        "pending"
    }

    fn extract_state_id(&self, full_state: &Value) -> Option<Value> {
        full_state
            .as_object()
            .and_then(|o| o.get("version"))
            .and_then(Value::as_u64)
            .map(Value::from)
    }

    fn always_block_id(&self) -> Value {
        Value::from(0_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_id_is_the_value_itself() {
        let n = StateChangeNotification;
        assert_eq!(n.extract_state_id(&json!("block hash")), Some(json!("block hash")));
        assert_eq!(n.extract_state_id(&json!({"not": "a string"})), None);
        assert_eq!(n.always_block_id(), json!(""));
    }

    #[test]
    fn pending_id_is_the_version_field() {
        let n = PendingChangeNotification;
        assert_eq!(
            n.extract_state_id(&json!({"version": 42, "pending": []})),
            Some(json!(42))
        );
        assert_eq!(n.extract_state_id(&json!({"version": "nan"})), None);
        assert_eq!(n.extract_state_id(&json!("no object")), None);
        assert_eq!(n.always_block_id(), json!(0));
    }
}
