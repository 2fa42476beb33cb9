use serde::Serialize;

/// Change notifications published by the connection service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "connectionId", rename_all = "camelCase")]
pub enum ConnectionEvent {
    Added(String),
    Updated(String),
    Removed(String),
    Connected(String),
    Disconnected(String),
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            ConnectionEvent::Added(id)
            | ConnectionEvent::Updated(id)
            | ConnectionEvent::Removed(id)
            | ConnectionEvent::Connected(id)
            | ConnectionEvent::Disconnected(id) => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let value = serde_json::to_value(ConnectionEvent::Connected("c1".into())).unwrap();
        assert_eq!(value, serde_json::json!({"event": "connected", "connectionId": "c1"}));
    }
}
