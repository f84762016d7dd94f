//! Lifecycle events
//!
//! Broadcast to any number of subscribers. Nobody listening is fine.

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use crate::config::EVENT_CHANNEL_CAPACITY;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PluginEvent {
    PluginLoaded { name: String, version: String },
    PluginUnloaded { name: String },
    PluginEnabled { name: String },
    PluginDisabled { name: String },
    PluginConfigChanged { name: String, config: JsonValue },
    PluginError { name: String, error: String },
}

impl PluginEvent {
    /// Wire name of the event, e.g. `plugin-loaded`
    pub fn kind(&self) -> &'static str {
        match self {
            PluginEvent::PluginLoaded { .. } => "plugin-loaded",
            PluginEvent::PluginUnloaded { .. } => "plugin-unloaded",
            PluginEvent::PluginEnabled { .. } => "plugin-enabled",
            PluginEvent::PluginDisabled { .. } => "plugin-disabled",
            PluginEvent::PluginConfigChanged { .. } => "plugin-config-changed",
            PluginEvent::PluginError { .. } => "plugin-error",
        }
    }

    pub fn plugin(&self) -> &str {
        match self {
            PluginEvent::PluginLoaded { name, .. }
            | PluginEvent::PluginUnloaded { name }
            | PluginEvent::PluginEnabled { name }
            | PluginEvent::PluginDisabled { name }
            | PluginEvent::PluginConfigChanged { name, .. }
            | PluginEvent::PluginError { name, .. } => name,
        }
    }
}

pub type EventSender = broadcast::Sender<PluginEvent>;

pub fn channel() -> EventSender {
    let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    sender
}

pub(crate) fn emit(sender: &EventSender, event: PluginEvent) {
    crate::log_debug!("event {} ({})", event.kind(), event.plugin());
    let _ = sender.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let sender = channel();
        emit(&sender, PluginEvent::PluginUnloaded { name: "x".into() });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let sender = channel();
        let mut rx = sender.subscribe();
        emit(&sender, PluginEvent::PluginEnabled { name: "x".into() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "plugin-enabled");
        assert_eq!(event.plugin(), "x");
    }

    #[test]
    fn test_serialized_tag_matches_kind() {
        let event = PluginEvent::PluginConfigChanged {
            name: "x".into(),
            config: serde_json::json!({ "a": 1 }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "plugin-config-changed");
        assert_eq!(json["name"], "x");
    }
}
