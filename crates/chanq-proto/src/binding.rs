//! Channel binding declarations.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A named binding between an entity type and its notification queue.
///
/// `lock_required` selects exactly-once processing: consumers take a lease
/// on each record and skip records leased by others. Unlocked channels
/// deliver at least once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelBinding {
    /// Channel name, unique within a deployment.
    pub name: String,
    /// Entity type whose mutations feed this channel.
    pub entity_type: String,
    /// Whether consumers must lease records before processing them.
    #[serde(default)]
    pub lock_required: bool,
}

impl ChannelBinding {
    /// Create an unlocked binding.
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            lock_required: false,
        }
    }

    /// Create a locked binding.
    pub fn locked(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            lock_required: true,
            ..Self::new(name, entity_type)
        }
    }
}

/// On-disk bindings document, read once at startup.
///
/// ```json
/// { "channels": [ { "name": "cve_record_channel", "entity_type": "CveRecord", "lock_required": true } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingsDocument {
    /// Declarations in order.
    pub channels: Vec<ChannelBinding>,
}

impl BindingsDocument {
    /// Parse a bindings document from JSON text.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::InvalidBindings(e.to_string()))
    }

    /// Render the document as pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document() {
        let doc = BindingsDocument::from_json(
            r#"{
                "channels": [
                    { "name": "nix_channel_channel", "entity_type": "NixChannel" },
                    { "name": "cve_record_channel", "entity_type": "CveRecord", "lock_required": true }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(doc.channels.len(), 2);
        assert_eq!(doc.channels[0], ChannelBinding::new("nix_channel_channel", "NixChannel"));
        assert_eq!(doc.channels[1], ChannelBinding::locked("cve_record_channel", "CveRecord"));
    }

    #[test]
    fn test_parse_rejects_missing_entity() {
        let err = BindingsDocument::from_json(r#"{ "channels": [ { "name": "x" } ] }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidBindings(_)));
    }
}
