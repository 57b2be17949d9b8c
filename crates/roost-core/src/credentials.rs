//! Credential record model.
//!
//! Each session owns one primary record (the identity blob the protocol
//! handshake needs) plus an open-ended set of keyed records the protocol
//! layer churns through at high rate (ratchet state, one-time keys, peer
//! sessions). The store treats the two classes differently, so the key type
//! distinguishes them explicitly.

use serde_json::Value;

/// Category name under which the primary record is stored.
pub const PRIMARY_CATEGORY: &str = "creds";

/// Addresses one record within a session's credential set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    /// The session's single primary credential record.
    Primary,
    /// A protocol-managed keyed record, e.g. `pre_key:25`.
    Keyed { category: String, id: String },
}

impl RecordKey {
    pub fn keyed(category: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Keyed {
            category: category.into(),
            id: id.into(),
        }
    }

    /// Storage column pair: `(category, key_id)`.
    pub fn parts(&self) -> (&str, &str) {
        match self {
            Self::Primary => (PRIMARY_CATEGORY, ""),
            Self::Keyed { category, id } => (category.as_str(), id.as_str()),
        }
    }

    /// Rebuilds a key from its storage columns.
    pub fn from_parts(category: &str, id: &str) -> Self {
        if category == PRIMARY_CATEGORY && id.is_empty() {
            Self::Primary
        } else {
            Self::keyed(category, id)
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary)
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "{PRIMARY_CATEGORY}"),
            Self::Keyed { category, id } => write!(f, "{category}:{id}"),
        }
    }
}

impl std::str::FromStr for RecordKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == PRIMARY_CATEGORY {
            return Ok(Self::Primary);
        }
        Ok(match s.split_once(':') {
            Some((category, id)) => Self::keyed(category, id),
            None => Self::keyed(s, ""),
        })
    }
}

/// The primary credential record for one session.
///
/// Unknown fields from the protocol layer are preserved verbatim in `extra`
/// so a round trip through the store never drops material.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_keys: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl CredentialRecord {
    /// A record is complete once the handshake-critical fields are present.
    /// Incomplete records are only acceptable mid-pairing.
    pub fn is_complete(&self) -> bool {
        self.identity_keys.is_some() && self.account.is_some() && self.registered.is_some()
    }
}

impl Default for CredentialRecord {
    fn default() -> Self {
        Self {
            identity_keys: None,
            account: None,
            registered: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Credential mutation reported by the protocol layer over the session's
/// event interface.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialEvent {
    Write { key: RecordKey, value: Value },
    Delete { key: RecordKey },
}

impl CredentialEvent {
    pub fn key(&self) -> &RecordKey {
        match self {
            Self::Write { key, .. } | Self::Delete { key } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primary_key_maps_to_reserved_parts() {
        assert_eq!(RecordKey::Primary.parts(), (PRIMARY_CATEGORY, ""));
        assert_eq!(RecordKey::from_parts(PRIMARY_CATEGORY, ""), RecordKey::Primary);
    }

    #[test]
    fn keyed_key_round_trips_through_parts() {
        let key = RecordKey::keyed("pre_key", "25");
        let (category, id) = key.parts();
        assert_eq!(RecordKey::from_parts(category, id), key);
    }

    #[test]
    fn key_display_and_parse_agree() {
        let keyed: RecordKey = "sender_key:group-9".parse().unwrap();
        assert_eq!(keyed, RecordKey::keyed("sender_key", "group-9"));
        assert_eq!(keyed.to_string(), "sender_key:group-9");

        let primary: RecordKey = "creds".parse().unwrap();
        assert!(primary.is_primary());
        assert_eq!(primary.to_string(), "creds");
    }

    #[test]
    fn record_completeness_requires_all_fields() {
        let mut record = CredentialRecord::default();
        assert!(!record.is_complete());

        record.identity_keys = Some(json!({"public": "pk"}));
        record.account = Some(json!({"id": "a1"}));
        assert!(!record.is_complete());

        record.registered = Some(true);
        assert!(record.is_complete());
    }

    #[test]
    fn record_preserves_unknown_fields() {
        let raw = json!({
            "identityKeys": {"public": "pk"},
            "account": {"id": "a1"},
            "registered": true,
            "advSecretKey": "opaque"
        });
        let record: CredentialRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.extra["advSecretKey"], "opaque");
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back, raw);
    }
}
