//! Connect wire protocol: message envelope, action tags and scheme version.

use std::fmt;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Current envelope scheme version. Inbound envelopes with a newer scheme are rejected.
pub const SCHEME_VERSION: u32 = 2;

/// Closed set of wire actions. Decoding an unknown value is a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionTag {
    Hello,
    Challenge,
    InitTransfer,
    InitTransferConfirmed,
    TransferChunk,
    TransferChunkConfirmed,
    TransferCompleted,
    PullRequest,
    PullRequestAction,
    PullRequestCompleted,
    CloseWithSuccess,
    CloseWithError,
}

impl ActionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTag::Hello => "hello",
            ActionTag::Challenge => "challenge",
            ActionTag::InitTransfer => "initTransfer",
            ActionTag::InitTransferConfirmed => "initTransferConfirmed",
            ActionTag::TransferChunk => "transferChunk",
            ActionTag::TransferChunkConfirmed => "transferChunkConfirmed",
            ActionTag::TransferCompleted => "transferCompleted",
            ActionTag::PullRequest => "pullRequest",
            ActionTag::PullRequestAction => "pullRequestAction",
            ActionTag::PullRequestCompleted => "pullRequestCompleted",
            ActionTag::CloseWithSuccess => "closeWithSuccess",
            ActionTag::CloseWithError => "closeWithError",
        }
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope exchanged between paired peers. A response reuses the `id` of the
/// request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectMessage<P> {
    pub id: Uuid,
    pub action: ActionTag,
    pub scheme_version: u32,
    pub payload: P,
}

/// Inbound envelope whose payload has not been bound to a catalog type yet.
pub type RawMessage = ConnectMessage<serde_json::Value>;

impl<P> ConnectMessage<P> {
    /// New envelope with a fresh id.
    pub fn new(action: ActionTag, payload: P) -> Self {
        Self::reply(Uuid::new_v4(), action, payload)
    }

    /// Envelope answering the request identified by `id`.
    pub fn reply(id: Uuid, action: ActionTag, payload: P) -> Self {
        Self {
            id,
            action,
            scheme_version: SCHEME_VERSION,
            payload,
        }
    }
}

impl RawMessage {
    /// Bind the payload to a concrete catalog shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Payload of actions without fields. Encodes as `{}`; decodes from anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Empty;

impl Serialize for Empty {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

impl<'de> Deserialize<'de> for Empty {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer)?;
        Ok(Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_camel_case_fields() {
        let msg = ConnectMessage::new(ActionTag::InitTransferConfirmed, Empty);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["action"], "initTransferConfirmed");
        assert_eq!(json["schemeVersion"], SCHEME_VERSION);
        assert_eq!(json["payload"], serde_json::json!({}));
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = ConnectMessage::new(ActionTag::Hello, Empty);
        let b = ConnectMessage::new(ActionTag::Hello, Empty);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn reply_keeps_request_id() {
        let req = ConnectMessage::new(ActionTag::Challenge, Empty);
        let resp = ConnectMessage::reply(req.id, ActionTag::Challenge, Empty);
        assert_eq!(req.id, resp.id);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "action": "teleport",
            "schemeVersion": 2,
            "payload": {}
        });
        assert!(serde_json::from_value::<RawMessage>(json).is_err());
    }

    #[test]
    fn empty_accepts_null_payload() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "action": "transferCompleted",
            "schemeVersion": 1,
            "payload": null
        });
        let raw: RawMessage = serde_json::from_value(json).unwrap();
        assert_eq!(raw.payload_as::<Empty>().unwrap(), Empty);
    }
}
