//! Request catalog: each payload shape bound to its wire action and, for
//! round-trip requests, to the response shape and action it expects.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::protocol::{ActionTag, ConnectMessage, Empty, RawMessage};

/// Optional capabilities announced in `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    /// Peer serves the pull flow.
    Pull,
    /// Peer understands `expirationDateEnc` in `initTransfer`.
    ExpirationDate,
    #[serde(other)]
    Unknown,
}

/// Intersection of both sides' feature lists. `None` means no optional features.
pub fn negotiate_features(local: &[Feature], remote: Option<&[Feature]>) -> Vec<Feature> {
    let Some(remote) = remote else {
        return Vec::new();
    };
    let mut out: Vec<Feature> = local
        .iter()
        .copied()
        .filter(|f| *f != Feature::Unknown && remote.contains(f))
        .collect();
    out.sort();
    out.dedup();
    out
}

/// A payload sent under a fixed wire action.
pub trait ConnectRequest: Serialize + DeserializeOwned {
    const ACTION: ActionTag;

    fn into_message(self) -> ConnectMessage<Self> {
        ConnectMessage::new(Self::ACTION, self)
    }
}

/// Fire-and-forget requests; nothing is awaited after sending.
pub trait RequestWithoutResponse: ConnectRequest {}

/// Requests answered by exactly one response envelope.
pub trait RequestExpectedResponse: ConnectRequest {
    const RESPONSE_ACTION: ActionTag;
    type Response: Serialize + DeserializeOwned;

    /// The response must carry the statically expected action.
    fn validate_response(message: &RawMessage) -> Result<(), ResponseError> {
        if message.action != Self::RESPONSE_ACTION {
            return Err(ResponseError::WrongResponseAction {
                expected: Self::RESPONSE_ACTION,
                actual: message.action,
            });
        }
        Ok(())
    }

    /// Validate, then bind the response payload.
    fn decode_response(message: &RawMessage) -> Result<Self::Response, ResponseError> {
        Self::validate_response(message)?;
        message.payload_as().map_err(ResponseError::Payload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("wrong response action: expected {expected}, got {actual}")]
    WrongResponseAction {
        expected: ActionTag,
        actual: ActionTag,
    },
    #[error("malformed response payload: {0}")]
    Payload(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub device_id: String,
    pub device_name: String,
    pub device_os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_features: Option<Vec<Feature>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    pub browser_name: String,
    pub browser_version: String,
    pub browser_ext_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_features: Option<Vec<Feature>>,
}

impl ConnectRequest for HelloRequest {
    const ACTION: ActionTag = ActionTag::Hello;
}

impl RequestExpectedResponse for HelloRequest {
    const RESPONSE_ACTION: ActionTag = ActionTag::Hello;
    type Response = HelloResponse;
}

/// Ephemeral public key and HKDF salt, both base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub pk_epke: String,
    pub hkdf_salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub hkdf_salt_enc: String,
}

impl ConnectRequest for ChallengeRequest {
    const ACTION: ActionTag = ActionTag::Challenge;
}

impl RequestExpectedResponse for ChallengeRequest {
    const RESPONSE_ACTION: ActionTag = ActionTag::Challenge;
    type Response = ChallengeResponse;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitTransferRequest {
    pub total_chunks: u32,
    pub total_size: u64,
    pub sha256_gzip_vault_data_enc: String,
    pub fcm_token_enc: String,
    pub new_session_id_enc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date_enc: Option<String>,
}

impl ConnectRequest for InitTransferRequest {
    const ACTION: ActionTag = ActionTag::InitTransfer;
}

impl RequestExpectedResponse for InitTransferRequest {
    const RESPONSE_ACTION: ActionTag = ActionTag::InitTransferConfirmed;
    type Response = Empty;
}

/// Shared shape of `transferChunk` payloads; `chunk_data` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub chunk_index: u32,
    pub chunk_size: u32,
    pub chunk_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkConfirmed {
    pub chunk_index: u32,
}

/// Any chunk but the last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferChunk(pub ChunkPayload);

/// The final chunk. Same wire action as [`TransferChunk`], different response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferLastChunk(pub ChunkPayload);

impl ConnectRequest for TransferChunk {
    const ACTION: ActionTag = ActionTag::TransferChunk;
}

impl RequestExpectedResponse for TransferChunk {
    const RESPONSE_ACTION: ActionTag = ActionTag::TransferChunkConfirmed;
    type Response = ChunkConfirmed;
}

impl ConnectRequest for TransferLastChunk {
    const ACTION: ActionTag = ActionTag::TransferChunk;
}

impl RequestExpectedResponse for TransferLastChunk {
    const RESPONSE_ACTION: ActionTag = ActionTag::TransferCompleted;
    type Response = Empty;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub new_session_id_enc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestResponse {
    pub data_enc: String,
}

impl ConnectRequest for PullRequest {
    const ACTION: ActionTag = ActionTag::PullRequest;
}

impl RequestExpectedResponse for PullRequest {
    const RESPONSE_ACTION: ActionTag = ActionTag::PullRequest;
    type Response = PullRequestResponse;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestAction {
    pub data_enc: String,
}

impl ConnectRequest for PullRequestAction {
    const ACTION: ActionTag = ActionTag::PullRequestAction;
}

impl RequestExpectedResponse for PullRequestAction {
    const RESPONSE_ACTION: ActionTag = ActionTag::PullRequestCompleted;
    type Response = Empty;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseWithSuccess(Empty);

impl CloseWithSuccess {
    pub fn new() -> Self {
        Self(Empty)
    }
}

impl ConnectRequest for CloseWithSuccess {
    const ACTION: ActionTag = ActionTag::CloseWithSuccess;
}

impl RequestWithoutResponse for CloseWithSuccess {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseWithError {
    pub error_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ConnectRequest for CloseWithError {
    const ACTION: ActionTag = ActionTag::CloseWithError;
}

impl RequestWithoutResponse for CloseWithError {}

/// A request as seen by the answering side. `transferChunk` is not split here:
/// whether a chunk is the last one follows from its index, not its action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRequest {
    Hello(HelloRequest),
    Challenge(ChallengeRequest),
    InitTransfer(InitTransferRequest),
    TransferChunk(ChunkPayload),
    PullRequest(PullRequest),
    PullRequestAction(PullRequestAction),
    CloseWithSuccess,
    CloseWithError(CloseWithError),
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{0} is a response-only action")]
    NotARequest(ActionTag),
    #[error("malformed {action} payload: {source}")]
    Payload {
        action: ActionTag,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundRequest {
    pub fn from_message(message: &RawMessage) -> Result<Self, RequestError> {
        let payload_err = |source| RequestError::Payload {
            action: message.action,
            source,
        };
        let request = match message.action {
            ActionTag::Hello => Self::Hello(message.payload_as().map_err(payload_err)?),
            ActionTag::Challenge => Self::Challenge(message.payload_as().map_err(payload_err)?),
            ActionTag::InitTransfer => {
                Self::InitTransfer(message.payload_as().map_err(payload_err)?)
            }
            ActionTag::TransferChunk => {
                Self::TransferChunk(message.payload_as().map_err(payload_err)?)
            }
            ActionTag::PullRequest => Self::PullRequest(message.payload_as().map_err(payload_err)?),
            ActionTag::PullRequestAction => {
                Self::PullRequestAction(message.payload_as().map_err(payload_err)?)
            }
            ActionTag::CloseWithSuccess => Self::CloseWithSuccess,
            ActionTag::CloseWithError => {
                Self::CloseWithError(message.payload_as().map_err(payload_err)?)
            }
            action @ (ActionTag::InitTransferConfirmed
            | ActionTag::TransferChunkConfirmed
            | ActionTag::TransferCompleted
            | ActionTag::PullRequestCompleted) => return Err(RequestError::NotARequest(action)),
        };
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn raw(action: ActionTag, payload: serde_json::Value) -> RawMessage {
        ConnectMessage::reply(Uuid::new_v4(), action, payload)
    }

    #[test]
    fn hello_wire_shape() {
        let hello = HelloRequest {
            device_id: "A".into(),
            device_name: "Pixel".into(),
            device_os: "android".into(),
            supported_features: Some(vec![Feature::Pull]),
        };
        let msg = hello.into_message();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["action"], "hello");
        assert_eq!(json["payload"]["deviceId"], "A");
        assert_eq!(json["payload"]["supportedFeatures"][0], "pull");
    }

    #[test]
    fn last_chunk_shares_wire_action() {
        let payload = ChunkPayload {
            chunk_index: 2,
            chunk_size: 3,
            chunk_data: "AAAA".into(),
        };
        let middle = TransferChunk(payload.clone()).into_message();
        let last = TransferLastChunk(payload).into_message();
        assert_eq!(middle.action, last.action);
        assert_eq!(
            serde_json::to_value(&middle.payload).unwrap(),
            serde_json::to_value(&last.payload).unwrap()
        );
        assert_ne!(
            TransferChunk::RESPONSE_ACTION,
            TransferLastChunk::RESPONSE_ACTION
        );
    }

    #[test]
    fn wrong_response_action_is_rejected() {
        let resp = raw(
            ActionTag::TransferCompleted,
            serde_json::json!({ "chunkIndex": 0 }),
        );
        assert!(matches!(
            TransferChunk::decode_response(&resp),
            Err(ResponseError::WrongResponseAction {
                expected: ActionTag::TransferChunkConfirmed,
                actual: ActionTag::TransferCompleted,
            })
        ));
    }

    #[test]
    fn matching_response_decodes() {
        let resp = raw(
            ActionTag::Hello,
            serde_json::json!({
                "browserName": "X",
                "browserVersion": "1",
                "browserExtName": "ext"
            }),
        );
        let hello = HelloRequest::decode_response(&resp).unwrap();
        assert_eq!(hello.browser_name, "X");
        assert_eq!(hello.supported_features, None);
    }

    #[test]
    fn malformed_response_payload() {
        let resp = raw(ActionTag::Challenge, serde_json::json!({ "nope": 1 }));
        assert!(matches!(
            ChallengeRequest::decode_response(&resp),
            Err(ResponseError::Payload(_))
        ));
    }

    #[test]
    fn unknown_feature_is_tolerated() {
        let features: Vec<Feature> =
            serde_json::from_value(serde_json::json!(["pull", "holograms"])).unwrap();
        assert_eq!(features, vec![Feature::Pull, Feature::Unknown]);
    }

    #[test]
    fn negotiation_is_intersection() {
        let local = [Feature::Pull, Feature::ExpirationDate];
        assert_eq!(
            negotiate_features(&local, Some(&[Feature::ExpirationDate, Feature::Unknown])),
            vec![Feature::ExpirationDate]
        );
        assert!(negotiate_features(&local, None).is_empty());
    }

    #[test]
    fn response_only_actions_are_not_requests() {
        let msg = raw(ActionTag::TransferChunkConfirmed, serde_json::json!({}));
        assert!(matches!(
            InboundRequest::from_message(&msg),
            Err(RequestError::NotARequest(ActionTag::TransferChunkConfirmed))
        ));
    }

    #[test]
    fn close_with_error_parses() {
        let msg = raw(
            ActionTag::CloseWithError,
            serde_json::json!({ "errorCode": 1001 }),
        );
        match InboundRequest::from_message(&msg).unwrap() {
            InboundRequest::CloseWithError(c) => {
                assert_eq!(c.error_code, 1001);
                assert!(c.error_message.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
