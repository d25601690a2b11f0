//! Signaling messages exchanged over the external control channel.

use crate::error::SignalingError;
use headlink_nat::Candidate;
use serde::{Deserialize, Serialize};

/// Offer/answer messages, tagged by their `type` field.
///
/// ```json
/// {"type":"OFFER","from_uid":"controller","candidates":[{"type":"host","address":"192.168.1.5","port":40000}]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMessage {
    /// Application request to connect to `to_uid`
    InitiateUdpConnection {
        /// Peer to connect to
        to_uid: String,
    },
    /// Initiator's candidates
    Offer {
        /// Initiator
        from_uid: String,
        /// Intended responder, when the carrier needs it for routing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_uid: Option<String>,
        /// Initiator's candidates
        candidates: Vec<Candidate>,
    },
    /// Responder's candidates, sent after it connected
    Answer {
        /// Responder
        from_uid: String,
        /// Initiator
        to_uid: String,
        /// Responder's candidates
        candidates: Vec<Candidate>,
    },
    /// Outcome of a handshake, reported by each side
    UdpConnectionResult {
        /// Reporting side
        uid: String,
        /// The other side
        peer_uid: String,
        /// Whether a connection was established
        success: bool,
        /// Human-readable detail
        #[serde(default)]
        message: String,
    },
}

const KNOWN_TYPES: [&str; 4] = [
    "INITIATE_UDP_CONNECTION",
    "OFFER",
    "ANSWER",
    "UDP_CONNECTION_RESULT",
];

impl SignalMessage {
    /// Parse one JSON message.
    ///
    /// Returns `Ok(None)` for message types this crate does not handle; the
    /// signaling channel usually carries other traffic as well.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Json` for malformed JSON or a known type with
    /// bad fields, `SignalingError::MissingType` if there is no `type`.
    pub fn parse(text: &str) -> Result<Option<Self>, SignalingError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let msg_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(SignalingError::MissingType)?;

        if !KNOWN_TYPES.contains(&msg_type) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Serialize to a JSON string
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Json` if serialization fails.
    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Message type as it appears on the wire
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::InitiateUdpConnection { .. } => KNOWN_TYPES[0],
            Self::Offer { .. } => KNOWN_TYPES[1],
            Self::Answer { .. } => KNOWN_TYPES[2],
            Self::UdpConnectionResult { .. } => KNOWN_TYPES[3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_offer() {
        let text = r#"{"type":"OFFER","from_uid":"controller","candidates":[
            {"type":"host","address":"192.168.1.5","port":40000},
            {"type":"srflx","address":"203.0.113.1","port":61000}]}"#;
        let msg = SignalMessage::parse(text).unwrap().unwrap();
        match msg {
            SignalMessage::Offer {
                from_uid,
                to_uid,
                candidates,
            } => {
                assert_eq!(from_uid, "controller");
                assert_eq!(to_uid, None);
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[0], Candidate::host(Ipv4Addr::new(192, 168, 1, 5), 40000));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_offer_serialization_shape() {
        let msg = SignalMessage::Offer {
            from_uid: "c".to_string(),
            to_uid: None,
            candidates: vec![Candidate::host(Ipv4Addr::LOCALHOST, 5)],
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "OFFER",
                "from_uid": "c",
                "candidates": [{"type": "host", "address": "127.0.0.1", "port": 5}]
            })
        );
    }

    #[test]
    fn test_type_tags() {
        let initiate = SignalMessage::InitiateUdpConnection {
            to_uid: "head".to_string(),
        };
        assert_eq!(
            initiate.to_json().unwrap(),
            r#"{"type":"INITIATE_UDP_CONNECTION","to_uid":"head"}"#
        );
        assert_eq!(initiate.type_name(), "INITIATE_UDP_CONNECTION");

        let result = SignalMessage::UdpConnectionResult {
            uid: "head".to_string(),
            peer_uid: "controller".to_string(),
            success: true,
            message: String::new(),
        };
        assert!(result.to_json().unwrap().contains(r#""type":"UDP_CONNECTION_RESULT""#));
    }

    #[test]
    fn test_parse_unrelated_type_is_ignored() {
        let parsed = SignalMessage::parse(r#"{"type":"LENS_STATUS","focus":12}"#).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            SignalMessage::parse("not json"),
            Err(SignalingError::Json(_))
        ));
        assert!(matches!(
            SignalMessage::parse(r#"{"to_uid":"x"}"#),
            Err(SignalingError::MissingType)
        ));
        assert!(matches!(
            SignalMessage::parse(r#"{"type":"ANSWER","from_uid":"x"}"#),
            Err(SignalingError::Json(_))
        ));
        assert!(matches!(
            SignalMessage::parse(
                r#"{"type":"OFFER","from_uid":"x","candidates":[{"type":"relay","address":"1.2.3.4","port":1}]}"#
            ),
            Err(SignalingError::Json(_))
        ));
    }

    #[test]
    fn test_result_message_defaults_to_empty() {
        let msg = SignalMessage::parse(
            r#"{"type":"UDP_CONNECTION_RESULT","uid":"a","peer_uid":"b","success":false}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            msg,
            SignalMessage::UdpConnectionResult {
                uid: "a".to_string(),
                peer_uid: "b".to_string(),
                success: false,
                message: String::new(),
            }
        );
    }
}
