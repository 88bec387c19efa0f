//! Signal protocol messages
//!
//! Every application message is one JSON object with a `type` field.
//! Inbound objects are validated into [`InboundEvent`] at the boundary;
//! relay payloads keep their original fields so they can be forwarded
//! verbatim.

use serde::Serialize;
use serde_json::{Map, Value};

use beacon_core::{ProtocolError, MAX_ALIAS_LEN, MAX_MESSAGE_SIZE};

/// Messages the server sends to peers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// First message on every connection
    #[serde(rename_all = "camelCase")]
    Welcome {
        peer_id: String,
        peers: Vec<PeerSummary>,
    },

    /// Reply to Identify: every identified peer
    PeerList { peers: Vec<PeerSummary> },

    /// A peer attached an alias to itself
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String, alias: String },

    /// A peer connected (no alias yet)
    #[serde(rename_all = "camelCase")]
    NewPeer { peer_id: String },

    /// A peer disconnected or was evicted
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
}

impl ServerMessage {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One entry of a peer listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    pub alias: Option<String>,
}

/// Signaling payload kinds that are forwarded to a named peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayKind {
    Offer,
    Answer,
    IceCandidate,
    /// Generic envelope used by older clients
    Generic,
}

impl RelayKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "WEBRTC_OFFER" => Some(Self::Offer),
            "WEBRTC_ANSWER" => Some(Self::Answer),
            "ICE_CANDIDATE" => Some(Self::IceCandidate),
            "WEBRTC" => Some(Self::Generic),
            _ => None,
        }
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Offer => "WEBRTC_OFFER",
            Self::Answer => "WEBRTC_ANSWER",
            Self::IceCandidate => "ICE_CANDIDATE",
            Self::Generic => "WEBRTC",
        }
    }
}

/// Alias and optional relay address from an Identify event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identify {
    pub alias: String,
    pub relay_host: Option<String>,
    pub relay_port: Option<u16>,
}

/// A relay payload addressed to one peer
#[derive(Clone, Debug, PartialEq)]
pub struct RelayEnvelope {
    pub kind: RelayKind,
    pub to: String,
    body: Map<String, Value>,
}

impl RelayEnvelope {
    /// The original object with `from` set to the sender, serialized.
    /// Numbers keep their source text and keys keep their order.
    pub fn forwarded_json(mut self, from: &str) -> Result<String, serde_json::Error> {
        self.body.insert("from".into(), Value::String(from.into()));
        serde_json::to_string(&self.body)
    }
}

/// A validated inbound event
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    Heartbeat,
    Identify(Identify),
    Relay(RelayEnvelope),
    /// Well-formed object with a type this server does not handle
    Unknown(String),
}

impl InboundEvent {
    /// Parse and validate one inbound text message
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(body) = value else {
            return Err(ProtocolError::Malformed("expected a JSON object".into()));
        };

        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("type"))?
            .to_owned();

        if let Some(relay_kind) = RelayKind::from_tag(&kind) {
            let to = match body.get("to") {
                Some(Value::String(to)) => to.clone(),
                Some(_) => return Err(ProtocolError::invalid("to", "expected a string")),
                None => return Err(ProtocolError::MissingField("to")),
            };
            return Ok(Self::Relay(RelayEnvelope {
                kind: relay_kind,
                to,
                body,
            }));
        }

        match kind.as_str() {
            "HEARTBEAT" => Ok(Self::Heartbeat),
            "IDENTIFY" => parse_identify(&body).map(Self::Identify),
            _ => Ok(Self::Unknown(kind)),
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &str {
        match self {
            Self::Heartbeat => "HEARTBEAT",
            Self::Identify(_) => "IDENTIFY",
            Self::Relay(envelope) => envelope.kind.as_tag(),
            Self::Unknown(kind) => kind,
        }
    }
}

fn parse_identify(body: &Map<String, Value>) -> Result<Identify, ProtocolError> {
    let alias = match body.get("alias") {
        Some(Value::String(alias)) => alias.trim(),
        Some(Value::Null) | None => return Err(ProtocolError::MissingField("alias")),
        Some(_) => return Err(ProtocolError::invalid("alias", "expected a string")),
    };
    if alias.is_empty() {
        return Err(ProtocolError::invalid("alias", "empty"));
    }
    if alias.chars().count() > MAX_ALIAS_LEN {
        return Err(ProtocolError::invalid(
            "alias",
            format!("longer than {} characters", MAX_ALIAS_LEN),
        ));
    }

    // The relay address is optional; values that cannot be used are ignored
    let relay_host = body
        .get("relayHost")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_owned);
    let relay_port = body.get("relayPort").and_then(port_value);

    Ok(Identify {
        alias: alias.to_owned(),
        relay_host,
        relay_port,
    })
}

/// A usable port from a number or a numeric string
fn port_value(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    port.filter(|p| *p != 0)
}
