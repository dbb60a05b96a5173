use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{decode_binary, decode_text, encode, Encoding, Frame};

/// Text delivered with an acknowledgement when the dispatcher supplies none.
pub const DEFAULT_ACK_MESSAGE: &str = "Ambulance dispatched and on the way";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("booking id must not be empty")]
    EmptyBookingId,
    #[error("coordinates must be finite numbers (lat={lat}, lng={lng})")]
    NonFiniteLocation { lat: f64, lng: f64 },
    #[error("unknown encoding {0:?}")]
    UnknownEncoding(String),
    #[error("malformed json frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed msgpack frame: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode msgpack frame: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
}

/// Opaque key of a room. Issued by the booking service; the relay never
/// interprets it beyond requiring it to be non-blank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BookingId(String);

impl BookingId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ProtocolError::EmptyBookingId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BookingId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BookingId> for String {
    fn from(id: BookingId) -> Self {
        id.0
    }
}

impl FromStr for BookingId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single coordinate pair. Accepts `latitude`/`longitude` on input,
/// always written back as `lat`/`lng`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLocation")]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Deserialize)]
struct RawLocation {
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "longitude")]
    lng: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Result<Self, ProtocolError> {
        let location = Self { lat, lng };
        if !location.is_finite() {
            return Err(ProtocolError::NonFiniteLocation { lat, lng });
        }
        Ok(location)
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

impl TryFrom<RawLocation> for Location {
    type Error = ProtocolError;

    fn try_from(raw: RawLocation) -> Result<Self, Self::Error> {
        Self::new(raw.lat, raw.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Acknowledged,
}

/// Frames a peer sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PeerCommand {
    JoinBooking {
        booking_id: BookingId,
    },
    LeaveBooking {
        booking_id: BookingId,
    },
    SendLocation {
        booking_id: BookingId,
        location: Location,
    },
    SendAck {
        booking_id: BookingId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl PeerCommand {
    pub fn booking_id(&self) -> &BookingId {
        match self {
            Self::JoinBooking { booking_id }
            | Self::LeaveBooking { booking_id }
            | Self::SendLocation { booking_id, .. }
            | Self::SendAck { booking_id, .. } => booking_id,
        }
    }
}

/// Frames the relay pushes to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RelayEvent {
    ReceiveLocation {
        booking_id: BookingId,
        location: Location,
    },
    ReceiveAck {
        booking_id: BookingId,
        status: AckStatus,
        message: String,
    },
    /// Any kind this build does not know about. Clients skip it.
    #[serde(other)]
    Unknown,
}

impl RelayEvent {
    pub fn acknowledged(booking_id: BookingId, message: Option<String>) -> Self {
        Self::ReceiveAck {
            booking_id,
            status: AckStatus::Acknowledged,
            message: message.unwrap_or_else(|| DEFAULT_ACK_MESSAGE.to_string()),
        }
    }

    pub fn booking_id(&self) -> Option<&BookingId> {
        match self {
            Self::ReceiveLocation { booking_id, .. } | Self::ReceiveAck { booking_id, .. } => {
                Some(booking_id)
            }
            Self::Unknown => None,
        }
    }
}
