use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::ProtocolError;

/// How a connection wants its outbound frames encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl FromStr for Encoding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "msgpack" => Ok(Self::MessagePack),
            other => Err(ProtocolError::UnknownEncoding(other.to_string())),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::MessagePack => f.write_str("msgpack"),
        }
    }
}

/// Transport-agnostic websocket payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

pub fn encode<T: Serialize>(value: &T, encoding: Encoding) -> Result<Frame, ProtocolError> {
    match encoding {
        Encoding::Json => Ok(Frame::Text(serde_json::to_string(value)?)),
        // Named maps keep the `kind` tag and field names readable by
        // decoders that never saw the struct layout.
        Encoding::MessagePack => Ok(Frame::Binary(rmp_serde::to_vec_named(value)?)),
    }
}

pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BookingId, Location, PeerCommand, RelayEvent};

    #[test]
    fn msgpack_frames_carry_the_kind_tag() {
        let cmd = PeerCommand::SendLocation {
            booking_id: BookingId::new("B123").unwrap(),
            location: Location::new(12.9716, 77.5946).unwrap(),
        };

        let Frame::Binary(bytes) = encode(&cmd, Encoding::MessagePack).unwrap() else {
            panic!("msgpack should produce a binary frame");
        };
        let decoded: PeerCommand = decode_binary(&bytes).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn msgpack_rejects_nan_coordinates() {
        #[derive(Serialize)]
        struct Loose {
            kind: &'static str,
            #[serde(rename = "bookingId")]
            booking_id: &'static str,
            location: LooseLocation,
        }
        #[derive(Serialize)]
        struct LooseLocation {
            lat: f64,
            lng: f64,
        }

        let bytes = rmp_serde::to_vec_named(&Loose {
            kind: "send_location",
            booking_id: "B1",
            location: LooseLocation { lat: f64::NAN, lng: 77.0 },
        })
        .unwrap();

        assert!(decode_binary::<PeerCommand>(&bytes).is_err());
    }

    #[test]
    fn json_is_the_default_encoding() {
        let event = RelayEvent::acknowledged(BookingId::new("B9").unwrap(), Some("go".into()));
        assert!(matches!(encode(&event, Encoding::default()).unwrap(), Frame::Text(_)));
    }

    #[test]
    fn parses_encoding_names() {
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("msgpack".parse::<Encoding>().unwrap(), Encoding::MessagePack);
        assert!("cbor".parse::<Encoding>().is_err());
    }
}
