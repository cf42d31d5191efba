//! Data model shared by the probe subsystems.

mod event;
mod rules;
mod snapshot;

pub use event::*;
pub use rules::*;
pub use snapshot::*;

/// Serde helpers that base64-encode body bytes on the wire.
pub(crate) mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub mod required {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
            ser.serialize_str(&general_purpose::STANDARD.encode(bytes))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
            let text = String::deserialize(de)?;
            general_purpose::STANDARD
                .decode(text.as_bytes())
                .map_err(serde::de::Error::custom)
        }
    }

    pub mod optional {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => ser.serialize_some(&general_purpose::STANDARD.encode(b)),
                None => ser.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
            let text: Option<String> = Option::deserialize(de)?;
            match text {
                Some(t) => general_purpose::STANDARD
                    .decode(t.as_bytes())
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Carrier {
        #[serde(with = "super::b64::optional")]
        body: Option<Vec<u8>>,
    }

    #[test]
    fn body_bytes_round_trip_through_base64() {
        let carrier = Carrier {
            body: Some(vec![0u8, 1, 2, 254, 255]),
        };
        let json = serde_json::to_string(&carrier).expect("encode");
        assert!(json.contains("AAEC/v8="));
        let back: Carrier = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, carrier);
    }

    #[test]
    fn absent_body_stays_absent() {
        let back: Carrier = serde_json::from_str("{\"body\":null}").expect("decode");
        assert_eq!(back.body, None);
    }
}
