use anyhow::anyhow;
use bytes::Bytes;

use crate::util::bencode::{decode_dict, encode_dict, Dict, Value};

/// The rid of a request that does not want a reply
pub const NO_REPLY_RID: i64 = -1;

/// Marks a reply as an error / empty reply, distinct from a successful payload
pub const ERROR_REPLY_KEY: &str = "rs";

const ENVELOPE_KEYS: [&str; 5] = ["rid", "t", "rt", "c", "v"];

/// A decoded fetch message, either a request or a reply. A request carries the request type
///  it should be dispatched on in `request_type`, a reply has an empty `request_type`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub rid: i64,
    /// the sub type of a request (`t`), free for the application to use
    pub kind: String,
    pub request_type: String,
    /// name of the peer set a request was sent to, empty for unicast
    pub peer_set: String,
    pub version: i64,
    /// everything that is not part of the envelope
    pub fields: Dict,
}

impl Envelope {
    pub fn is_request(&self) -> bool {
        !self.request_type.is_empty()
    }

    pub fn is_error_reply(&self) -> bool {
        self.fields.contains_key(ERROR_REPLY_KEY)
    }

    /// The message as the sender's application built it, i.e. the payload fields together with
    ///  `t` and `v`.
    pub fn message(&self) -> Dict {
        let mut result = self.fields.clone();
        result.insert("t".to_string(), Value::from(self.kind.as_str()));
        result.insert("v".to_string(), Value::from(self.version));
        result
    }

    /// Serializes a message. `t` and `v` default to `""` and `0` if the message does not have
    ///  them, `c` is expected to be set by the caller.
    pub fn encode(mut message: Dict, rid: i64, request_type: &str) -> Bytes {
        message.entry("v".to_string())
            .or_insert(Value::Int(0));
        message.entry("t".to_string())
            .or_insert_with(|| Value::from(""));
        message.insert("rid".to_string(), Value::Int(rid));
        message.insert("rt".to_string(), Value::from(request_type));
        encode_dict(&message)
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Envelope> {
        let mut fields = decode_dict(buf)?;

        let rid = int_field(&fields, "rid")?;
        let kind = str_field(&fields, "t")?;
        let request_type = str_field(&fields, "rt")?;
        let peer_set = str_field(&fields, "c")?;
        let version = match fields.get("v") {
            None => 0,
            Some(_) => int_field(&fields, "v")?,
        };

        for key in ENVELOPE_KEYS {
            fields.remove(key);
        }

        Ok(Envelope {
            rid,
            kind,
            request_type,
            peer_set,
            version,
            fields,
        })
    }
}

fn int_field(d: &Dict, key: &str) -> anyhow::Result<i64> {
    d.get(key)
        .and_then(|v| v.as_int())
        .ok_or_else(|| anyhow!("envelope field {} missing or not an integer", key))
}

fn str_field(d: &Dict, key: &str) -> anyhow::Result<String> {
    d.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("envelope field {} missing or not a string", key))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::dict;
    use crate::util::bencode::encode_dict;

    use super::*;

    #[test]
    fn test_encode_request() {
        let encoded = Envelope::encode(dict!("c" => "", "x" => 5), 3, "ping");
        assert_eq!(&encoded[..], b"d1:c0:3:ridi3e2:rt4:ping1:t0:1:vi0e1:xi5ee");

        let envelope = Envelope::decode(&encoded).unwrap();
        assert_eq!(envelope, Envelope {
            rid: 3,
            kind: "".to_string(),
            request_type: "ping".to_string(),
            peer_set: "".to_string(),
            version: 0,
            fields: dict!("x" => 5),
        });
        assert!(envelope.is_request());
        assert!(!envelope.is_error_reply());
    }

    #[test]
    fn test_encode_keeps_explicit_kind_and_version() {
        let encoded = Envelope::encode(dict!("c" => "lan", "t" => "HELLO", "v" => 2), NO_REPLY_RID, "discovery");
        let envelope = Envelope::decode(&encoded).unwrap();
        assert_eq!(envelope.rid, NO_REPLY_RID);
        assert_eq!(envelope.peer_set, "lan");
        assert_eq!(envelope.message(), dict!("t" => "HELLO", "v" => 2));
    }

    #[test]
    fn test_error_reply() {
        let encoded = Envelope::encode(dict!("c" => "", "rs" => ""), 8, "");
        let envelope = Envelope::decode(&encoded).unwrap();
        assert!(!envelope.is_request());
        assert!(envelope.is_error_reply());
    }

    #[test]
    fn test_missing_version_defaults_to_zero() {
        let encoded = encode_dict(&dict!("rid" => 1, "t" => "", "rt" => "", "c" => ""));
        assert_eq!(Envelope::decode(&encoded).unwrap().version, 0);
    }

    #[rstest]
    #[case::not_a_dict(&b"li1ee"[..])]
    #[case::garbage(&b"xyz"[..])]
    #[case::missing_rid(&b"d1:c0:2:rt0:1:t0:e"[..])]
    #[case::rid_not_int(&b"d1:c0:3:rid1:12:rt0:1:t0:e"[..])]
    #[case::missing_c(&b"d3:ridi1e2:rt0:1:t0:e"[..])]
    #[case::rt_not_string(&b"d1:c0:3:ridi1e2:rti0e1:t0:e"[..])]
    #[case::version_not_int(&b"d1:c0:3:ridi1e2:rt0:1:t0:1:v1:0e"[..])]
    fn test_malformed(#[case] buf: &[u8]) {
        assert!(Envelope::decode(buf).is_err());
    }
}
