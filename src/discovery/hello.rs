use thiserror::Error;

use crate::config::{is_valid_nick, is_valid_port};
use crate::dict;
use crate::discovery::peer_id::PeerId;
use crate::util::bencode::Dict;

pub const HELLO_TYPE: &str = "HELLO";
pub const BYE_TYPE: &str = "QUIT";

/// A peer's announcement of itself: identity, where its RPC port is, and the versions of the
///  protocol and of its profile.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Hello {
    pub uid: PeerId,
    pub nick: String,
    pub port: u16,
    pub protocol_version: i64,
    pub profile_version: i64,
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum HelloRejection {
    /// The sender claims our own uid. This is rejected without logging since every node on
    ///  the LAN hears its own broadcasts.
    #[error("hello carries our own uid")]
    OwnUid,
    #[error("invalid hello field {0}")]
    InvalidField(&'static str),
}

impl Hello {
    pub fn to_dict(&self) -> Dict {
        dict!(
            "t" => HELLO_TYPE,
            "v" => self.protocol_version,
            "pv" => self.profile_version,
            "port" => self.port,
            "nick" => self.nick.as_str(),
            "uid" => self.uid.as_hex(),
        )
    }

    /// Validates every field of a received hello. The `t` field is not checked here, callers
    ///  dispatch on it.
    pub fn from_dict(d: &Dict, my_uid: PeerId) -> Result<Hello, HelloRejection> {
        let protocol_version = d.get("v")
            .and_then(|v| v.as_int())
            .filter(|&v| v >= 0)
            .ok_or(HelloRejection::InvalidField("v"))?;
        let profile_version = d.get("pv")
            .and_then(|v| v.as_int())
            .filter(|&v| v >= 0)
            .ok_or(HelloRejection::InvalidField("pv"))?;
        let port = d.get("port")
            .and_then(|v| v.as_int())
            .filter(|&p| is_valid_port(p))
            .ok_or(HelloRejection::InvalidField("port"))? as u16;
        let nick = d.get("nick")
            .and_then(|v| v.as_str())
            .filter(|n| is_valid_nick(n))
            .ok_or(HelloRejection::InvalidField("nick"))?;
        let uid = d.get("uid")
            .and_then(|v| v.as_str())
            .and_then(|s| PeerId::parse(s).ok())
            .ok_or(HelloRejection::InvalidField("uid"))?;
        if uid == my_uid {
            return Err(HelloRejection::OwnUid);
        }

        Ok(Hello {
            uid,
            nick: nick.to_string(),
            port,
            protocol_version,
            profile_version,
        })
    }
}

pub fn bye_dict(uid: PeerId) -> Dict {
    dict!(
        "t" => BYE_TYPE,
        "uid" => uid.as_hex(),
    )
}
