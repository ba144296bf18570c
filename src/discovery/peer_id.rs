use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::bail;

/// Number of hex characters in the wire representation of a [PeerId]
pub const PEER_ID_HEX_LEN: usize = 16;

/// A peer's identity, independent of its current network address. It is chosen randomly by the
///  peer itself and travels as a string of 16 lowercase hex digits.
///
/// NB: Nothing prevents a peer from claiming somebody else's id, the protocol has no
///      authentication. Code accepting an id from the network checks it against the known ip
///      address where that is possible.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(raw: u64) -> PeerId {
        PeerId(raw)
    }

    pub fn random() -> PeerId {
        PeerId(rand::random())
    }

    /// Strict parsing: exactly 16 characters, only `0-9` and `a-f`
    pub fn parse(s: &str) -> anyhow::Result<PeerId> {
        if s.len() != PEER_ID_HEX_LEN {
            bail!("peer id must have {} hex characters: {:?}", PEER_ID_HEX_LEN, s);
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            bail!("peer id must consist of lowercase hex characters: {:?}", s);
        }
        Ok(PeerId(u64::from_str_radix(s, 16)?))
    }

    pub fn is_valid(s: &str) -> bool {
        PeerId::parse(s).is_ok()
    }

    pub fn as_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:016x}]", self.0)
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerId::parse(s)
    }
}
