use anyhow::{anyhow, bail};
use bytes::Bytes;

use crate::dict;
use crate::discovery::peer_id::PeerId;
use crate::util::bencode::{decode_dict, encode_dict, Dict, Value};

pub const DATA_TYPE: &str = "data";
pub const ACK_TYPE: &str = "ack";

/// One fragment of a compressed payload
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataPacket {
    pub from: PeerId,
    pub to: PeerId,
    pub packet: i64,
    pub frag: usize,
    pub fragcount: usize,
    pub payload: Bytes,
    pub ack: bool,
}

/// Lists all fragments of a packet received so far
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckPacket {
    pub from: PeerId,
    pub to: PeerId,
    pub packet: i64,
    pub ack: Vec<usize>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet {
    Data(DataPacket),
    Ack(AckPacket),
}

impl Packet {
    pub fn from(&self) -> PeerId {
        match self {
            Packet::Data(d) => d.from,
            Packet::Ack(a) => a.from,
        }
    }

    pub fn to(&self) -> PeerId {
        match self {
            Packet::Data(d) => d.to,
            Packet::Ack(a) => a.to,
        }
    }

    pub fn encode(&self) -> Bytes {
        let d = match self {
            Packet::Data(d) => dict!(
                "t" => DATA_TYPE,
                "from" => d.from.as_hex(),
                "to" => d.to.as_hex(),
                "packet" => d.packet,
                "frag" => d.frag as i64,
                "fragcount" => d.fragcount as i64,
                "payload" => d.payload.clone(),
                "ack" => d.ack,
            ),
            Packet::Ack(a) => dict!(
                "t" => ACK_TYPE,
                "from" => a.from.as_hex(),
                "to" => a.to.as_hex(),
                "packet" => a.packet,
                "ack" => a.ack.iter().map(|&i| Value::Int(i as i64)).collect::<Vec<_>>(),
            ),
        };
        encode_dict(&d)
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Packet> {
        let d = decode_dict(buf)?;

        let from = PeerId::parse(str_field(&d, "from")?)?;
        let to = PeerId::parse(str_field(&d, "to")?)?;
        let packet = int_field(&d, "packet")?;

        match str_field(&d, "t")? {
            DATA_TYPE => {
                let payload = d.get("payload")
                    .and_then(|v| v.as_bytes())
                    .ok_or_else(|| anyhow!("data packet without payload"))?
                    .clone();
                let ack = d.get("ack")
                    .and_then(|v| v.as_bool())
                    .ok_or_else(|| anyhow!("data packet without valid ack flag"))?;
                Ok(Packet::Data(DataPacket {
                    from,
                    to,
                    packet,
                    frag: unsigned_field(&d, "frag")?,
                    fragcount: unsigned_field(&d, "fragcount")?,
                    payload,
                    ack,
                }))
            }
            ACK_TYPE => {
                let list = d.get("ack")
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| anyhow!("ack packet without ack list"))?;
                if list.is_empty() {
                    bail!("empty ack list");
                }
                let ack = list.iter()
                    .map(|v| v.as_int()
                        .filter(|&i| i >= 0)
                        .map(|i| i as usize)
                        .ok_or_else(|| anyhow!("invalid fragment index {:?} in ack", v)))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(Packet::Ack(AckPacket { from, to, packet, ack }))
            }
            other => Err(anyhow!("invalid packet type {:?}", other)),
        }
    }
}

fn str_field<'a>(d: &'a Dict, key: &str) -> anyhow::Result<&'a str> {
    d.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("packet field {} missing or not a string", key))
}

fn int_field(d: &Dict, key: &str) -> anyhow::Result<i64> {
    d.get(key)
        .and_then(|v| v.as_int())
        .ok_or_else(|| anyhow!("packet field {} missing or not an integer", key))
}

fn unsigned_field(d: &Dict, key: &str) -> anyhow::Result<usize> {
    let value = int_field(d, key)?;
    if value < 0 {
        bail!("packet field {} must not be negative: {}", key, value);
    }
    Ok(value as usize)
}

/// Splits a (compressed) payload into encoded data packets of at most `mtu` payload bytes. An
///  empty payload still yields one fragment.
pub fn fragment(from: PeerId, to: PeerId, packet: i64, payload: &[u8], mtu: usize, ack: bool) -> Vec<Bytes> {
    let chunks = if payload.is_empty() {
        vec![payload]
    }
    else {
        payload.chunks(mtu).collect::<Vec<_>>()
    };
    let fragcount = chunks.len();

    chunks.into_iter()
        .enumerate()
        .map(|(frag, chunk)| Packet::Data(DataPacket {
            from,
            to,
            packet,
            frag,
            fragcount,
            payload: Bytes::copy_from_slice(chunk),
            ack,
        }).encode())
        .collect()
}
