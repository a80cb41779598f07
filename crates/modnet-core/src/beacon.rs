//! Multicast beacon datagrams.
//!
//! Layout (all integers big endian):
//!
//! ```text
//! offset size field
//! 0      2    magic "MN"
//! 2      1    version (1)
//! 3      16   module id
//! 19     2    address count N
//! 21     ..   N x { family u8 (4 | 6), ip (4 | 16 bytes), port u16 }
//! ```

use crate::ModuleId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const MAGIC: [u8; 2] = *b"MN";
const VERSION: u8 = 1;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// A module announcing itself and where it can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub module_id: ModuleId,
    pub addresses: Vec<SocketAddr>,
}

impl Beacon {
    pub fn new(module_id: ModuleId, addresses: Vec<SocketAddr>) -> Self {
        Self {
            module_id,
            addresses,
        }
    }

    /// Encode to a datagram. Addresses beyond `u16::MAX` are dropped.
    pub fn encode(&self) -> Bytes {
        let count = self.addresses.len().min(u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(21 + count * 19);
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_slice(self.module_id.as_bytes());
        buf.put_u16(count as u16);
        for addr in self.addresses.iter().take(count) {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    buf.put_u8(FAMILY_V4);
                    buf.put_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    buf.put_u8(FAMILY_V6);
                    buf.put_slice(&ip.octets());
                }
            }
            buf.put_u16(addr.port());
        }
        buf.freeze()
    }

    /// Decode a received datagram.
    pub fn decode(mut buf: &[u8]) -> Result<Self, BeaconDecodeError> {
        need(buf, 3)?;
        let mut magic = [0u8; 2];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(BeaconDecodeError::BadMagic);
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(BeaconDecodeError::UnsupportedVersion(version));
        }

        need(buf, 18)?;
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let count = buf.get_u16();

        let mut addresses = Vec::with_capacity(usize::from(count).min(64));
        for _ in 0..count {
            need(buf, 1)?;
            let ip = match buf.get_u8() {
                FAMILY_V4 => {
                    need(buf, 4)?;
                    let mut octets = [0u8; 4];
                    buf.copy_to_slice(&mut octets);
                    IpAddr::V4(Ipv4Addr::from(octets))
                }
                FAMILY_V6 => {
                    need(buf, 16)?;
                    let mut octets = [0u8; 16];
                    buf.copy_to_slice(&mut octets);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
                other => return Err(BeaconDecodeError::BadFamily(other)),
            };
            need(buf, 2)?;
            addresses.push(SocketAddr::new(ip, buf.get_u16()));
        }

        Ok(Self {
            module_id: ModuleId::from_bytes(id),
            addresses,
        })
    }
}

fn need(buf: &[u8], n: usize) -> Result<(), BeaconDecodeError> {
    if buf.remaining() < n {
        Err(BeaconDecodeError::Truncated)
    } else {
        Ok(())
    }
}

/// Error decoding a beacon datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BeaconDecodeError {
    #[error("not a beacon (bad magic)")]
    BadMagic,
    #[error("unsupported beacon version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated beacon")]
    Truncated,
    #[error("unknown address family {0}")]
    BadFamily(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Beacon {
        Beacon::new(
            ModuleId::random(),
            vec![
                "10.0.0.1:5000".parse().unwrap(),
                "[fe80::1]:5001".parse().unwrap(),
            ],
        )
    }

    #[test]
    fn roundtrip() {
        let beacon = sample();
        let bytes = beacon.encode();
        assert_eq!(bytes.len(), 21 + 7 + 19);
        assert_eq!(Beacon::decode(&bytes).unwrap(), beacon);
    }

    #[test]
    fn empty_address_list() {
        let beacon = Beacon::new(ModuleId::random(), Vec::new());
        assert_eq!(Beacon::decode(&beacon.encode()).unwrap(), beacon);
    }

    #[test]
    fn rejects_foreign_datagrams() {
        assert_eq!(Beacon::decode(b"hello world"), Err(BeaconDecodeError::BadMagic));
        assert_eq!(Beacon::decode(b"MN"), Err(BeaconDecodeError::Truncated));

        let mut bytes = sample().encode().to_vec();
        bytes[2] = 9;
        assert_eq!(
            Beacon::decode(&bytes),
            Err(BeaconDecodeError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn rejects_truncated_addresses() {
        let bytes = sample().encode();
        for cut in [20, 22, 27, bytes.len() - 1] {
            assert_eq!(
                Beacon::decode(&bytes[..cut]),
                Err(BeaconDecodeError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn rejects_unknown_family() {
        let mut bytes = sample().encode().to_vec();
        bytes[21] = 5;
        assert_eq!(Beacon::decode(&bytes), Err(BeaconDecodeError::BadFamily(5)));
    }
}
