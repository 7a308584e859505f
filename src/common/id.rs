//! Kademlia node Id or a lookup target

use std::fmt::{self, Debug, Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;

use crc::{Crc, CRC_32_ISCSI};
use rand::Rng;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Kademlia node Id or a lookup target
#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
pub struct Id(pub(crate) [u8; ID_SIZE]);

impl Id {
    /// Generate a random Id
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();

        Id(rng.gen())
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Generate a secure Id for an IPv4 address according to
    /// [BEP_0042](https://www.bittorrent.org/beps/bep_0042.html).
    ///
    /// The first 21 bits are derived from the masked address and the 3-bit
    /// `rank`, the last byte is `rank` itself, and everything else is random.
    pub fn from_ipv4(ip: Ipv4Addr, rank: u8) -> Id {
        let mut rng = rand::thread_rng();
        let mut bytes: [u8; ID_SIZE] = rng.gen();

        let checksum = ip_checksum(ip, rank);

        bytes[0] = (checksum >> 24) as u8;
        bytes[1] = (checksum >> 16) as u8;
        bytes[2] = ((checksum >> 8) as u8 & 0xf8) | (bytes[2] & 0x07);
        bytes[ID_SIZE - 1] = rank;

        Id(bytes)
    }

    /// Returns `true` if this Id was generated from this IPv4 address
    /// with [Id::from_ipv4].
    pub fn is_valid_for_ipv4(&self, ip: Ipv4Addr) -> bool {
        let rank = self.0[ID_SIZE - 1];
        let checksum = ip_checksum(ip, rank);

        self.0[0] == (checksum >> 24) as u8
            && self.0[1] == (checksum >> 16) as u8
            && (self.0[2] & 0xf8) == ((checksum >> 8) as u8 & 0xf8)
    }

    /// Generate a random Id that shares the first `depth` bits with `prefix`.
    pub fn random_in_range(prefix: &Id, depth: usize) -> Id {
        debug_assert!(depth <= ID_SIZE * 8);

        let mut rng = rand::thread_rng();
        let mut bytes: [u8; ID_SIZE] = rng.gen();

        let whole = depth / 8;
        bytes[..whole].copy_from_slice(&prefix.0[..whole]);

        let rem = depth % 8;
        if rem > 0 {
            let mask = 0xff_u8 << (8 - rem);
            bytes[whole] = (prefix.0[whole] & mask) | (bytes[whole] & !mask);
        }

        Id(bytes)
    }

    /// XOR distance between this Id and another.
    ///
    /// Only the ordering of distances matters, which is the ordering
    /// of the resulting Ids interpreted as big-endian integers.
    pub fn xor(&self, other: &Id) -> Id {
        let mut distance = [0_u8; ID_SIZE];

        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(distance)
    }

    /// Returns the `index`th bit, counting from the most significant.
    pub(crate) fn bit(&self, index: usize) -> bool {
        (self.0[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Returns a copy of this Id with the `index`th bit set.
    pub(crate) fn with_bit(&self, index: usize) -> Id {
        let mut bytes = self.0;
        bytes[index / 8] |= 0x80 >> (index % 8);

        Id(bytes)
    }

    /// Returns `true` if the first `depth` bits of both Ids are equal.
    pub(crate) fn shares_prefix(&self, other: &Id, depth: usize) -> bool {
        let whole = depth / 8;
        if self.0[..whole] != other.0[..whole] {
            return false;
        }

        let rem = depth % 8;
        if rem == 0 {
            return true;
        }

        let mask = 0xff_u8 << (8 - rem);
        (self.0[whole] & mask) == (other.0[whole] & mask)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

fn ip_checksum(ip: Ipv4Addr, rank: u8) -> u32 {
    let masked = (u32::from_be_bytes(ip.octets()) & 0x030f_3fff) | ((rank as u32) << 29);

    CASTAGNOLI.checksum(&masked.to_be_bytes())
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        if s.len() != ID_SIZE * 2 {
            return Err(DecodeIdError::InvalidIdSize(InvalidIdSize(s.len() / 2)));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DecodeIdError::InvalidHexCharacter)?;
        }

        Ok(Id(bytes))
    }
}

impl TryFrom<&str> for Id {
    type Error = DecodeIdError;

    fn try_from(s: &str) -> Result<Id, DecodeIdError> {
        Id::from_str(s)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Invalid Id size, expected 20, got {0}")]
pub struct InvalidIdSize(pub usize);

#[derive(thiserror::Error, Debug)]
pub enum DecodeIdError {
    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),

    #[error("Invalid hex character")]
    InvalidHexCharacter,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_ordering() {
        let a: Id = "0000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let b: Id = "8000000000000000000000000000000000000001"
            .try_into()
            .unwrap();
        let c: Id = "f000000000000000000000000000000000000000"
            .try_into()
            .unwrap();

        assert_eq!(a.xor(&a), a);
        assert!(a.xor(&b) < a.xor(&c));
        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn hex_roundtrip() {
        let id = Id::random();
        let parsed: Id = id.to_string().as_str().try_into().unwrap();

        assert_eq!(parsed, id);
    }

    #[test]
    fn bits() {
        let id: Id = "a000000000000000000000000000000000000000"
            .try_into()
            .unwrap();

        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(2));
        assert!(!id.bit(3));
    }

    #[test]
    fn random_in_range_keeps_prefix() {
        let prefix = Id::random();

        for depth in [0, 1, 7, 8, 13, 159, 160] {
            let id = Id::random_in_range(&prefix, depth);
            assert!(id.shares_prefix(&prefix, depth), "depth {depth}");
        }
    }

    #[test]
    fn bep_0042_test_vectors() {
        // (ip, rank, first 21 bits of the expected id)
        let vectors: [(&str, u8, [u8; 3]); 5] = [
            ("124.31.75.21", 1, [0x5f, 0xbf, 0xbf]),
            ("21.75.31.124", 86, [0x5a, 0x3c, 0xe9]),
            ("65.23.51.170", 22, [0xa5, 0xd4, 0x32]),
            ("84.124.73.14", 65, [0x1b, 0x03, 0x21]),
            ("43.213.53.83", 90, [0xe5, 0x6f, 0x6c]),
        ];

        for (ip, rank, expected) in vectors {
            let ip: Ipv4Addr = ip.parse().unwrap();
            let id = Id::from_ipv4(ip, rank);

            assert_eq!(id.0[0], expected[0], "{ip} rank {rank}");
            assert_eq!(id.0[1], expected[1], "{ip} rank {rank}");
            assert_eq!(id.0[2] & 0xf8, expected[2] & 0xf8, "{ip} rank {rank}");
            assert_eq!(id.0[ID_SIZE - 1], rank, "{ip} rank {rank}");

            assert!(id.is_valid_for_ipv4(ip));
        }
    }

    #[test]
    fn secure_id_rejects_other_ip() {
        let id = Id::from_ipv4("124.31.75.21".parse().unwrap(), 1);

        assert!(!id.is_valid_for_ipv4("124.31.75.22".parse().unwrap()));
    }
}
