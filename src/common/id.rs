//! Node id or infohash: the 160 bit key space of the DHT.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;

use crate::{Error, Result};

/// The size of node ids and infohashes in bytes.
pub const ID_SIZE: usize = 20;

/// The size of node ids in bits, and the maximum count of shared prefix bits.
pub const MAX_COMMON_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A node id or a lookup target.
pub struct Id(pub [u8; ID_SIZE]);

/// Identifier of a piece of content, used as a DHT key. Infohashes live in
/// the same key space as node ids and are interchangeable for distance
/// calculations.
pub type InfoHash = Id;

impl Id {
    /// Generate a random Id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of
    /// length [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Count of leading bits shared between this id and `other`, in [0, 160].
    ///
    /// This is the proximity measure of the neighborhood bookkeeping: the
    /// more prefix bits two ids share, the closer they are by XOR distance.
    pub fn common_bits(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let xor = self.0[i] ^ other.0[i];
            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }

        MAX_COMMON_BITS
    }

    /// Bytewise XOR of the two ids. Distances only order meaningfully when
    /// compared against a fixed pivot.
    pub fn xor_distance(&self, other: &Id) -> [u8; ID_SIZE] {
        let mut distance = [0u8; ID_SIZE];
        for (i, d) in distance.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        distance
    }

    /// The `i`th bit of this id, counting from the most significant.
    pub(crate) fn bit(&self, i: usize) -> bool {
        (self.0[i / 8] >> (7 - (i % 8))) & 1 == 1
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidIdSize(s.len()))?;
        Id::from_bytes(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // The id used by the original neighborhood tests, kept as a byte string
    // so the expected shared prefix lengths below stay literal.
    const ID: &[u8; 20] = b"01abcdefghij01234567";

    fn id(bytes: &[u8; 20]) -> Id {
        Id(*bytes)
    }

    #[test]
    fn common_bits_table() {
        let table: &[(&[u8; 20], usize)] = &[
            (b"01abcdefghij01234567", 160),
            (b"01abcdefghij01234566", 159),
            (b"01abcdefghij01234568", 156),
            (b"01abcdefghij01234569", 156),
            (b"01abcdefghij0123456a", 153),
            (b"01abcdefghij0123456b", 153),
            (b"01abcdefghij0123456c", 153),
            (b"01abcdefghij0123456d", 153),
        ];

        for (other, want) in table {
            let got = id(ID).common_bits(&id(other));
            assert_eq!(got, *want, "common_bits against {:?}", other);
        }
    }

    #[test]
    fn common_bits_bounds_and_symmetry() {
        for _ in 0..64 {
            let a = Id::random();
            let b = Id::random();

            let c = a.common_bits(&b);
            assert!(c <= MAX_COMMON_BITS);
            assert_eq!(c, b.common_bits(&a));
            assert_eq!(a.common_bits(&a), MAX_COMMON_BITS);
        }
    }

    #[test]
    fn from_hex() {
        let hex = "d1c5676ae7ac98e8b19f63565905105e3c4c37a2";
        let id: Id = hex.parse().unwrap();

        assert_eq!(id.to_string(), hex);
        assert!("d1c5".parse::<Id>().is_err());
    }

    #[test]
    fn bit_order_is_msb_first() {
        let mut bytes = [0u8; ID_SIZE];
        bytes[0] = 0b1000_0001;
        let id = Id(bytes);

        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(7));
        assert!(!id.bit(8));
    }
}
