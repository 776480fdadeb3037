//! Overlay node Id, connection Id or a routing target
use ed25519_dalek::VerifyingKey;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1_smol::Sha1;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits, and the bucket index of an Id relative to itself.
pub const MAX_BUCKET_INDEX: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Default)]
/// Overlay node Id, connection Id or a routing target.
///
/// The derived ordering compares the bytes as a big-endian unsigned integer,
/// so ordering the results of [Id::xor] orders Ids by XOR distance.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// The zero Id, meaning unknown or none.
    pub const ZERO: Id = Id([0; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Derive a node Id from its ed25519 public key.
    pub fn from_public_key(public_key: &VerifyingKey) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(public_key.as_bytes());

        Id(hasher.digest().bytes())
    }

    /// Returns `true` if this is the [Id::ZERO] sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; ID_SIZE]
    }

    /// XOR distance between this Id and another.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            result[i] = a ^ b;
        }

        Id(result)
    }

    /// Number of leading bits shared by this Id and `other`.
    ///
    /// Bucket index of an Id relative to itself is [MAX_BUCKET_INDEX],
    /// to an Id differing at the first bit is 0.
    /// Larger means closer.
    pub fn bucket_index(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                return (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;
            }
        }

        MAX_BUCKET_INDEX
    }

    /// Returns `true` if `a` is strictly closer to this Id than `b`.
    pub fn closer_to(&self, a: &Id, b: &Id) -> bool {
        a.xor(self) < b.xor(self)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
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
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Id, D::Error> {
        let bytes: serde_bytes::ByteBuf = Deserialize::deserialize(deserializer)?;

        Id::from_bytes(bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bucket_index_to_self() {
        let id = Id::random();
        assert_eq!(id.bucket_index(&id), MAX_BUCKET_INDEX)
    }

    #[test]
    fn bucket_index_to_id() {
        let id = Id([
            6, 57, 161, 226, 79, 187, 138, 178, 119, 223, 3, 52, 118, 171, 13, 225, 15, 171, 59,
            220,
        ]);
        let target = Id([
            3, 91, 26, 235, 151, 55, 173, 225, 168, 9, 51, 89, 79, 64, 93, 63, 119, 42, 160, 142,
        ]);

        assert_eq!(id.bucket_index(&target), 5)
    }

    #[test]
    fn bucket_index_to_furthest() {
        let id = Id::random();

        let mut opposite = [0_u8; ID_SIZE];
        for (i, &value) in id.0.iter().enumerate() {
            opposite[i] = value ^ 0xff;
        }
        let target = Id(opposite);

        assert_eq!(id.bucket_index(&target), 0)
    }

    #[test]
    fn xor_orders_by_distance() {
        let target = Id::ZERO;
        let mut near = [0_u8; ID_SIZE];
        near[ID_SIZE - 1] = 1;
        let mut far = [0_u8; ID_SIZE];
        far[0] = 0x80;

        assert!(target.closer_to(&Id(near), &Id(far)));
        assert!(!target.closer_to(&Id(far), &Id(near)));
        assert!(!target.closer_to(&Id(near), &Id(near)));
    }

    #[test]
    fn zero() {
        assert!(Id::ZERO.is_zero());
        assert!(Id::default().is_zero());
        assert!(!Id::random().is_zero());
    }

    #[test]
    fn from_str_round_trip() {
        let string = "ba3042eb2d373b19e7c411ce6826e31b37be0b2e";
        let id = Id::from_str(string).unwrap();

        assert_eq!(id.to_string(), string);
        assert!(Id::from_str("ba30").is_err());
        assert!(Id::from_str("zz3042eb2d373b19e7c411ce6826e31b37be0b2e").is_err());
    }

    #[test]
    fn from_bytes_checks_length() {
        assert!(Id::from_bytes([0_u8; 19]).is_err());
        assert_eq!(Id::from_bytes([1_u8; ID_SIZE]).unwrap(), Id([1; ID_SIZE]));
    }

    #[test]
    fn from_public_key() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[7; 32]).verifying_key();

        assert_eq!(Id::from_public_key(&key), Id::from_public_key(&key));
        assert!(!Id::from_public_key(&key).is_zero());
    }
}
