//! Keys, the XOR metric and the key factory.
//!
//! Every identifier in the overlay (peer identities, lookup targets, content
//! keys) is a fixed-width [`Key`]. Keys carry no useful order of their own:
//! proximity is always measured as XOR distance to some reference key, and
//! routing buckets are selected by the length of the prefix a key shares with
//! the local node's key.

use std::cmp::Ordering;
use std::fmt;

use iroh_blake3::Hasher;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::KadError;
use crate::protocol::MessageId;

/// A fixed-width identifier in the shared key space.
///
/// The width is a process-wide setting owned by the [`KeyFactory`]; keys of
/// different widths never meet inside one routing table.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Wrap raw bytes as a key without checking their width.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Width of the key in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Width of the key in bits.
    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }

    /// Read bit `index`, counting from the most significant bit of byte 0.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// XOR distance between two keys of the same width.
    ///
    /// - `a.distance(&a)` is all zeros
    /// - `a.distance(&b) == b.distance(&a)`
    pub fn distance(&self, other: &Key) -> Key {
        Key(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a ^ b)
            .collect())
    }

    /// Number of leading bits shared with `other`.
    ///
    /// Identical keys share all of their bits, so the result equals
    /// [`Key::bit_len`].
    pub fn shared_prefix_len(&self, other: &Key) -> usize {
        for (byte_idx, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return byte_idx * 8 + diff.leading_zeros() as usize;
            }
        }
        self.bit_len().min(other.bit_len())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = &self.0[..self.0.len().min(4)];
        write!(f, "Key({}..)", hex::encode(prefix))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Compare how close `a` and `b` are to `target`.
///
/// Returns `Ordering::Less` when `a` is strictly closer to `target` than `b`.
pub fn distance_cmp(target: &Key, a: &Key, b: &Key) -> Ordering {
    for ((t, x), y) in target.0.iter().zip(a.0.iter()).zip(b.0.iter()) {
        let da = t ^ x;
        let db = t ^ y;
        match da.cmp(&db) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Produces keys of one configured width and the random message identifiers
/// used for request correlation.
///
/// With a seed the factory is fully deterministic, which keeps multi-node
/// tests reproducible.
#[derive(Debug)]
pub struct KeyFactory {
    key_size: usize,
    rng: Mutex<StdRng>,
}

impl KeyFactory {
    /// Create a factory producing `key_size`-byte keys.
    pub fn new(key_size: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            key_size,
            rng: Mutex::new(rng),
        }
    }

    /// Key width in bytes.
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Generate a uniformly random key.
    pub fn generate(&self) -> Key {
        let mut bytes = vec![0u8; self.key_size];
        self.rng.lock().fill_bytes(&mut bytes);
        Key(bytes)
    }

    /// Derive a stable key from arbitrary content with BLAKE3.
    ///
    /// The extendable output is used so any configured width is supported:
    ///
    /// ```
    /// use kadnet::KeyFactory;
    ///
    /// let factory = KeyFactory::new(5, None);
    /// let key = factory.from_content(b"topic");
    /// assert_eq!(key.len(), 5);
    /// assert_eq!(key, factory.from_content(b"topic"));
    /// ```
    pub fn from_content(&self, data: &[u8]) -> Key {
        let mut hasher = Hasher::new();
        hasher.update(data);
        let mut out = vec![0u8; self.key_size];
        hasher.finalize_xof().fill(&mut out);
        Key(out)
    }

    /// Validate externally supplied bytes against the configured width.
    pub fn key_from_bytes(&self, bytes: &[u8]) -> Result<Key, KadError> {
        if bytes.len() != self.key_size {
            return Err(KadError::InvalidKeyLength {
                expected: self.key_size,
                actual: bytes.len(),
            });
        }
        Ok(Key(bytes.to_vec()))
    }

    /// Whether `key` has the configured width.
    pub fn accepts(&self, key: &Key) -> bool {
        key.len() == self.key_size
    }

    /// Generate a random key sharing exactly `prefix_len` leading bits with
    /// `reference`, i.e. a key that lands in bucket `prefix_len` of a routing
    /// table owned by `reference`.
    pub fn random_key_in_bucket(&self, reference: &Key, prefix_len: usize) -> Key {
        let mut key = self.generate();
        let bits = key.bit_len().min(reference.bit_len());
        for bit in 0..=prefix_len.min(bits.saturating_sub(1)) {
            let wanted = if bit < prefix_len {
                reference.bit(bit)
            } else {
                !reference.bit(bit)
            };
            let mask = 0x80u8 >> (bit % 8);
            if wanted {
                key.0[bit / 8] |= mask;
            } else {
                key.0[bit / 8] &= !mask;
            }
        }
        key
    }

    /// Draw a fresh correlation identifier for an outbound message.
    pub fn message_id(&self) -> MessageId {
        MessageId(self.rng.lock().gen())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(bytes: &[u8]) -> Key {
        Key::from_bytes(bytes.to_vec())
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = key(&[0b1010_1010, 0x0f]);
        let b = key(&[0b0101_0101, 0x0f]);

        assert_eq!(a.distance(&b), key(&[0xff, 0x00]));
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), key(&[0, 0]));
    }

    #[test]
    fn shared_prefix_counts_leading_equal_bits() {
        let zero = key(&[0, 0]);
        assert_eq!(zero.shared_prefix_len(&key(&[0x80, 0])), 0);
        assert_eq!(zero.shared_prefix_len(&key(&[0x00, 0x10])), 11);
        assert_eq!(zero.shared_prefix_len(&zero), 16);
    }

    #[test]
    fn distance_cmp_orders_by_xor_not_by_value() {
        let target = key(&[0x18]);
        let a = key(&[0x10]);
        let b = key(&[0x08]);
        let c = key(&[0x20]);

        assert_eq!(distance_cmp(&target, &a, &b), Ordering::Less);
        assert_eq!(distance_cmp(&target, &b, &c), Ordering::Less);
        assert_eq!(distance_cmp(&target, &a, &a), Ordering::Equal);
    }

    #[test]
    fn content_keys_are_deterministic_and_sized() {
        let factory = KeyFactory::new(20, None);
        let one = factory.from_content(b"hello world");
        assert_eq!(one.len(), 20);
        assert_eq!(one, factory.from_content(b"hello world"));
        assert_ne!(one, factory.from_content(b"goodbye world"));

        let expected = iroh_blake3::hash(b"hello world");
        assert_eq!(one.as_bytes(), &expected.as_bytes()[..20]);
    }

    #[test]
    fn seeded_factories_repeat_their_sequence() {
        let a = KeyFactory::new(8, Some(7));
        let b = KeyFactory::new(8, Some(7));
        assert_eq!(a.generate(), b.generate());
        assert_eq!(a.message_id(), b.message_id());
    }

    #[test]
    fn key_from_bytes_rejects_wrong_width() {
        let factory = KeyFactory::new(4, None);
        assert!(factory.key_from_bytes(&[1, 2, 3, 4]).is_ok());
        assert!(matches!(
            factory.key_from_bytes(&[1, 2]),
            Err(KadError::InvalidKeyLength {
                expected: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn random_key_in_bucket_lands_in_that_bucket() {
        let factory = KeyFactory::new(4, Some(99));
        let reference = factory.generate();
        for prefix_len in 0..reference.bit_len() {
            let key = factory.random_key_in_bucket(&reference, prefix_len);
            assert_eq!(reference.shared_prefix_len(&key), prefix_len);
        }
    }
}
