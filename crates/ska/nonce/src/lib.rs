//! SKA Nonce - Replay protection, one counter per channel
//!
//! A channel is the namespace keyed by (principal, policy id, session id).
//! Channels are created implicitly on first use and never deleted; differing
//! in any component of the key yields a fully disjoint nonce space, so
//! concurrent sessions cannot interfere with each other.

#![deny(unsafe_code)]

use ska_crypto::keccak256;
use ska_types::{Address, Hash32, PolicyId, SessionId};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Derive the channel key for a (principal, policy id, session id) tuple.
pub fn channel_key(principal: Address, policy_id: PolicyId, session_id: SessionId) -> Hash32 {
    let mut buf = Vec::with_capacity(20 + 32 + 8);
    buf.extend_from_slice(&principal.0);
    buf.extend_from_slice(&policy_id.0 .0);
    buf.extend_from_slice(&session_id.0.to_be_bytes());
    keccak256(&buf)
}

/// Keyed store of strictly-increasing per-channel counters.
pub struct ChannelNonceStore {
    channels: RwLock<HashMap<Hash32, u64>>,
}

impl ChannelNonceStore {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Accept `nonce` for `channel` iff it is strictly greater than the
    /// stored value, then store it. Skipping values is legal.
    pub fn enforce(&self, channel: Hash32, nonce: u64) -> Result<(), NonceError> {
        let mut channels = self.channels.write().map_err(|_| NonceError::LockError)?;
        let current = channels.entry(channel).or_insert(0);
        if nonce <= *current {
            return Err(NonceError::NotIncreasing {
                channel,
                submitted: nonce,
                current: *current,
            });
        }
        *current = nonce;
        Ok(())
    }

    /// Last accepted nonce for a channel; zero for an untouched channel.
    pub fn peek(&self, channel: &Hash32) -> Result<u64, NonceError> {
        let channels = self.channels.read().map_err(|_| NonceError::LockError)?;
        Ok(channels.get(channel).copied().unwrap_or(0))
    }
}

impl Default for ChannelNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Replay-protection errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NonceError {
    #[error("Nonce {submitted} not above {current} for channel {channel}")]
    NotIncreasing {
        channel: Hash32,
        submitted: u64,
        current: u64,
    },

    #[error("Lock error")]
    LockError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn channel(tag: u8) -> Hash32 {
        channel_key(Address([tag; 20]), PolicyId(Hash32([1u8; 32])), SessionId(0))
    }

    #[test]
    fn strictly_increasing_with_sparse_jumps() {
        let store = ChannelNonceStore::new();
        let c = channel(0xAA);

        assert!(store.enforce(c, 1).is_ok());
        assert!(matches!(
            store.enforce(c, 1),
            Err(NonceError::NotIncreasing { current: 1, .. })
        ));
        assert!(store.enforce(c, 5).is_ok());
        assert!(store.enforce(c, 3).is_err());
        assert!(store.enforce(c, 6).is_ok());
        assert_eq!(store.peek(&c).unwrap(), 6);
    }

    #[test]
    fn zero_is_never_accepted() {
        let store = ChannelNonceStore::new();
        assert!(store.enforce(channel(0xAB), 0).is_err());
    }

    #[test]
    fn channels_are_independent() {
        let store = ChannelNonceStore::new();
        let principal = Address([0xAA; 20]);
        let a = channel_key(principal, PolicyId(Hash32([1u8; 32])), SessionId(0));
        let by_policy = channel_key(principal, PolicyId(Hash32([2u8; 32])), SessionId(0));
        let by_session = channel_key(principal, PolicyId(Hash32([1u8; 32])), SessionId(1));
        let by_principal = channel_key(Address([0xAB; 20]), PolicyId(Hash32([1u8; 32])), SessionId(0));

        store.enforce(a, 9).unwrap();

        for other in [by_policy, by_session, by_principal] {
            assert_ne!(a, other);
            assert_eq!(store.peek(&other).unwrap(), 0);
            // Nonce 1 is fresh on every other channel.
            store.enforce(other, 1).unwrap();
        }
        assert_eq!(store.peek(&a).unwrap(), 9);
    }

    proptest! {
        #[test]
        fn accepted_sequence_is_strictly_monotonic(nonces in proptest::collection::vec(1u64..10_000, 1..60)) {
            let store = ChannelNonceStore::new();
            let c = channel(0x01);
            let mut high_water = 0u64;

            for nonce in nonces {
                let result = store.enforce(c, nonce);
                if nonce > high_water {
                    prop_assert!(result.is_ok());
                    high_water = nonce;
                } else {
                    prop_assert!(result.is_err());
                }
                prop_assert_eq!(store.peek(&c).unwrap(), high_water);
            }
        }
    }
}
