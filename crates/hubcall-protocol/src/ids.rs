//! Call identifiers and their generator.
//!
//! A [`CallId`] correlates an outbound `invoke_and_wait` with the reply
//! that eventually comes back through the hub. It must be unique across
//! every process taking part in the session, so it pairs a random
//! per-process [`ProcessToken`] with a local counter.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// 128 random bits identifying one generator "epoch" in one process.
///
/// 128 bits make an accidental collision between two processes (or two
/// epochs of the same process) practically impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessToken([u8; 16]);

impl ProcessToken {
    /// Mints a fresh random token.
    pub fn random() -> Self {
        Self(rand::rng().random())
    }

    /// Builds a token from raw bytes. Useful for deterministic tests.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of the token.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ProcessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A globally unique call identifier.
///
/// Two ids are equal only when both the sequence number and the process
/// token match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId {
    process: ProcessToken,
    sequence: u32,
}

impl CallId {
    /// Assembles an id from its parts.
    pub fn new(process: ProcessToken, sequence: u32) -> Self {
        Self { process, sequence }
    }

    pub fn process(&self) -> ProcessToken {
        self.process
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call:{}:{}", self.process, self.sequence)
    }
}

/// Produces [`CallId`]s for one process.
///
/// Each messenger owns its own generator. Ids are handed out in increasing
/// sequence order under the current token. When the counter would wrap
/// past `u32::MAX`, the generator mints a new token and restarts at 0, so
/// an id that was already issued is never issued again.
#[derive(Debug)]
pub struct CallIdGenerator {
    state: Mutex<GeneratorState>,
}

#[derive(Debug)]
struct GeneratorState {
    process: ProcessToken,
    next: u32,
}

impl CallIdGenerator {
    /// Creates a generator with a random token and a counter at 0.
    pub fn new() -> Self {
        Self::starting_at(ProcessToken::random(), 0)
    }

    /// Creates a generator that will issue `{process, next}` first.
    pub fn starting_at(process: ProcessToken, next: u32) -> Self {
        Self {
            state: Mutex::new(GeneratorState { process, next }),
        }
    }

    /// Issues the next id.
    pub fn next(&self) -> CallId {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = CallId::new(state.process, state.next);
        match state.next.checked_add(1) {
            Some(next) => state.next = next,
            None => {
                state.process = ProcessToken::random();
                state.next = 0;
            }
        }
        id
    }

    /// The token the next id will carry.
    pub fn process_token(&self) -> ProcessToken {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process
    }
}

impl Default for CallIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_sequential_ids_are_unique_and_increasing() {
        let ids = CallIdGenerator::new();
        let issued: Vec<CallId> = (0..10_000).map(|_| ids.next()).collect();

        let unique: HashSet<_> = issued.iter().copied().collect();
        assert_eq!(unique.len(), issued.len());
        assert!(issued.windows(2).all(|w| w[0].sequence() < w[1].sequence()));
    }

    #[test]
    fn test_wraparound_rotates_token_and_never_reissues() {
        let token = ProcessToken::from_bytes([7; 16]);
        let ids = CallIdGenerator::starting_at(token, u32::MAX - 2);

        let issued: Vec<CallId> = (0..6).map(|_| ids.next()).collect();

        assert_eq!(issued[0], CallId::new(token, u32::MAX - 2));
        assert_eq!(issued[2], CallId::new(token, u32::MAX));
        // After the counter is exhausted, a new epoch starts at 0.
        assert_ne!(issued[3].process(), token);
        assert_eq!(issued[3].sequence(), 0);
        assert_eq!(issued[5].sequence(), 2);

        let unique: HashSet<_> = issued.iter().copied().collect();
        assert_eq!(unique.len(), issued.len());
        assert_ne!(ids.process_token(), token);
    }

    #[test]
    fn test_equality_needs_both_parts() {
        let a = ProcessToken::from_bytes([1; 16]);
        let b = ProcessToken::from_bytes([2; 16]);
        assert_eq!(CallId::new(a, 5), CallId::new(a, 5));
        assert_ne!(CallId::new(a, 5), CallId::new(a, 6));
        assert_ne!(CallId::new(a, 5), CallId::new(b, 5));
    }

    #[test]
    fn test_two_generators_do_not_collide() {
        let left = CallIdGenerator::new();
        let right = CallIdGenerator::new();
        assert_ne!(left.next(), right.next());
    }

    #[test]
    fn test_concurrent_generation_is_collision_free() {
        let ids = Arc::new(CallIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..1_000).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), 4_000);
    }

    #[test]
    fn test_display_formats() {
        let token = ProcessToken::from_bytes([0xab; 16]);
        assert_eq!(token.to_string(), "ab".repeat(16));
        assert_eq!(
            CallId::new(token, 9).to_string(),
            format!("call:{}:9", "ab".repeat(16))
        );
    }
}
