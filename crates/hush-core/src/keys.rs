//! Group key ledger: key generations per group feed and fallback decryption.
//!
//! Key material for a generation never changes once learned. Incoming
//! records for a known generation may only move its validity bounds.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::FeedCipher;
use crate::message::Message;
use crate::store::Snapshot;

/// One versioned symmetric key of a group feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeyGeneration {
    pub key_generation: u32,
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    pub valid_from_block: u64,
    /// Open until the next generation is admitted
    #[serde(default)]
    pub valid_to_block: Option<u64>,
}

impl GroupKeyGeneration {
    pub fn new(key_generation: u32, key: Vec<u8>, valid_from_block: u64) -> Self {
        Self {
            key_generation,
            key,
            valid_from_block,
            valid_to_block: None,
        }
    }
}

/// Key generations known for one group feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeyState {
    /// Highest known generation number
    pub current_key_generation: u32,
    generations: BTreeMap<u32, GroupKeyGeneration>,
    /// Generations we know exist but hold no key for
    missing_generations: BTreeSet<u32>,
}

/// What a merge changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMergeReport {
    pub added: Vec<u32>,
    /// Generations whose incoming key bytes disagreed with the stored ones
    pub conflicts: Vec<u32>,
}

impl KeyMergeReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty()
    }
}

impl GroupKeyState {
    pub fn generation(&self, key_generation: u32) -> Option<&GroupKeyGeneration> {
        self.generations.get(&key_generation)
    }

    pub fn generations(&self) -> impl Iterator<Item = &GroupKeyGeneration> {
        self.generations.values()
    }

    pub fn missing_generations(&self) -> &BTreeSet<u32> {
        &self.missing_generations
    }

    pub fn is_missing(&self, key_generation: u32) -> bool {
        self.missing_generations.contains(&key_generation)
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    /// Record a generation we could not decrypt with. No-op if the key is known.
    pub fn record_missing(&mut self, key_generation: u32) {
        if !self.generations.contains_key(&key_generation) {
            self.missing_generations.insert(key_generation);
        }
    }

    /// Merge incoming generations and server-reported gaps.
    pub fn merge(
        &mut self,
        incoming: impl IntoIterator<Item = GroupKeyGeneration>,
        missing: &[u32],
    ) -> KeyMergeReport {
        let mut report = KeyMergeReport::default();

        for generation in incoming {
            let number = generation.key_generation;
            match self.generations.get_mut(&number) {
                Some(known) => {
                    if known.key != generation.key {
                        report.conflicts.push(number);
                    }
                    known.valid_from_block = generation.valid_from_block;
                    if generation.valid_to_block.is_some() {
                        known.valid_to_block = generation.valid_to_block;
                    }
                }
                None => {
                    self.generations.insert(number, generation);
                    report.added.push(number);
                }
            }
        }

        for number in &report.added {
            self.close_predecessor(*number);
            if let Some(next_from) = number
                .checked_add(1)
                .and_then(|next| self.generations.get(&next))
                .map(|g| g.valid_from_block)
            {
                if let Some(current) = self.generations.get_mut(number) {
                    current.valid_to_block.get_or_insert(next_from);
                }
            }
        }

        for number in missing {
            self.record_missing(*number);
        }
        let generations = &self.generations;
        self.missing_generations
            .retain(|number| !generations.contains_key(number));

        if let Some(max) = self.generations.keys().next_back() {
            self.current_key_generation = self.current_key_generation.max(*max);
        }
        report
    }

    fn close_predecessor(&mut self, number: u32) {
        let Some(prev) = number.checked_sub(1) else {
            return;
        };
        let Some(valid_from) = self.generations.get(&number).map(|g| g.valid_from_block) else {
            return;
        };
        if let Some(previous) = self.generations.get_mut(&prev) {
            previous.valid_to_block.get_or_insert(valid_from);
        }
    }
}

/// Result of attempting to decrypt one group payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Decrypted { plaintext: Vec<u8>, key_generation: u32 },
    /// The tagged generation is not known locally
    MissingKey { generation: u32 },
    /// A known key (or every key, when untagged) failed; the payload is bad
    Failed { generation: Option<u32> },
}

/// Decrypt a group payload.
///
/// A tagged payload is tried against exactly its generation. An untagged one
/// is tried against every known key, newest first, stopping at the first
/// success.
pub fn decrypt_with_fallback(
    cipher: &dyn FeedCipher,
    state: &GroupKeyState,
    ciphertext: &[u8],
    tagged_generation: Option<u32>,
) -> DecryptOutcome {
    if let Some(generation) = tagged_generation {
        let Some(known) = state.generation(generation) else {
            return DecryptOutcome::MissingKey { generation };
        };
        return match cipher.decrypt(ciphertext, &known.key) {
            Ok(plaintext) => DecryptOutcome::Decrypted {
                plaintext,
                key_generation: generation,
            },
            Err(_) => DecryptOutcome::Failed {
                generation: Some(generation),
            },
        };
    }

    open_with_first(cipher, state.generations.values().rev(), ciphertext)
}

fn open_with_first<'a>(
    cipher: &dyn FeedCipher,
    mut candidates: impl Iterator<Item = &'a GroupKeyGeneration>,
    ciphertext: &[u8],
) -> DecryptOutcome {
    candidates
        .find_map(|g| {
            cipher
                .decrypt(ciphertext, &g.key)
                .ok()
                .map(|plaintext| DecryptOutcome::Decrypted {
                    plaintext,
                    key_generation: g.key_generation,
                })
        })
        .unwrap_or(DecryptOutcome::Failed { generation: None })
}

/// Decrypt a cached group message against `state`.
pub fn decrypt_group_message(
    cipher: &dyn FeedCipher,
    state: &GroupKeyState,
    message: &Message,
) -> DecryptOutcome {
    match message.ciphertext() {
        Ok(bytes) => decrypt_with_fallback(cipher, state, &bytes, message.key_generation),
        Err(_) => DecryptOutcome::Failed {
            generation: message.key_generation,
        },
    }
}

/// Fold a decryption outcome into the message and the feed's key state.
pub fn apply_outcome(message: &mut Message, state: &mut GroupKeyState, outcome: DecryptOutcome) {
    match outcome {
        DecryptOutcome::Decrypted {
            plaintext,
            key_generation,
        } => {
            if message.set_plaintext(plaintext) {
                message.key_generation = Some(key_generation);
            }
        }
        DecryptOutcome::MissingKey { generation } => {
            message.decryption_failed = true;
            message.key_generation = Some(generation);
            state.record_missing(generation);
        }
        DecryptOutcome::Failed { .. } => {
            message.decryption_failed = true;
        }
    }
}

impl Snapshot {
    /// Merge key generations for a group feed.
    pub fn merge_key_generations(
        &mut self,
        feed_id: &str,
        incoming: Vec<GroupKeyGeneration>,
        missing: &[u32],
    ) -> KeyMergeReport {
        let state = self.key_states.entry(feed_id.to_string()).or_default();
        let report = state.merge(incoming, missing);
        for generation in &report.conflicts {
            warn!(
                feed_id = %feed_id,
                key_generation = generation,
                "ignoring conflicting key material for known generation"
            );
        }
        if report.changed() {
            debug!(
                feed_id = %feed_id,
                added = ?report.added,
                current = state.current_key_generation,
                "merged key generations"
            );
        }
        report
    }

    /// Retry the undecryptable messages of `feed_id` that the generations in
    /// `added` could open.
    ///
    /// A tagged message is retried only when its own generation was just
    /// added; an untagged one is tried against the added generations alone,
    /// newest first. Returns how many now decrypt.
    pub fn redecrypt_failed_messages(
        &mut self,
        feed_id: &str,
        added: &[u32],
        cipher: &dyn FeedCipher,
    ) -> usize {
        if added.is_empty() {
            return 0;
        }
        let Some(messages) = self.messages.get_mut(feed_id) else {
            return 0;
        };
        let state = self.key_states.entry(feed_id.to_string()).or_default();

        let mut recovered = 0;
        for message in messages.iter_mut().filter(|m| m.decryption_failed) {
            let outcome = match message.key_generation {
                Some(generation) if added.contains(&generation) => {
                    decrypt_group_message(cipher, state, message)
                }
                Some(_) => continue,
                None => {
                    let Ok(bytes) = message.ciphertext() else {
                        continue;
                    };
                    let fresh = state
                        .generations
                        .values()
                        .rev()
                        .filter(|g| added.contains(&g.key_generation));
                    open_with_first(cipher, fresh, &bytes)
                }
            };
            apply_outcome(message, state, outcome);
            if !message.decryption_failed {
                recovered += 1;
            }
        }
        if recovered > 0 {
            debug!(feed_id = %feed_id, recovered, "re-decrypted messages");
        }
        recovered
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::XChaChaCipher;

    fn generation(n: u32, key: [u8; 32], from: u64) -> GroupKeyGeneration {
        GroupKeyGeneration::new(n, key.to_vec(), from)
    }

    #[test]
    fn admitting_next_generation_closes_previous() {
        let mut state = GroupKeyState::default();
        state.merge(vec![generation(0, [0; 32], 10)], &[]);
        assert_eq!(state.generation(0).unwrap().valid_to_block, None);

        state.merge(vec![generation(1, [1; 32], 40)], &[]);
        assert_eq!(state.generation(0).unwrap().valid_to_block, Some(40));
        assert_eq!(state.generation(1).unwrap().valid_to_block, None);
        assert_eq!(state.current_key_generation, 1);
    }

    #[test]
    fn known_key_bytes_are_immutable() {
        let mut state = GroupKeyState::default();
        state.merge(vec![generation(0, [0; 32], 10)], &[]);

        let mut replacement = generation(0, [9; 32], 5);
        replacement.valid_to_block = Some(30);
        let report = state.merge(vec![replacement], &[]);

        assert_eq!(report.conflicts, vec![0]);
        let stored = state.generation(0).unwrap();
        assert_eq!(stored.key, vec![0; 32]);
        assert_eq!(stored.valid_from_block, 5);
        assert_eq!(stored.valid_to_block, Some(30));
    }

    #[test]
    fn missing_set_shrinks_when_key_arrives() {
        let mut state = GroupKeyState::default();
        state.merge(vec![generation(0, [0; 32], 1)], &[1, 2]);
        assert!(state.is_missing(1));
        assert!(state.is_missing(2));

        state.merge(vec![generation(2, [2; 32], 50)], &[]);
        assert!(state.is_missing(1));
        assert!(!state.is_missing(2));
        assert_eq!(state.current_key_generation, 2);
    }

    #[test]
    fn untagged_payload_tries_newest_first() {
        let cipher = XChaChaCipher;
        let old_key = XChaChaCipher::generate_key();
        let new_key = XChaChaCipher::generate_key();
        let mut state = GroupKeyState::default();
        state.merge(
            vec![generation(0, old_key, 1), generation(1, new_key, 20)],
            &[],
        );

        let sealed = cipher.encrypt(b"superseded", &old_key).unwrap();
        let outcome = decrypt_with_fallback(&cipher, &state, &sealed, None);
        assert_eq!(
            outcome,
            DecryptOutcome::Decrypted {
                plaintext: b"superseded".to_vec(),
                key_generation: 0
            }
        );
    }

    #[test]
    fn tagged_payload_distinguishes_missing_from_corrupt() {
        let cipher = XChaChaCipher;
        let key = XChaChaCipher::generate_key();
        let mut state = GroupKeyState::default();
        state.merge(vec![generation(0, key, 1)], &[]);

        let garbage = vec![0u8; 64];
        assert_eq!(
            decrypt_with_fallback(&cipher, &state, &garbage, Some(0)),
            DecryptOutcome::Failed { generation: Some(0) }
        );
        assert_eq!(
            decrypt_with_fallback(&cipher, &state, &garbage, Some(3)),
            DecryptOutcome::MissingKey { generation: 3 }
        );
    }

    /// Records every key it is asked to decrypt with.
    #[derive(Default)]
    struct RecordingCipher {
        tried: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    impl FeedCipher for RecordingCipher {
        fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> crate::Result<Vec<u8>> {
            self.tried.lock().unwrap().push(key.to_vec());
            XChaChaCipher.decrypt(ciphertext, key)
        }

        fn unwrap_key(&self, wrapped: &[u8], private_key: &[u8]) -> crate::Result<Vec<u8>> {
            XChaChaCipher.unwrap_key(wrapped, private_key)
        }
    }

    fn sealed_message(id: &str, payload: &[u8], generation: Option<u32>) -> Message {
        use base64::Engine;
        use chrono::{TimeZone, Utc};

        let mut message = Message::confirmed(id, "g1", "bob", 30, Utc.timestamp_opt(30, 0).unwrap());
        message.content_encrypted = Some(base64::engine::general_purpose::STANDARD.encode(payload));
        message.key_generation = generation;
        message.decryption_failed = true;
        message
    }

    #[test]
    fn redecrypt_only_tries_newly_added_keys() {
        let old_key = XChaChaCipher::generate_key();
        let new_key = XChaChaCipher::generate_key();
        let mut snap = Snapshot::default();
        snap.merge_key_generations("g1", vec![generation(0, old_key, 1)], &[1]);

        let corrupt = sealed_message("corrupt", &[0u8; 64], Some(0));
        let untagged = sealed_message(
            "untagged",
            &XChaChaCipher.encrypt(b"late key", &new_key).unwrap(),
            None,
        );
        snap.messages.insert("g1".into(), vec![corrupt, untagged]);

        let report = snap.merge_key_generations("g1", vec![generation(1, new_key, 20)], &[]);
        assert_eq!(report.added, vec![1]);

        let cipher = RecordingCipher::default();
        assert_eq!(snap.redecrypt_failed_messages("g1", &report.added, &cipher), 1);
        assert_eq!(*cipher.tried.lock().unwrap(), vec![new_key.to_vec()]);

        let messages = snap.messages("g1");
        assert!(messages[0].decryption_failed);
        assert_eq!(messages[1].content.as_deref(), Some("late key"));
        assert_eq!(messages[1].key_generation, Some(1));

        // Nothing new, nothing retried
        assert_eq!(snap.redecrypt_failed_messages("g1", &[], &cipher), 0);
        assert_eq!(cipher.tried.lock().unwrap().len(), 1);
    }

    #[test]
    fn key_state_serializes_keys_as_base64() {
        let mut state = GroupKeyState::default();
        state.merge(vec![generation(0, [7; 32], 1)], &[4]);

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("BwcH"));
        let back: GroupKeyState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
