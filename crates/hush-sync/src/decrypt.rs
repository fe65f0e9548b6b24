//! Decryption routing for a batch of ledger messages.
//!
//! Personal and direct feeds use the feed key unwrapped from
//! `encrypted_feed_key`; group feeds go through the key ledger; broadcast
//! content arrives in the clear. Every message of a batch is decrypted
//! against the same snapshot and the results are committed together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::future::join_all;
use hush_core::keys::decrypt_group_message;
use hush_core::{
    DecryptOutcome, Feed, FeedCipher, FeedId, FeedType, GroupKeyState, Message, ReactionTally,
    Snapshot, TallyDecryptor,
};
use hush_ledger::ReactionTallyRecord;
use tracing::{debug, warn};

/// Decrypted messages plus the key bookkeeping they produced.
#[derive(Debug, Default)]
pub(crate) struct DecryptedBatch {
    pub messages: BTreeMap<FeedId, Vec<Message>>,
    /// Feed keys unwrapped while decrypting, to cache on the feed
    pub feed_keys: BTreeMap<FeedId, Vec<u8>>,
    /// Group generations referenced but not held
    pub missing: BTreeMap<FeedId, BTreeSet<u32>>,
}

impl DecryptedBatch {
    /// Cache unwrapped feed keys and record missing generations.
    pub fn apply_keys(&self, snapshot: &mut Snapshot) {
        for (feed_id, key) in &self.feed_keys {
            if let Some(feed) = snapshot.feeds.get_mut(feed_id) {
                feed.aes_key = Some(key.clone());
            }
        }
        for (feed_id, generations) in &self.missing {
            let state = snapshot.key_states.entry(feed_id.clone()).or_default();
            for generation in generations {
                state.record_missing(*generation);
            }
        }
    }

    pub fn failed_count(&self) -> usize {
        self.messages
            .values()
            .flatten()
            .filter(|m| m.decryption_failed)
            .count()
    }
}

/// Unwrap a feed's base64 `encrypted_feed_key` with the identity key.
pub(crate) fn unwrap_feed_key(
    cipher: &dyn FeedCipher,
    feed: &Feed,
    private_key: &[u8],
) -> hush_core::Result<Vec<u8>> {
    let encoded = feed
        .encrypted_feed_key
        .as_deref()
        .ok_or_else(|| hush_core::Error::KeyUnwrap(format!("feed {} has no wrapped key", feed.id)))?;
    let wrapped = STANDARD
        .decode(encoded)
        .map_err(|e| hush_core::Error::Deserialization(e.to_string()))?;
    cipher.unwrap_key(&wrapped, private_key)
}

/// Decrypt `messages` against `snapshot`. Messages for unknown feeds are dropped.
pub(crate) async fn decrypt_batch(
    snapshot: &Snapshot,
    cipher: &Arc<dyn FeedCipher>,
    private_key: &[u8],
    messages: Vec<Message>,
) -> DecryptedBatch {
    let mut by_feed: BTreeMap<FeedId, Vec<Message>> = BTreeMap::new();
    for message in messages {
        by_feed.entry(message.feed_id.clone()).or_default().push(message);
    }

    let mut batch = DecryptedBatch::default();
    for (feed_id, messages) in by_feed {
        let Some(feed) = snapshot.feed(&feed_id) else {
            debug!(feed_id = %feed_id, count = messages.len(), "dropping messages for unknown feed");
            continue;
        };

        let decrypted = match feed.feed_type {
            FeedType::Personal | FeedType::Direct => {
                let key = match &feed.aes_key {
                    Some(key) => Some(key.clone()),
                    None => match unwrap_feed_key(cipher.as_ref(), feed, private_key) {
                        Ok(key) => {
                            batch.feed_keys.insert(feed_id.clone(), key.clone());
                            Some(key)
                        }
                        Err(e) => {
                            warn!(feed_id = %feed_id, error = %e, "could not unwrap feed key");
                            None
                        }
                    },
                };
                decrypt_with_feed_key(cipher, key.as_deref(), messages).await
            }
            FeedType::Group => {
                let state = snapshot.key_states.get(&feed_id).cloned().unwrap_or_default();
                let (decrypted, missing) = decrypt_with_key_ledger(cipher, &state, messages).await;
                if !missing.is_empty() {
                    debug!(feed_id = %feed_id, missing = ?missing, "messages reference unknown key generations");
                    batch.missing.insert(feed_id.clone(), missing);
                }
                decrypted
            }
            FeedType::Broadcast => messages,
        };
        batch.messages.insert(feed_id, decrypted);
    }
    batch
}

async fn decrypt_with_feed_key(
    cipher: &Arc<dyn FeedCipher>,
    key: Option<&[u8]>,
    messages: Vec<Message>,
) -> Vec<Message> {
    join_all(messages.into_iter().map(|mut message| async move {
        if message.content.is_some() && message.content_encrypted.is_none() {
            return message;
        }
        let plaintext = key
            .ok_or_else(|| hush_core::Error::KeyUnwrap("no feed key".into()))
            .and_then(|key| cipher.decrypt(&message.ciphertext()?, key));
        match plaintext {
            Ok(plaintext) => {
                message.set_plaintext(plaintext);
            }
            Err(_) => message.decryption_failed = true,
        }
        message
    }))
    .await
}

async fn decrypt_with_key_ledger(
    cipher: &Arc<dyn FeedCipher>,
    state: &GroupKeyState,
    messages: Vec<Message>,
) -> (Vec<Message>, BTreeSet<u32>) {
    let results = join_all(messages.into_iter().map(|message| async move {
        let outcome = decrypt_group_message(cipher.as_ref(), state, &message);
        (message, outcome)
    }))
    .await;

    let mut scratch = state.clone();
    let mut missing = BTreeSet::new();
    let messages = results
        .into_iter()
        .map(|(mut message, outcome)| {
            if let DecryptOutcome::MissingKey { generation } = outcome {
                missing.insert(generation);
            }
            hush_core::keys::apply_outcome(&mut message, &mut scratch, outcome);
            message
        })
        .collect();
    (messages, missing)
}

/// Symmetric key used for a feed's reaction tallies.
fn tally_key(snapshot: &Snapshot, batch: &DecryptedBatch, feed_id: &str) -> Option<Vec<u8>> {
    let feed = snapshot.feed(feed_id)?;
    match feed.feed_type {
        FeedType::Personal | FeedType::Direct => batch
            .feed_keys
            .get(feed_id)
            .cloned()
            .or_else(|| feed.aes_key.clone()),
        FeedType::Group => {
            let state = snapshot.key_states.get(feed_id)?;
            state
                .generation(state.current_key_generation)
                .map(|g| g.key.clone())
        }
        FeedType::Broadcast => None,
    }
}

/// Decrypt reaction tallies; undecryptable ones are skipped.
pub(crate) fn decrypt_tallies(
    snapshot: &Snapshot,
    batch: &DecryptedBatch,
    decryptor: &dyn TallyDecryptor,
    records: Vec<ReactionTallyRecord>,
) -> Vec<ReactionTally> {
    records
        .into_iter()
        .filter_map(|record| {
            let Some(key) = tally_key(snapshot, batch, &record.feed_id) else {
                debug!(message_id = %record.message_id, "no key for reaction tally");
                return None;
            };
            match decryptor.decrypt_tally(&record.c1, &record.c2, &key) {
                Ok(counts) => Some(ReactionTally {
                    message_id: record.message_id,
                    feed_id: record.feed_id,
                    tally_version: record.tally_version,
                    counts,
                }),
                Err(e) => {
                    warn!(message_id = %record.message_id, error = %e, "reaction tally decryption failed");
                    None
                }
            }
        })
        .collect()
}
