use hush_core::{decrypt_with_fallback, DecryptOutcome, GroupKeyGeneration, GroupKeyState, XChaChaCipher};
use proptest::prelude::*;

fn arb_generation() -> impl Strategy<Value = GroupKeyGeneration> {
    (0u32..8, proptest::collection::vec(any::<u8>(), 32..=32), 0u64..1_000)
        .prop_map(|(n, key, from)| GroupKeyGeneration::new(n, key, from))
}

proptest! {
    // --- Key immutability ---

    #[test]
    fn first_learned_key_bytes_survive(batches in proptest::collection::vec(proptest::collection::vec(arb_generation(), 0..6), 1..6)) {
        let mut state = GroupKeyState::default();
        let mut first_seen = std::collections::BTreeMap::new();
        for batch in batches {
            for g in &batch {
                first_seen.entry(g.key_generation).or_insert_with(|| g.key.clone());
            }
            state.merge(batch, &[]);
        }
        for (n, key) in &first_seen {
            prop_assert_eq!(&state.generation(*n).unwrap().key, key);
        }
    }

    #[test]
    fn current_generation_is_max_known(batch in proptest::collection::vec(arb_generation(), 1..10)) {
        let mut state = GroupKeyState::default();
        let max = batch.iter().map(|g| g.key_generation).max().unwrap();
        state.merge(batch, &[]);
        prop_assert_eq!(state.current_key_generation, max);
    }

    #[test]
    fn known_generations_are_never_missing(
        batch in proptest::collection::vec(arb_generation(), 0..10),
        missing in proptest::collection::vec(0u32..8, 0..8),
    ) {
        let mut state = GroupKeyState::default();
        state.merge(batch, &missing);
        for n in state.missing_generations() {
            prop_assert!(state.generation(*n).is_none());
        }
        for n in &missing {
            prop_assert!(state.generation(*n).is_some() || state.is_missing(*n));
        }
    }

    #[test]
    fn predecessor_closed_when_successor_known(batch in proptest::collection::vec(arb_generation(), 0..10)) {
        let mut state = GroupKeyState::default();
        state.merge(batch, &[]);
        for g in state.generations() {
            if state.generation(g.key_generation + 1).is_some() {
                prop_assert!(g.valid_to_block.is_some());
            }
        }
    }

    // --- Fallback decryption ---

    #[test]
    fn fallback_finds_the_sealing_generation(count in 1u32..6, pick in 0u32..6, payload in proptest::collection::vec(any::<u8>(), 0..256)) {
        let pick = pick % count;
        let cipher = XChaChaCipher;
        let keys: Vec<[u8; 32]> = (0..count).map(|_| XChaChaCipher::generate_key()).collect();
        let mut state = GroupKeyState::default();
        state.merge(
            keys.iter().enumerate().map(|(i, k)| GroupKeyGeneration::new(i as u32, k.to_vec(), i as u64 * 10)),
            &[],
        );

        let sealed = cipher.encrypt(&payload, &keys[pick as usize]).unwrap();
        let outcome = decrypt_with_fallback(&cipher, &state, &sealed, None);
        prop_assert_eq!(outcome, DecryptOutcome::Decrypted { plaintext: payload, key_generation: pick });
    }

    #[test]
    fn garbage_never_decrypts(garbage in proptest::collection::vec(any::<u8>(), 0..128), tag in proptest::option::of(0u32..4)) {
        let cipher = XChaChaCipher;
        let mut state = GroupKeyState::default();
        state.merge(vec![GroupKeyGeneration::new(0, XChaChaCipher::generate_key().to_vec(), 0)], &[]);

        let outcome = decrypt_with_fallback(&cipher, &state, &garbage, tag);
        let is_decrypted = matches!(outcome, DecryptOutcome::Decrypted { .. });
        prop_assert!(!is_decrypted);
    }
}
