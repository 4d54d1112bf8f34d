//! Replay seeds for sampled decisions.
//!
//! A sampled decision must be reproducible from its log row alone. The RNG seed is
//! therefore derived from a caller seed plus the decision key of the selection
//! ([`decision_key`]) rather than taken from process state.
//!
//! Not cryptographic.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Key identifying one selection: `"{learner_id}:{task_ordinal}"`.
///
/// Persist it next to the decision; together with the seed it replays the draw.
#[must_use]
pub fn decision_key(learner_id: &str, task_ordinal: u64) -> String {
    format!("{}:{task_ordinal}", learner_id.trim())
}

/// Derive the RNG seed for `(seed, decision_key)`.
///
/// The seed's little-endian bytes and then the key bytes go through FNV-1a; a SplitMix64
/// finalizer spreads the result. Stable across platforms and releases.
#[must_use]
pub fn replay_seed(seed: u64, decision_key: &str) -> u64 {
    let h = seed
        .to_le_bytes()
        .iter()
        .chain(decision_key.as_bytes())
        .fold(FNV_OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME));
    splitmix64(h)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
