use std::{
  hash::{BuildHasher, Hasher, RandomState},
  time::{SystemTime, UNIX_EPOCH},
};

/// Seed taken from the randomized keys of the standard hasher, folded with the current time
/// when the clock is available.
#[inline]
pub fn std_seed() -> u64 {
  let mut seed = RandomState::new().build_hasher().finish();
  if let Ok(elapsed) = SystemTime::now().duration_since(UNIX_EPOCH) {
    let nanos = elapsed.as_nanos();
    #[allow(clippy::cast_possible_truncation, reason = "both halves are folded")]
    let (hi, lo) = ((nanos >> 64) as u64, nanos as u64);
    seed = fold(fold(seed, hi), lo);
  }
  seed
}

// 128-bit multiplication whose halves are xored.
fn fold(seed: u64, n: u64) -> u64 {
  const FIXED: u64 = 0x9E37_79B9_7F4A_7C15;
  let product = u128::from(seed ^ n).wrapping_mul(u128::from(FIXED));
  #[allow(clippy::cast_possible_truncation, reason = "both halves are used")]
  let rslt = (product >> 64) as u64 ^ product as u64;
  rslt
}

#[cfg(test)]
mod tests {
  use crate::rng::std_seed;

  #[test]
  fn seeds_differ_between_calls() {
    assert_ne!(std_seed(), std_seed());
  }
}
