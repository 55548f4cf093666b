use crate::rng::Rng;

/// Xorshift that deals with 64 bits numbers.
///
/// This structure is `Copy` to allow cheap snapshots in concurrent scenarios.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Xorshift64 {
  value: u64,
}

impl Xorshift64 {
  /// Constructor. A zero seed would only produce zeros, as such, it is replaced by a fixed
  /// non-zero value.
  #[inline]
  pub const fn new(value: u64) -> Self {
    Self { value: if value == 0 { 0x9E37_79B9_7F4A_7C15 } else { value } }
  }
}

impl Rng for Xorshift64 {
  #[inline]
  fn u8_4(&mut self) -> [u8; 4] {
    let [a, b, c, d, ..] = xor_u64(&mut self.value).to_be_bytes();
    [a, b, c, d]
  }

  #[inline]
  fn u8_8(&mut self) -> [u8; 8] {
    xor_u64(&mut self.value).to_be_bytes()
  }
}

impl From<u64> for Xorshift64 {
  #[inline]
  fn from(value: u64) -> Self {
    Self::new(value)
  }
}

fn xor_u64(seed: &mut u64) -> u64 {
  *seed ^= *seed << 13;
  *seed ^= *seed >> 7;
  *seed ^= *seed << 17;
  *seed
}
