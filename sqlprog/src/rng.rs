//! Random Number Generators
//!
//! Load balancing only needs statistically reasonable numbers, not cryptographic ones, so the
//! default generator is a seedable [`Xorshift64`]. Tests can inject a fixed seed to obtain
//! deterministic selections.

mod seed;
mod weighted_index;
mod xorshift;

pub use seed::std_seed;
pub use weighted_index::{choose_weighted, WeightedIndex};
pub use xorshift::Xorshift64;

/// Abstraction tailored for the needs of this project. Each implementation should manage how
/// seeds are retrieved as well as how numbers are generated.
pub trait Rng {
  /// Creates an array of 4 bytes.
  fn u8_4(&mut self) -> [u8; 4];

  /// Creates an array of 8 bytes.
  fn u8_8(&mut self) -> [u8; 8];

  /// Uniformly distributed number in the `[0, 1)` interval.
  #[inline]
  fn f64_unit(&mut self) -> f64 {
    const SCALE: f64 = 1.0 / (1u64 << 53) as f64;
    let n = u64::from_be_bytes(self.u8_8()) >> 11;
    #[allow(clippy::cast_precision_loss, reason = "53 bits always fit")]
    let rslt = n as f64 * SCALE;
    rslt
  }
}

impl<T> Rng for &mut T
where
  T: Rng,
{
  #[inline]
  fn u8_4(&mut self) -> [u8; 4] {
    (*self).u8_4()
  }

  #[inline]
  fn u8_8(&mut self) -> [u8; 8] {
    (*self).u8_8()
  }
}

#[cfg(feature = "rand")]
mod rand {
  use crate::rng::Rng;
  use rand::Rng as _;

  macro_rules! implement {
    ($struct:ty) => {
      impl Rng for $struct {
        #[inline]
        fn u8_4(&mut self) -> [u8; 4] {
          self.gen()
        }

        #[inline]
        fn u8_8(&mut self) -> [u8; 8] {
          self.gen()
        }
      }
    };
  }

  implement!(rand::rngs::mock::StepRng);
  implement!(rand::rngs::SmallRng);
}
