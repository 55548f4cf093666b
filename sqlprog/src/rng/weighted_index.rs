use crate::rng::Rng;

/// Allows the random selection of an element in a list where each element has a proportional
/// chance of being selected based on its assigned weight.
///
/// Elements with zero weight are never picked.
#[derive(Clone, Debug, Default)]
pub struct WeightedIndex {
  cumulative: Vec<f64>,
  sum: f64,
}

impl WeightedIndex {
  /// Creates a new instance with the given weights. Negative or non-finite weights are
  /// rejected.
  #[inline]
  pub fn new(weights: impl IntoIterator<Item = f64>) -> crate::Result<Self> {
    let mut cumulative = Vec::new();
    let mut sum = 0.0f64;
    for elem in weights {
      if !elem.is_finite() || elem < 0.0 {
        return Err(crate::Error::InvalidWeight);
      }
      sum += elem;
      if !sum.is_finite() {
        return Err(crate::Error::OutOfBoundsArithmetic);
      }
      cumulative.push(sum);
    }
    Ok(Self { cumulative, sum })
  }

  /// Number of weights, including zeroed ones.
  #[inline]
  pub fn len(&self) -> usize {
    self.cumulative.len()
  }

  /// If there are no weights.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.cumulative.is_empty()
  }

  /// Picks a random weighted index. Returns `None` if there are no elements or if all weights
  /// are zero.
  #[inline]
  pub fn pick<R>(&self, rng: &mut R) -> Option<usize>
  where
    R: Rng,
  {
    if self.sum <= 0.0 {
      return None;
    }
    let random = rng.f64_unit() * self.sum;
    let idx = self.cumulative.partition_point(|el| *el <= random);
    if idx < self.cumulative.len() {
      return Some(idx);
    }
    // Rounding can push `random` to the total. The last element with a positive weight is
    // the one that owns the end of the interval.
    let mut prev = None;
    let mut rslt = None;
    for (local_idx, elem) in self.cumulative.iter().enumerate() {
      if prev.map_or(*elem > 0.0, |prev_elem| *elem > prev_elem) {
        rslt = Some(local_idx);
      }
      prev = Some(*elem);
    }
    rslt
  }
}

/// Picks one element of `items` with a probability proportional to `weight`. Non-positive or
/// non-finite weights are treated as zero.
#[inline]
pub fn choose_weighted<'items, R, T>(
  items: &'items [T],
  weight: impl Fn(&T) -> f64,
  rng: &mut R,
) -> Option<&'items T>
where
  R: Rng,
{
  let weights = items.iter().map(|elem| {
    let local = weight(elem);
    if local.is_finite() && local > 0.0 {
      local
    } else {
      0.0
    }
  });
  let weighted_index = WeightedIndex::new(weights).ok()?;
  items.get(weighted_index.pick(rng)?)
}

#[cfg(test)]
mod tests {
  use crate::{
    rng::{choose_weighted, WeightedIndex, Xorshift64},
    Error,
  };

  #[test]
  fn pick() {
    let mut rng = Xorshift64::from(42);
    let weighted_index = WeightedIndex::new([6.0, 2.0, 12.0]).unwrap();
    assert_eq!(weighted_index.cumulative, &[6.0, 8.0, 20.0]);
    let mut indices = [0, 0, 0];
    for _ in 0..10000 {
      let idx = weighted_index.pick(&mut rng).unwrap();
      indices[idx] += 1;
    }
    assert!(indices[0] > indices[1]);
    assert!(indices[2] > indices[0] && indices[2] > indices[1]);
  }

  #[test]
  fn zero_weights_are_never_picked() {
    let mut rng = Xorshift64::from(3);
    let weighted_index = WeightedIndex::new([0.0, 1.0, 0.0, 3.0, 0.0]).unwrap();
    for _ in 0..10000 {
      let idx = weighted_index.pick(&mut rng).unwrap();
      assert!(idx == 1 || idx == 3);
    }
  }

  #[test]
  fn all_zero_weights_pick_nothing() {
    let mut rng = Xorshift64::from(3);
    assert_eq!(WeightedIndex::new([0.0, 0.0]).unwrap().pick(&mut rng), None);
    assert_eq!(WeightedIndex::new([]).unwrap().pick(&mut rng), None);
  }

  #[test]
  fn invalid_weights_are_rejected() {
    assert!(matches!(WeightedIndex::new([1.0, -1.0]), Err(Error::InvalidWeight)));
    assert!(matches!(WeightedIndex::new([f64::NAN]), Err(Error::InvalidWeight)));
  }

  #[test]
  fn choose_ignores_non_positive_weights() {
    let mut rng = Xorshift64::from(11);
    let items = [("a", -1.0), ("b", 0.0), ("c", 2.0)];
    for _ in 0..100 {
      assert_eq!(choose_weighted(&items, |el| el.1, &mut rng).unwrap().0, "c");
    }
  }
}
