//! Scores of the connection strings that are shared by several programs.

/// Converts the weights of the connections of a program into shares of their sum.
///
/// Every weight is expected to be positive.
#[inline]
pub fn weight_shares(weights: &[(String, f64)]) -> Vec<(String, f64)> {
  let sum: f64 = weights.iter().map(|el| el.1).sum();
  weights.iter().map(|(connection, weight)| (connection.clone(), weight / sum)).collect()
}

/// Blends the shares that each program assigns to the same connection strings.
///
/// The score of a connection is the product, over the distinct share values `v` that programs
/// assign to it, of `v^(count(v) / programs)`. Returned scores follow the order of the first
/// program and connections that some program doesn't know are omitted.
///
/// ```rust
/// use sqlprog::batch::blend_scores;
/// let scores = blend_scores(&[vec![("a".into(), 0.5)], vec![("a".into(), 0.5)]]);
/// assert_eq!(scores, [("a".to_owned(), 0.5)]);
/// ```
#[inline]
pub fn blend_scores(shares: &[Vec<(String, f64)>]) -> Vec<(String, f64)> {
  let Some(first) = shares.first() else {
    return Vec::new();
  };
  let programs = to_f64(shares.len());
  let mut groups: Vec<(f64, usize)> = Vec::new();
  let mut rslt = Vec::with_capacity(first.len());
  'connections: for (connection, _) in first {
    groups.clear();
    for program in shares {
      let Some((_, share)) = program.iter().find(|el| &el.0 == connection) else {
        continue 'connections;
      };
      match groups.iter_mut().find(|el| el.0.to_bits() == share.to_bits()) {
        Some(group) => group.1 = group.1.wrapping_add(1),
        None => groups.push((*share, 1)),
      }
    }
    let score = groups
      .iter()
      .fold(1.0, |acc, (share, count)| acc * share.powf(to_f64(*count) / programs));
    rslt.push((connection.clone(), score));
  }
  rslt
}

fn to_f64(value: usize) -> f64 {
  f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
  use crate::batch::{blend_scores, weight_shares};

  fn close(lhs: f64, rhs: f64) -> bool {
    (lhs - rhs).abs() < 1e-9
  }

  #[test]
  fn shares_are_fractions_of_the_sum() {
    let shares = weight_shares(&[("b".into(), 1.0), ("c".into(), 3.0)]);
    assert_eq!(shares, [("b".to_owned(), 0.25), ("c".to_owned(), 0.75)]);
  }

  #[test]
  fn distinct_shares_are_blended_geometrically() {
    let scores = blend_scores(&[
      weight_shares(&[("b".into(), 1.0), ("c".into(), 3.0)]),
      weight_shares(&[("c".into(), 1.0), ("b".into(), 1.0)]),
    ]);
    assert_eq!(scores.len(), 2);
    assert_eq!(scores[0].0, "b");
    assert!(close(scores[0].1, (0.25f64 * 0.5).sqrt()));
    assert_eq!(scores[1].0, "c");
    assert!(close(scores[1].1, (0.75f64 * 0.5).sqrt()));
  }

  #[test]
  fn equal_shares_are_counted_once() {
    let shares = vec![("b".to_owned(), 0.2), ("c".to_owned(), 0.8)];
    let scores = blend_scores(&[shares.clone(), shares.clone(), shares]);
    assert!(close(scores[0].1, 0.2));
    assert!(close(scores[1].1, 0.8));
  }

  #[test]
  fn unknown_connections_are_omitted() {
    let scores = blend_scores(&[
      vec![("a".into(), 0.5), ("b".into(), 0.5)],
      vec![("b".into(), 1.0)],
    ]);
    assert_eq!(scores, [("b".to_owned(), 0.5f64.powf(0.5))]);
    assert!(blend_scores(&[]).is_empty());
  }
}
