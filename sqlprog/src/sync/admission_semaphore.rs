use crate::misc::{until, Interruption};
use core::{
  cmp::Ordering,
  fmt::{Debug, Formatter},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
  sync::{OwnedSemaphorePermit, Semaphore},
  time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Errors of [`AdmissionSemaphore`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SemaphoreError {
  /// The acquisition was cancelled before a slot was granted.
  Cancelled,
  /// The underlying semaphore can no longer grant slots.
  Closed,
  /// The deadline elapsed before a slot was granted.
  TimedOut,
}

impl From<Interruption> for SemaphoreError {
  #[inline]
  fn from(from: Interruption) -> Self {
    match from {
      Interruption::Cancelled => Self::Cancelled,
      Interruption::TimedOut => Self::TimedOut,
    }
  }
}

#[derive(Debug)]
struct Capacity {
  // Number of granted permits that must be forgotten instead of returned.
  debt: usize,
  max: usize,
}

/// Counting semaphore whose maximum number of concurrent admissions can be modified at
/// runtime.
///
/// Waiters are served in FIFO order. Growing the cap admits queued waiters right away while
/// shrinking it never revokes granted admissions: the excess is paid back by future releases.
pub struct AdmissionSemaphore {
  capacity: Mutex<Capacity>,
  inner: Arc<Semaphore>,
}

impl AdmissionSemaphore {
  /// Cap that represents the absence of limits.
  pub const UNBOUNDED: usize = Semaphore::MAX_PERMITS;

  /// Creates a new instance with a maximum amount of `max` concurrent admissions.
  ///
  /// `max` is clamped to `1..=UNBOUNDED`.
  #[inline]
  pub fn new(max: usize) -> Self {
    let max = clamp(max);
    Self { capacity: Mutex::new(Capacity { debt: 0, max }), inner: Arc::new(Semaphore::new(max)) }
  }

  /// Instance that admits everything.
  #[inline]
  pub fn unbounded() -> Self {
    Self::new(Self::UNBOUNDED)
  }

  /// Waits until a slot is available, `deadline` elapses or `cancel` fires. Nothing is
  /// granted in the latter two cases.
  #[inline]
  pub async fn acquire(
    self: &Arc<Self>,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<AdmissionPermit> {
    let future = Arc::clone(&self.inner).acquire_owned();
    let permit = until(future, deadline, cancel)
      .await
      .map_err(SemaphoreError::from)?
      .map_err(|_err| SemaphoreError::Closed)?;
    Ok(AdmissionPermit { permit: Some(permit), semaphore: Arc::clone(self) })
  }

  /// Number of slots that can be granted without waiting.
  #[inline]
  pub fn available(&self) -> usize {
    self.inner.available_permits()
  }

  /// If the current cap is [`Self::UNBOUNDED`].
  #[inline]
  pub fn is_unbounded(&self) -> bool {
    self.max_count() == Self::UNBOUNDED
  }

  /// The current cap.
  #[inline]
  pub fn max_count(&self) -> usize {
    self.capacity.lock().max
  }

  /// Modifies the cap. `max` is clamped to `1..=UNBOUNDED`.
  #[inline]
  pub fn set_max_count(&self, max: usize) {
    let max = clamp(max);
    let mut capacity = self.capacity.lock();
    let Capacity { debt, max: prev } = &mut *capacity;
    match max.cmp(prev) {
      Ordering::Equal => return,
      Ordering::Greater => {
        let mut diff = max.wrapping_sub(*prev);
        let paid = diff.min(*debt);
        *debt = debt.wrapping_sub(paid);
        diff = diff.wrapping_sub(paid);
        if diff > 0 {
          self.inner.add_permits(diff);
        }
      }
      Ordering::Less => {
        let diff = prev.wrapping_sub(max);
        let forgotten = self.inner.forget_permits(diff);
        *debt = debt.saturating_add(diff.wrapping_sub(forgotten));
      }
    }
    _debug!(prev = *prev, max, debt = *debt, "Admission cap modified");
    *prev = max;
  }

  fn release(&self, permit: OwnedSemaphorePermit) {
    let mut capacity = self.capacity.lock();
    if capacity.debt > 0 {
      capacity.debt = capacity.debt.wrapping_sub(1);
      permit.forget();
    } else {
      drop(permit);
    }
  }
}

impl Debug for AdmissionSemaphore {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    let capacity = self.capacity.lock();
    f.debug_struct("AdmissionSemaphore")
      .field("available", &self.inner.available_permits())
      .field("debt", &capacity.debt)
      .field("max", &capacity.max)
      .finish()
  }
}

impl Default for AdmissionSemaphore {
  #[inline]
  fn default() -> Self {
    Self::unbounded()
  }
}

/// A granted admission. The slot is returned when this structure is dropped.
#[clippy::has_significant_drop]
#[derive(Debug)]
pub struct AdmissionPermit {
  permit: Option<OwnedSemaphorePermit>,
  semaphore: Arc<AdmissionSemaphore>,
}

impl AdmissionPermit {
  /// The semaphore that granted this admission.
  #[inline]
  pub fn semaphore(&self) -> &Arc<AdmissionSemaphore> {
    &self.semaphore
  }
}

impl Drop for AdmissionPermit {
  #[inline]
  fn drop(&mut self) {
    if let Some(permit) = self.permit.take() {
      self.semaphore.release(permit);
    }
  }
}

/// Set of admissions acquired by [`acquire_all`]. Permits are returned in the reverse order of
/// acquisition, exactly once, either through [`AdmissionScope::release`] or when dropped.
#[clippy::has_significant_drop]
#[derive(Debug, Default)]
pub struct AdmissionScope {
  permits: Vec<AdmissionPermit>,
}

impl AdmissionScope {
  /// If nothing was acquired, i.e., every semaphore of the chain was absent.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.permits.is_empty()
  }

  /// Number of held admissions.
  #[inline]
  pub fn len(&self) -> usize {
    self.permits.len()
  }

  /// Returns every held admission. Subsequent calls are no-ops.
  #[inline]
  pub fn release(&mut self) {
    while let Some(permit) = self.permits.pop() {
      drop(permit);
    }
  }
}

impl Drop for AdmissionScope {
  #[inline]
  fn drop(&mut self) {
    self.release();
  }
}

/// Acquires `semaphores` one at a time in the given order. Absent elements impose no limit.
///
/// If an acquisition fails, everything that was already acquired is released in reverse order
/// before the error is returned.
///
/// The order of `semaphores` must be the same for every caller that shares semaphores,
/// otherwise concurrent acquisitions can wait on each other forever. Executions follow the
/// order connection, load-balanced connection, database and program.
#[inline]
pub async fn acquire_all(
  semaphores: &[Option<Arc<AdmissionSemaphore>>],
  deadline: Option<Instant>,
  cancel: Option<&CancellationToken>,
) -> crate::Result<AdmissionScope> {
  let mut scope = AdmissionScope { permits: Vec::with_capacity(semaphores.len()) };
  for semaphore in semaphores.iter().flatten() {
    scope.permits.push(semaphore.acquire(deadline, cancel).await?);
  }
  Ok(scope)
}

fn clamp(max: usize) -> usize {
  max.clamp(1, AdmissionSemaphore::UNBOUNDED)
}

#[cfg(feature = "_proptest")]
#[cfg(test)]
mod _proptest {
  use crate::sync::AdmissionSemaphore;
  use std::{sync::Arc, vec::Vec};

  #[test_strategy::proptest]
  fn cap_is_never_exceeded(#[strategy(proptest::collection::vec(0u8..3, 1..64))] ops: Vec<u8>) {
    let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
    rt.block_on(async {
      let semaphore = Arc::new(AdmissionSemaphore::new(2));
      let mut cap = 2;
      let mut permits = Vec::new();
      for (idx, op) in ops.into_iter().enumerate() {
        match op {
          0 => {
            if let Some(Ok(permit)) =
              futures::FutureExt::now_or_never(semaphore.acquire(None, None))
            {
              assert!(permits.len() < cap);
              permits.push(permit);
            }
          }
          1 => drop(permits.pop()),
          _ => {
            cap = idx % 4 + 1;
            semaphore.set_max_count(cap);
          }
        }
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    sync::{acquire_all, AdmissionSemaphore, SemaphoreError},
    Error,
  };
  use core::time::Duration;
  use futures::FutureExt;
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };
  use tokio::time::Instant;
  use tokio_util::sync::CancellationToken;

  fn soon() -> Option<Instant> {
    Some(Instant::now() + Duration::from_millis(20))
  }

  #[tokio::test]
  async fn acquisitions_are_limited_by_the_cap() {
    let semaphore = Arc::new(AdmissionSemaphore::new(2));
    let _first = semaphore.acquire(None, None).await.unwrap();
    let _second = semaphore.acquire(None, None).await.unwrap();
    assert!(matches!(
      semaphore.acquire(soon(), None).await,
      Err(Error::SemaphoreError(SemaphoreError::TimedOut))
    ));
    assert_eq!(semaphore.available(), 0);
  }

  #[tokio::test]
  async fn cancelled_acquisition_grants_nothing() {
    let semaphore = Arc::new(AdmissionSemaphore::new(1));
    let held = semaphore.acquire(None, None).await.unwrap();
    let token = CancellationToken::new();
    token.cancel();
    assert!(matches!(
      semaphore.acquire(None, Some(&token)).await,
      Err(Error::SemaphoreError(SemaphoreError::Cancelled))
    ));
    drop(held);
    assert_eq!(semaphore.available(), 1);
  }

  #[tokio::test]
  async fn growing_admits_queued_waiters() {
    let semaphore = Arc::new(AdmissionSemaphore::new(1));
    let _held = semaphore.acquire(None, None).await.unwrap();
    let waiter = tokio::spawn({
      let local = Arc::clone(&semaphore);
      async move { local.acquire(None, None).await.map(drop) }
    });
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());
    semaphore.set_max_count(2);
    tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
  }

  #[tokio::test]
  async fn shrinking_does_not_revoke_granted_admissions() {
    let semaphore = Arc::new(AdmissionSemaphore::new(3));
    let first = semaphore.acquire(None, None).await.unwrap();
    let second = semaphore.acquire(None, None).await.unwrap();
    let third = semaphore.acquire(None, None).await.unwrap();
    semaphore.set_max_count(1);
    assert_eq!((semaphore.max_count(), semaphore.available()), (1, 0));
    drop(first);
    assert_eq!(semaphore.available(), 0);
    drop(second);
    assert_eq!(semaphore.available(), 0);
    drop(third);
    assert_eq!(semaphore.available(), 1);
  }

  #[tokio::test]
  async fn growing_after_shrinking_pays_debt_first() {
    let semaphore = Arc::new(AdmissionSemaphore::new(2));
    let first = semaphore.acquire(None, None).await.unwrap();
    let second = semaphore.acquire(None, None).await.unwrap();
    semaphore.set_max_count(1);
    semaphore.set_max_count(3);
    assert_eq!(semaphore.available(), 1);
    drop(first);
    drop(second);
    assert_eq!(semaphore.available(), 3);
  }

  #[tokio::test]
  async fn unbounded_admits_everything() {
    let semaphore = Arc::new(AdmissionSemaphore::unbounded());
    let mut permits = Vec::new();
    for _ in 0..100 {
      permits.push(semaphore.acquire(None, None).now_or_never().unwrap().unwrap());
    }
    assert!(semaphore.is_unbounded());
  }

  #[tokio::test]
  async fn chain_failure_releases_acquired_elements() {
    let first = Arc::new(AdmissionSemaphore::new(1));
    let second = Arc::new(AdmissionSemaphore::new(1));
    let _held = second.acquire(None, None).await.unwrap();
    let chain = [Some(Arc::clone(&first)), None, Some(Arc::clone(&second))];
    assert!(acquire_all(&chain, soon(), None).await.is_err());
    assert_eq!(first.available(), 1);
  }

  #[tokio::test]
  async fn scope_releases_everything_once() {
    let first = Arc::new(AdmissionSemaphore::new(1));
    let second = Arc::new(AdmissionSemaphore::new(1));
    let chain = [Some(Arc::clone(&first)), Some(Arc::clone(&second))];
    let mut scope = acquire_all(&chain, None, None).await.unwrap();
    assert_eq!((scope.len(), first.available(), second.available()), (2, 0, 0));
    scope.release();
    scope.release();
    drop(scope);
    assert_eq!((first.available(), second.available()), (1, 1));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_holders_never_exceed_the_cap() {
    let semaphore = Arc::new(AdmissionSemaphore::new(3));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..64 {
      let (local_active, local_peak, local_semaphore) =
        (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&semaphore));
      handles.push(tokio::spawn(async move {
        let _permit = local_semaphore.acquire(None, None).await.unwrap();
        let current = local_active.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = local_peak.fetch_max(current, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let _ = local_active.fetch_sub(1, Ordering::SeqCst);
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(semaphore.available(), 3);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn overlapping_chains_in_fixed_order_do_not_deadlock() {
    let connection = Arc::new(AdmissionSemaphore::new(1));
    let database = Arc::new(AdmissionSemaphore::new(1));
    let program = Arc::new(AdmissionSemaphore::new(1));
    let mut handles = Vec::new();
    for idx in 0..32 {
      let chain = if idx % 2 == 0 {
        [Some(Arc::clone(&connection)), Some(Arc::clone(&database)), None]
      } else {
        [None, Some(Arc::clone(&database)), Some(Arc::clone(&program))]
      };
      handles.push(tokio::spawn(async move {
        let _scope = acquire_all(&chain, None, None).await.unwrap();
        tokio::task::yield_now().await;
      }));
    }
    let all = futures::future::join_all(handles);
    for rslt in tokio::time::timeout(Duration::from_secs(5), all).await.unwrap() {
      rslt.unwrap();
    }
  }
}
