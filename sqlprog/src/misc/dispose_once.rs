/// Owns a resource that can be released at most once.
///
/// Releasing swaps the inner element with nothing before dropping it, which means that any
/// number of subsequent calls, for example, one from a cancellation path and another from the
/// regular path, are no-ops.
#[derive(Debug)]
pub struct DisposeOnce<T>(Option<T>);

impl<T> DisposeOnce<T> {
  /// Takes ownership of `resource`.
  #[inline]
  pub const fn new(resource: T) -> Self {
    Self(Some(resource))
  }

  /// Drops the inner resource, if any. Returns `true` if something was actually dropped.
  #[inline]
  pub fn dispose(&mut self) -> bool {
    let rslt = self.0.take();
    let has_resource = rslt.is_some();
    drop(rslt);
    has_resource
  }

  /// Reference to the resource if it wasn't disposed.
  #[inline]
  pub fn get(&self) -> Option<&T> {
    self.0.as_ref()
  }

  /// Mutable reference to the resource if it wasn't disposed.
  #[inline]
  pub fn get_mut(&mut self) -> Option<&mut T> {
    self.0.as_mut()
  }

  /// Moves the resource out without disposing it.
  #[inline]
  pub fn take(&mut self) -> Option<T> {
    self.0.take()
  }
}

#[cfg(test)]
mod tests {
  use crate::misc::DisposeOnce;
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  struct Counted(Arc<AtomicUsize>);

  impl Drop for Counted {
    fn drop(&mut self) {
      let _ = self.0.fetch_add(1, Ordering::Relaxed);
    }
  }

  #[test]
  fn multiple_disposals_drop_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut elem = DisposeOnce::new(Counted(Arc::clone(&drops)));
    assert!(elem.dispose());
    assert!(!elem.dispose());
    assert!(elem.get().is_none());
    drop(elem);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn taken_resources_are_not_dropped() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut elem = DisposeOnce::new(Counted(Arc::clone(&drops)));
    let taken = elem.take();
    assert!(!elem.dispose());
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    drop(taken);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
  }
}
