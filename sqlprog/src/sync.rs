//! Synchronizing primitives
//!
//! Admission control is built on top of the fair semaphore provided by `tokio`, which is
//! extended to allow runtime resizes.

mod admission_semaphore;

pub use admission_semaphore::{
  acquire_all, AdmissionPermit, AdmissionScope, AdmissionSemaphore, SemaphoreError,
};
