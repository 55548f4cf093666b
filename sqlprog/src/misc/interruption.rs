use core::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a future didn't run to completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Interruption {
  Cancelled,
  TimedOut,
}

/// `None` when `timeout` is zero, which means "wait forever".
pub(crate) fn deadline_after(timeout: Duration, grace: Duration) -> Option<Instant> {
  if timeout.is_zero() {
    return None;
  }
  Instant::now().checked_add(timeout.saturating_add(grace))
}

/// Polls `future` until it finishes, `deadline` elapses or `cancel` fires, whatever happens
/// first. A finished future always wins a tie.
pub(crate) async fn until<F>(
  future: F,
  deadline: Option<Instant>,
  cancel: Option<&CancellationToken>,
) -> Result<F::Output, Interruption>
where
  F: Future,
{
  let cancelled = async {
    match cancel {
      Some(elem) => elem.cancelled().await,
      None => core::future::pending().await,
    }
  };
  let timed_out = async {
    match deadline {
      Some(elem) => tokio::time::sleep_until(elem).await,
      None => core::future::pending().await,
    }
  };
  tokio::select! {
    biased;
    rslt = future => Ok(rslt),
    () = cancelled => Err(Interruption::Cancelled),
    () = timed_out => Err(Interruption::TimedOut),
  }
}
