//! Liveness monitoring for the projection session.

use crate::LinkError;
use tokio_util::sync::CancellationToken;

/// The state guarded by the pinger lock
struct PingerState {
    /// When the last counted pong arrived, or when the pinger started
    last_pong: tokio::time::Instant,
    /// True while a ping is in flight, only the first pong afterwards counts
    outstanding: bool,
}

/// Paces ping requests and watches for the peer going quiet. The session
/// waits on [Pinger::ping] in a loop, sending one ping request per resolve,
/// and feeds [Pinger::pong] from the control channel.
pub struct Pinger {
    /// Time between ping requests
    interval: std::time::Duration,
    /// How long the peer may stay quiet before the session is considered dead
    deadline: std::time::Duration,
    /// The protected state
    inner: std::sync::Mutex<PingerState>,
    /// Cancelled when the session shuts down
    cancel: CancellationToken,
}

impl Pinger {
    /// Construct a new self with the given pacing
    pub fn new(interval: std::time::Duration, deadline: std::time::Duration) -> Self {
        Self {
            interval,
            deadline,
            inner: std::sync::Mutex::new(PingerState {
                last_pong: tokio::time::Instant::now(),
                outstanding: false,
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Wait for the next ping slot. Resolves when the next ping request
    /// should go out, fails with [LinkError::PingTimeout] once the peer has
    /// been quiet past the deadline, and with [LinkError::Aborted] when the
    /// pinger was cancelled.
    pub async fn ping(&self) -> Result<(), LinkError> {
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(LinkError::Aborted),
            _ = tokio::time::sleep(self.interval) => {}
        }
        let mut s = self.inner.lock().unwrap();
        if s.last_pong.elapsed() >= self.deadline {
            return Err(LinkError::PingTimeout);
        }
        s.outstanding = true;
        Ok(())
    }

    /// Record a pong from the peer. Pongs are idempotent, only the first one
    /// after a ping request moves the deadline.
    pub fn pong(&self) {
        let mut s = self.inner.lock().unwrap();
        if s.outstanding {
            s.outstanding = false;
            s.last_pong = tokio::time::Instant::now();
        }
    }

    /// Cancel the pinger so a shutdown does not race into a spurious quit
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
