//! Local long-poll: no server exchange, just a timer raced against a signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::protocol::Event;

pub struct Wait {
    duration: Duration,
    signal: Arc<Notify>,
}

impl Wait {
    pub fn new(duration: Duration, signal: Arc<Notify>) -> Self {
        Self { duration, signal }
    }

    /// Completes exactly once, on whichever of cancellation, the signal or
    /// the timer comes first. The losers are dropped with the select.
    pub async fn run(&self, cancel: &CancellationToken) -> Event {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Event::temp_fail("WAITCANCEL"),
            _ = self.signal.notified() => Event::success("WAITSIGNAL"),
            _ = tokio::time::sleep(self.duration) => Event::success("WAITTIMEOUT"),
        }
    }
}
