use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// One-shot idle timer. Replaced, never rearmed: every reset spawns a new one
/// with a higher generation and drops the old one's stop channel.
pub(crate) struct IdleTimer {
    generation: u64,
    _stop: Sender<()>,
}

impl IdleTimer {
    /// Calls `on_expire(generation)` after `delay` unless the timer is dropped first.
    pub(crate) fn spawn<F>(generation: u64, delay: Duration, on_expire: F) -> Option<IdleTimer>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name("gemini-idle-timer".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(delay) {
                    on_expire(generation);
                }
            });
        match spawned {
            Ok(_) => Some(IdleTimer {
                generation,
                _stop: stop_tx,
            }),
            Err(err) => {
                tracing::warn!("failed to spawn idle timer: {err}");
                None
            }
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}
