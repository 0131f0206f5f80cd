//! Tunables of the event subsystem

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Configuration of the facade and its event subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IfdConfig {
    /// Pause between two polling rounds of the event listener.
    pub poll_delay_ms: u64,
    /// Length of the polling pause window after [`crate::Ifd::pause_events`].
    pub pause_delay_ms: u64,
    /// Use the polling event listener instead of the diff watcher for waits.
    pub use_polling_listener: bool,
}

impl Default for IfdConfig {
    fn default() -> Self {
        Self {
            poll_delay_ms: 500,
            pause_delay_ms: 2000,
            use_polling_listener: false,
        }
    }
}

impl IfdConfig {
    /// Polling pause as a duration.
    pub const fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    /// Pause window as a duration.
    pub const fn pause_delay(&self) -> Duration {
        Duration::from_millis(self.pause_delay_ms)
    }
}

/// Shared pause window for event pollers.
///
/// While the deadline lies in the future, pollers block before touching the
/// smart-card stack. Card-consuming operations open the window so polling
/// does not race their hardware access.
#[derive(Debug, Clone, Default)]
pub struct PauseCoordinator {
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl PauseCoordinator {
    /// Create a coordinator with no pause in effect.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or extend) the pause window by `delay` from now.
    pub fn pause(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut deadline = self.deadline.lock().unwrap();
        match *deadline {
            Some(existing) if existing >= until => {}
            _ => *deadline = Some(until),
        }
    }

    /// Block the calling poller until the pause window has passed.
    pub fn block_while_paused(&self) {
        loop {
            let remaining = {
                let deadline = self.deadline.lock().unwrap();
                deadline.and_then(|d| d.checked_duration_since(Instant::now()))
            };
            match remaining {
                Some(remaining) => std::thread::sleep(remaining),
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = IfdConfig::default();
        assert_eq!(config.poll_delay(), Duration::from_millis(500));
        assert_eq!(config.pause_delay(), Duration::from_millis(2000));
        assert!(!config.use_polling_listener);
    }

    #[test]
    fn config_deserializes_partial_input() {
        let config: IfdConfig = serde_json::from_str(r#"{"poll_delay_ms": 100}"#).unwrap();
        assert_eq!(config.poll_delay_ms, 100);
        assert_eq!(config.pause_delay_ms, 2000);
    }

    #[test]
    fn pause_window_blocks_then_releases() {
        let pause = PauseCoordinator::new();
        // no pause in effect, returns immediately
        pause.block_while_paused();

        pause.pause(Duration::from_millis(30));
        let start = Instant::now();
        pause.block_while_paused();
        assert!(start.elapsed() >= Duration::from_millis(25));

        // a shorter pause does not cut an existing window
        pause.pause(Duration::from_millis(50));
        pause.pause(Duration::from_millis(1));
        let start = Instant::now();
        pause.block_while_paused();
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
