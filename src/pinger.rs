//! Keep-alive pinger, active only while the session waits for the bootloader.

use std::time::{Duration, Instant};

/// Tracks when the next keep-alive `PING` is due. The session asks on every
/// poll iteration and cancels the pinger on the first state transition out
/// of `Init`.
#[derive(Debug)]
pub struct Pinger {
    interval: Option<Duration>,
    last: Option<Instant>,
    active: bool,
}

impl Pinger {
    pub fn new(interval: Option<Duration>) -> Self {
        Pinger {
            active: interval.is_some(),
            interval,
            last: None,
        }
    }

    /// Whether a ping is due at `now`. The first call only arms the timer;
    /// pings start one full interval after that.
    pub fn due(&mut self, now: Instant) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };
        if !self.active {
            return false;
        }
        match self.last {
            None => {
                self.last = Some(now);
                false
            }
            Some(last) if now.duration_since(last) >= interval => {
                self.last = Some(now);
                true
            }
            Some(_) => false,
        }
    }

    pub fn cancel(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_interval() {
        let mut pinger = Pinger::new(Some(Duration::from_millis(75)));
        let t0 = Instant::now();
        assert!(!pinger.due(t0), "first call only arms the timer");
        assert!(!pinger.due(t0 + Duration::from_millis(50)));
        assert!(pinger.due(t0 + Duration::from_millis(80)));
        assert!(!pinger.due(t0 + Duration::from_millis(100)));
        assert!(pinger.due(t0 + Duration::from_millis(160)));
    }

    #[test]
    fn disabled_without_interval() {
        let mut pinger = Pinger::new(None);
        assert!(!pinger.is_active());
        let t0 = Instant::now();
        assert!(!pinger.due(t0));
        assert!(!pinger.due(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn cancel_stops_further_pings() {
        let mut pinger = Pinger::new(Some(Duration::from_millis(10)));
        let t0 = Instant::now();
        pinger.due(t0);
        assert!(pinger.due(t0 + Duration::from_millis(20)));
        pinger.cancel();
        assert!(!pinger.due(t0 + Duration::from_millis(200)));
        assert!(!pinger.is_active());
    }
}
