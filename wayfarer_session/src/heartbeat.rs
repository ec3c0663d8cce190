// Heartbeat monitor: periodic liveness beacons and silence detection.
//
// Once per `interval` the owner broadcasts a `Heartbeat` and sweeps for
// peers whose last activity is older than `interval * timeout_multiplier`.
// Any envelope from a peer counts as activity (see
// `MembershipRegistry::touch`); heartbeats only matter when nothing else is
// being said.
//
// This is a soft detector. Jitter longer than the timeout produces a false
// positive and the peer is dropped; there is no acknowledgment or retry.
// The monitor itself holds no peer state, just the beat schedule, so the
// same type drives the coordinator (sweeping the whole roster) and each
// joining peer (watching the coordinator only).

use std::time::{Duration, Instant};

use wayfarer_protocol::PeerId;

use crate::registry::MembershipRegistry;

/// What the owner must do on this tick.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HeartbeatTick {
    pub send_beat: bool,
    pub expired: Vec<PeerId>,
}

pub struct HeartbeatMonitor {
    interval: Duration,
    timeout_multiplier: u32,
    next_beat: Instant,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout_multiplier: u32, now: Instant) -> Self {
        Self {
            interval,
            timeout_multiplier,
            next_beat: now + interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.interval * self.timeout_multiplier
    }

    /// When `poll` next has work.
    pub fn next_due(&self) -> Instant {
        self.next_beat
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_beat
    }

    /// Advance the schedule. Missed beats are not replayed.
    fn advance(&mut self, now: Instant) {
        self.next_beat += self.interval;
        if self.next_beat <= now {
            self.next_beat = now + self.interval;
        }
    }

    /// Roster-wide tick: beat and sweep if due.
    pub fn poll(&mut self, registry: &MembershipRegistry, now: Instant) -> HeartbeatTick {
        if !self.is_due(now) {
            return HeartbeatTick::default();
        }
        self.advance(now);
        HeartbeatTick {
            send_beat: true,
            expired: registry.silent_since(now, self.timeout()),
        }
    }

    /// Single-link tick for a joiner watching its coordinator. Returns
    /// `(send_beat, link_expired)`.
    pub fn poll_link(&mut self, last_activity: Instant, now: Instant) -> (bool, bool) {
        if !self.is_due(now) {
            return (false, false);
        }
        self.advance(now);
        let expired = now.saturating_duration_since(last_activity) > self.timeout();
        (true, expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::record;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn beats_once_per_interval() {
        let t0 = Instant::now();
        let reg = MembershipRegistry::new(4);
        let mut hb = HeartbeatMonitor::new(5 * SEC, 3, t0);

        assert!(!hb.poll(&reg, t0 + 4 * SEC).send_beat);
        assert!(hb.poll(&reg, t0 + 5 * SEC).send_beat);
        assert!(!hb.poll(&reg, t0 + 6 * SEC).send_beat);
        assert!(hb.poll(&reg, t0 + 10 * SEC).send_beat);
    }

    #[test]
    fn long_stall_does_not_burst() {
        let t0 = Instant::now();
        let reg = MembershipRegistry::new(4);
        let mut hb = HeartbeatMonitor::new(5 * SEC, 3, t0);
        assert!(hb.poll(&reg, t0 + 60 * SEC).send_beat);
        assert!(!hb.poll(&reg, t0 + 61 * SEC).send_beat);
        assert_eq!(hb.next_due(), t0 + 65 * SEC);
    }

    #[test]
    fn silent_peer_expires_after_multiplier_intervals() {
        let t0 = Instant::now();
        let mut reg = MembershipRegistry::new(4);
        let quiet = record("quiet", t0);
        let chatty = record("chatty", t0);
        let (q, c) = (quiet.id, chatty.id);
        reg.add(quiet).unwrap();
        reg.add(chatty).unwrap();
        let mut hb = HeartbeatMonitor::new(5 * SEC, 3, t0);

        for step in 1..=3 {
            let now = t0 + 5 * step * SEC;
            reg.touch(c, now);
            assert!(hb.poll(&reg, now).expired.is_empty(), "step {step}");
        }
        // 20 s of silence > 15 s timeout.
        let now = t0 + 20 * SEC;
        reg.touch(c, now);
        assert_eq!(hb.poll(&reg, now).expired, vec![q]);
    }

    #[test]
    fn link_expires_when_coordinator_goes_quiet() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::new(SEC, 3, t0);
        assert_eq!(hb.poll_link(t0, t0 + SEC), (true, false));
        assert_eq!(hb.poll_link(t0, t0 + 2 * SEC), (true, false));
        assert_eq!(hb.poll_link(t0, t0 + 3 * SEC), (true, false));
        assert_eq!(hb.poll_link(t0, t0 + 4 * SEC), (true, true));
    }
}
