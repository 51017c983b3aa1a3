//! NewReno-style congestion controller.

/// Default max UDP payload size assumed when no path MTU has been negotiated.
pub const MTU: u64 = 1200;
const MINIMUM_WINDOW: u64 = 2 * MTU;
const INITIAL_WINDOW_FLOOR: u64 = 2 * MTU;
const INITIAL_WINDOW_CEILING: u64 = 10 * MTU;
const INITIAL_WINDOW_TARGET: u64 = 14_720;

#[derive(Debug, Clone)]
pub struct NewRenoController {
    pub window: u64,
    pub ssthresh: u64,
    pub in_flight: u64,
    recovery_start: Option<u64>,
}

impl Default for NewRenoController {
    fn default() -> Self {
        Self {
            window: INITIAL_WINDOW_TARGET.clamp(INITIAL_WINDOW_FLOOR, INITIAL_WINDOW_CEILING),
            ssthresh: u64::MAX,
            in_flight: 0,
            recovery_start: None,
        }
    }
}

impl NewRenoController {
    pub fn is_in_slow_start(&self) -> bool {
        self.window < self.ssthresh
    }

    pub fn on_packet_sent(&mut self, bytes: u64) {
        self.in_flight += bytes;
    }

    /// `sent_at_millis` is the send time of the packet being acked, used to decide whether
    /// this ack is still within an ongoing recovery period.
    pub fn on_packet_acked(&mut self, bytes: u64, sent_at_millis: u64) {
        self.in_flight = self.in_flight.saturating_sub(bytes);

        if let Some(recovery_start) = self.recovery_start {
            if sent_at_millis <= recovery_start {
                return;
            }
        }

        if self.is_in_slow_start() {
            self.window += bytes;
        } else {
            self.window += MTU * bytes / self.window.max(1);
        }
    }

    /// `now_millis` is the time loss was detected; becomes the new recovery epoch.
    pub fn on_packets_lost(&mut self, now_millis: u64, any_persistent_congestion: bool) {
        self.enter_recovery(now_millis);
        if any_persistent_congestion {
            self.window = MINIMUM_WINDOW;
        }
    }

    fn enter_recovery(&mut self, now_millis: u64) {
        let already_in_recovery = self
            .recovery_start
            .map(|start| now_millis <= start)
            .unwrap_or(false);
        if already_in_recovery {
            return;
        }
        self.recovery_start = Some(now_millis);
        self.window = (self.window / 2).max(MINIMUM_WINDOW);
        self.ssthresh = self.window;
    }

    pub fn is_congestion_window_available(&self, bytes_to_send: u64) -> bool {
        self.in_flight + bytes_to_send <= self.window
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slow_start_grows_by_full_acked_bytes() {
        let mut cc = NewRenoController::default();
        let before = cc.window;
        cc.on_packet_sent(MTU);
        cc.on_packet_acked(MTU, 0);
        assert_eq!(cc.window, before + MTU);
    }

    #[test]
    fn loss_halves_window_but_not_below_floor() {
        let mut cc = NewRenoController::default();
        cc.window = 4 * MTU;
        cc.on_packets_lost(100, false);
        assert_eq!(cc.window, 2 * MTU);
        assert_eq!(cc.ssthresh, 2 * MTU);
        assert!(cc.window >= MINIMUM_WINDOW);
    }

    #[test]
    fn window_never_drops_below_two_mtu_after_loss() {
        let mut cc = NewRenoController::default();
        cc.window = MINIMUM_WINDOW;
        cc.on_packets_lost(100, false);
        assert!(cc.window >= MINIMUM_WINDOW);
    }

    #[test]
    fn second_loss_within_same_recovery_period_is_ignored() {
        let mut cc = NewRenoController::default();
        cc.window = 8 * MTU;
        cc.on_packets_lost(100, false);
        let window_after_first = cc.window;
        cc.on_packets_lost(100, false);
        assert_eq!(cc.window, window_after_first);
    }

    #[test]
    fn congestion_avoidance_grows_sublinearly() {
        let mut cc = NewRenoController::default();
        cc.ssthresh = cc.window; // force congestion avoidance
        let before = cc.window;
        cc.on_packet_acked(MTU, 0);
        assert!(cc.window > before);
        assert!(cc.window < before + MTU);
    }
}
