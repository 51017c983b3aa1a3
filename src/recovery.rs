//! RTT estimation, PTO scheduling, and time/packet-threshold loss detection.

use crate::space::{Level, SentPacket};

/// Lower bound on any computed timer duration, matching RFC 9002's `kGranularity`.
pub const GRANULARITY_MILLIS: u64 = 1;

const PACKET_THRESHOLD_DEFAULT: u64 = 3;
const TIME_THRESHOLD_NUM: u64 = 9;
const TIME_THRESHOLD_DEN: u64 = 8;

#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    pub packet_threshold: u64,
    pub initial_rtt_millis: u64,
    pub max_ack_delay_millis: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            packet_threshold: PACKET_THRESHOLD_DEFAULT,
            initial_rtt_millis: 333,
            max_ack_delay_millis: 25,
        }
    }
}

/// Smoothed RTT estimator (RFC 9002 §5).
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    pub latest_rtt: u64,
    pub min_rtt: u64,
    pub smoothed_rtt: u64,
    pub rttvar: u64,
    initialized: bool,
}

impl RttEstimator {
    pub fn new(initial_rtt_millis: u64) -> Self {
        Self {
            latest_rtt: initial_rtt_millis,
            min_rtt: initial_rtt_millis,
            smoothed_rtt: initial_rtt_millis,
            rttvar: initial_rtt_millis / 2,
            initialized: false,
        }
    }

    /// Folds in one RTT sample from an acked, ack-eliciting packet. `peer_ack_delay` is the
    /// peer-reported delay (already scaled by its `ack_delay_exponent`), ignored at
    /// non-Application levels per RFC 9002 §5.3.
    pub fn sample(&mut self, latest: u64, peer_ack_delay: u64, max_ack_delay: u64, level: Level) {
        self.latest_rtt = latest;
        if !self.initialized {
            self.min_rtt = latest;
            self.smoothed_rtt = latest;
            self.rttvar = latest / 2;
            self.initialized = true;
            return;
        }

        self.min_rtt = self.min_rtt.min(latest);

        let mut adjusted = latest;
        if level == Level::Application {
            let capped_delay = peer_ack_delay.min(max_ack_delay);
            if latest.saturating_sub(capped_delay) >= self.min_rtt {
                adjusted = latest - capped_delay;
            }
        }

        let rttvar_sample = self.smoothed_rtt.abs_diff(adjusted);
        self.rttvar = (3 * self.rttvar + rttvar_sample) / 4;
        self.smoothed_rtt = (7 * self.smoothed_rtt + adjusted) / 8;
    }

    /// `max(4*rttvar, GRANULARITY)` base PTO duration before level/handshake adjustments.
    pub fn pto_base(&self) -> u64 {
        self.smoothed_rtt + (4 * self.rttvar).max(GRANULARITY_MILLIS)
    }
}

/// Computes the PTO duration for `pto_count` consecutive probe timeouts (RFC 9002 §6.2.1).
pub fn pto_duration(
    rtt: &RttEstimator,
    max_ack_delay_millis: u64,
    level: Level,
    handshake_confirmed: bool,
    pto_count: u32,
) -> u64 {
    let mut duration = rtt.pto_base();
    if level == Level::Application && handshake_confirmed {
        duration += max_ack_delay_millis;
    }
    duration << pto_count.min(31)
}

/// A packet judged lost by either the packet-count or time threshold.
#[derive(Debug, Clone)]
pub struct LostPacket {
    pub pn: u64,
    pub size: usize,
}

/// Scans `sent` for packets lost relative to `largest_acked`, per RFC 9002 §6.1.
///
/// Returns the lost packets and, if any unacked packet wasn't yet declared lost, the
/// deadline (in millis since epoch) at which the earliest of them would become lost.
pub fn detect_losses<'a>(
    sent: impl Iterator<Item = &'a SentPacket>,
    largest_acked: u64,
    now_millis: u64,
    rtt: &RttEstimator,
    config: &RecoveryConfig,
) -> (Vec<LostPacket>, Option<u64>) {
    let loss_delay = (TIME_THRESHOLD_NUM * rtt.latest_rtt.max(rtt.smoothed_rtt)) / TIME_THRESHOLD_DEN;
    let loss_delay = loss_delay.max(GRANULARITY_MILLIS);

    let mut lost = Vec::new();
    let mut earliest_not_lost_deadline: Option<u64> = None;

    for packet in sent {
        if packet.pn > largest_acked {
            continue;
        }
        let by_count = largest_acked.saturating_sub(packet.pn) >= config.packet_threshold;
        let loss_time = packet.sent_at_millis + loss_delay;
        let by_time = now_millis >= loss_time;

        if by_count || by_time {
            lost.push(LostPacket {
                pn: packet.pn,
                size: packet.size,
            });
        } else {
            earliest_not_lost_deadline = Some(match earliest_not_lost_deadline {
                Some(d) => d.min(loss_time),
                None => loss_time,
            });
        }
    }

    (lost, earliest_not_lost_deadline)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::frame::Frame;

    #[test]
    fn first_sample_initializes_all_fields_equal() {
        let mut rtt = RttEstimator::new(333);
        rtt.sample(100, 0, 25, Level::Application);
        assert_eq!(rtt.smoothed_rtt, 100);
        assert_eq!(rtt.min_rtt, 100);
        assert_eq!(rtt.rttvar, 50);
    }

    #[test]
    fn subsequent_sample_applies_ewma() {
        let mut rtt = RttEstimator::new(100);
        rtt.sample(100, 0, 25, Level::Application);
        rtt.sample(116, 0, 25, Level::Application);
        // smoothed = 7/8*100 + 1/8*116 = 102
        assert_eq!(rtt.smoothed_rtt, 102);
    }

    #[test]
    fn ack_delay_not_subtracted_below_min_rtt() {
        let mut rtt = RttEstimator::new(100);
        rtt.sample(100, 0, 25, Level::Application);
        rtt.sample(90, 50, 25, Level::Application); // min_rtt=90 once adjusted below min would break
        assert!(rtt.min_rtt <= 90);
    }

    #[test]
    fn pto_doubles_with_count() {
        let rtt = RttEstimator::new(100);
        let base = pto_duration(&rtt, 25, Level::Initial, false, 0);
        let doubled = pto_duration(&rtt, 25, Level::Initial, false, 1);
        assert_eq!(doubled, base * 2);
    }

    #[test]
    fn packet_threshold_declares_loss() {
        let sent = vec![
            SentPacket { pn: 0, sent_at_millis: 0, size: 100, ack_eliciting: true, frames: vec![Frame::Ping] },
            SentPacket { pn: 1, sent_at_millis: 0, size: 100, ack_eliciting: true, frames: vec![Frame::Ping] },
            SentPacket { pn: 2, sent_at_millis: 0, size: 100, ack_eliciting: true, frames: vec![Frame::Ping] },
            SentPacket { pn: 3, sent_at_millis: 0, size: 100, ack_eliciting: true, frames: vec![Frame::Ping] },
        ];
        let rtt = RttEstimator::new(100);
        let config = RecoveryConfig::default();
        let (lost, _) = detect_losses(sent.iter(), 3, 0, &rtt, &config);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].pn, 0);
    }

    #[test]
    fn time_threshold_declares_loss() {
        let sent = vec![SentPacket {
            pn: 0,
            sent_at_millis: 0,
            size: 100,
            ack_eliciting: true,
            frames: vec![Frame::Ping],
        }];
        let rtt = RttEstimator::new(100);
        let config = RecoveryConfig::default();
        let loss_delay = (9 * 100) / 8;
        let (lost, _) = detect_losses(sent.iter(), 0, loss_delay, &rtt, &config);
        assert_eq!(lost.len(), 1);
    }
}
