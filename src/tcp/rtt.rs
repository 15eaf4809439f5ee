//! Round-trip time estimation: Jacobson/Karn SRTT/RTTVAR with
//! the standard RFC 6298 gains, used to derive the retransmission
//! timeout. Samples are only taken from un-retransmitted segments (Karn's
//! algorithm) — a retransmitted segment's ACK is ambiguous about which
//! transmission it acknowledges, so it must never update the estimator.

use crate::config::{TCP_RTO_MAX, TCP_RTO_MIN};
use crate::time::Duration;

pub struct Estimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    /// Consecutive retransmissions of the segment currently outstanding;
    /// drives exponential backoff independent of the SRTT-derived RTO.
    backoff: u32,
}

impl Estimator {
    pub fn new(initial_rto: Duration) -> Estimator {
        Estimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial_rto,
            backoff: 0,
        }
    }

    /// Folds in a fresh RTT sample (from an un-retransmitted segment
    /// only — callers must apply Karn's algorithm before calling this).
    pub fn sample(&mut self, rtt: Duration) {
        self.backoff = 0;
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = Duration::from_millis(rtt.millis() / 2);
            }
            Some(srtt) => {
                let delta = if rtt.millis() > srtt.millis() {
                    rtt.millis() - srtt.millis()
                } else {
                    srtt.millis() - rtt.millis()
                };
                self.rttvar = Duration::from_millis((3 * self.rttvar.millis() + delta) / 4);
                self.srtt = Some(Duration::from_millis((7 * srtt.millis() + rtt.millis()) / 8));
            }
        }
        let computed = self.srtt.unwrap().millis() + (4 * self.rttvar.millis()).max(1);
        self.rto = Duration::from_millis(computed).max(TCP_RTO_MIN).min(TCP_RTO_MAX);
    }

    /// Current retransmission timeout, including any exponential backoff
    /// from consecutive retransmissions of the segment at the head of the
    /// send queue.
    pub fn rto(&self) -> Duration {
        let backed_off = self.rto.millis() << self.backoff.min(6);
        Duration::from_millis(backed_off).min(TCP_RTO_MAX).max(TCP_RTO_MIN)
    }

    /// Doubles the effective RTO (exponential backoff) after a
    /// retransmission timeout fires.
    pub fn backoff(&mut self) {
        self.backoff = (self.backoff + 1).min(6);
    }
}
