use std::time::Duration;

/// Smoothed round trip time and retransmission timeout (RTO) along the lines of RFC 6298.
///
/// Callers are responsible for Karn's algorithm, i.e. for not sampling packets that were
///  retransmitted.
#[derive(Debug)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,

    min_rto: Duration,
    max_rto: Duration,
    /// clock granularity - the resolution at which retransmit deadlines are checked
    granularity: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration, granularity: Duration) -> RttEstimator {
        RttEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial_rto.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
            granularity,
        }
    }

    pub fn on_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + deviation) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }

        let srtt = self.srtt.unwrap_or(rtt);
        self.rto = (srtt + self.granularity.max(self.rttvar * 4))
            .clamp(self.min_rto, self.max_rto);
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// RTO for a packet that was retransmitted `num_retransmits` times: doubled for every
    ///  retransmission, capped at the maximum RTO
    pub fn backed_off_rto(&self, num_retransmits: u32) -> Duration {
        let factor = 1u32.checked_shl(num_retransmits.min(31)).unwrap_or(u32::MAX);
        self.rto.checked_mul(factor)
            .unwrap_or(self.max_rto)
            .min(self.max_rto)
    }
}
