// Copyright (C) 2018-2019, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::time::Duration;

/// The default RTT used before any sample is taken.
pub const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Round-trip time estimation shared by the loss detector, the threshold
/// controller and the congestion controller.
pub struct RttStats {
    latest_rtt: Duration,

    smoothed_rtt: Option<Duration>,

    rttvar: Duration,

    min_rtt: Duration,

    max_ack_delay: Duration,
}

impl RttStats {
    pub fn new(max_ack_delay: Duration) -> Self {
        RttStats {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: None,
            rttvar: INITIAL_RTT / 2,
            min_rtt: Duration::ZERO,
            max_ack_delay,
        }
    }

    /// Updates the estimator with a new sample.
    ///
    /// `ack_delay` is the delay the peer reported between receiving the
    /// acknowledged packet and sending the acknowledgement.
    pub fn update_rtt(&mut self, latest_rtt: Duration, ack_delay: Duration) {
        if latest_rtt.is_zero() {
            return;
        }

        self.latest_rtt = latest_rtt;

        match self.smoothed_rtt {
            // First RTT sample.
            None => {
                self.min_rtt = latest_rtt;
                self.smoothed_rtt = Some(latest_rtt);
                self.rttvar = latest_rtt / 2;
            },

            Some(srtt) => {
                self.min_rtt = self.min_rtt.min(latest_rtt);

                let ack_delay = ack_delay.min(self.max_ack_delay);

                // Adjust for ack delay if plausible.
                let adjusted_rtt = if latest_rtt > self.min_rtt + ack_delay {
                    latest_rtt - ack_delay
                } else {
                    latest_rtt
                };

                self.rttvar = self.rttvar * 3 / 4 +
                    Duration::from_nanos(
                        srtt.as_nanos().abs_diff(adjusted_rtt.as_nanos()) as u64 /
                            4,
                    );

                self.smoothed_rtt = Some(srtt * 7 / 8 + adjusted_rtt / 8);
            },
        }
    }

    /// The smoothed RTT, or the initial default when no sample exists.
    pub fn rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(INITIAL_RTT)
    }

    /// The smoothed RTT, if at least one sample has been taken.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed_rtt
    }

    /// The most recent sample.
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// The RTT variance.
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// The minimum observed RTT.
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    /// Overrides the smoothed RTT. Only used to set up test scenarios.
    #[cfg(test)]
    pub(crate) fn set_smoothed_rtt(&mut self, rtt: Duration) {
        self.smoothed_rtt = Some(rtt);
        self.latest_rtt = rtt;
        self.min_rtt = rtt;
    }

    /// The time at which a packet sent now should be considered lost absent
    /// any acknowledgement.
    pub fn max_rtt(&self) -> Duration {
        self.latest_rtt.max(self.rtt())
    }
}

impl std::fmt::Debug for RttStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RttStats")
            .field("latest_rtt", &self.latest_rtt)
            .field("srtt", &self.smoothed_rtt)
            .field("min_rtt", &self.min_rtt)
            .field("rttvar", &self.rttvar)
            .finish()
    }
}
