use std::cmp::{max, min};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

/// What a connector knows about its peer
#[derive(Clone, Debug)]
pub struct RemoteInfo {
    pub addr: SocketAddr,
    /// restarted whenever something arrives from the peer
    pub timeout_stopwatch: Instant,
    pub mean_latency: Duration,
    pub optimistic_latency: Duration,
    pub pessimistic_latency: Duration,
}

impl Default for RemoteInfo {
    fn default() -> Self {
        RemoteInfo {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            timeout_stopwatch: Instant::now(),
            mean_latency: Duration::ZERO,
            optimistic_latency: Duration::ZERO,
            pessimistic_latency: Duration::ZERO,
        }
    }
}

impl RemoteInfo {
    pub fn for_addr(addr: SocketAddr) -> RemoteInfo {
        RemoteInfo {
            addr,
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn time_since_last_receive(&self) -> Duration {
        self.timeout_stopwatch.elapsed()
    }

    /// Replaces the latency estimate with the samples of the cycle that just finished, if there
    ///  were any
    pub fn apply_latency_samples(&mut self, samples: &LatencyAccumulator) {
        if let Some((mean, optimistic, pessimistic)) = samples.summary() {
            self.mean_latency = mean;
            self.optimistic_latency = optimistic;
            self.pessimistic_latency = pessimistic;
        }
    }
}

/// Collects round trip samples during one receive cycle
#[derive(Clone, Debug, Default)]
pub struct LatencyAccumulator {
    sum: Duration,
    num_samples: u32,
    min: Duration,
    max: Duration,
}

impl LatencyAccumulator {
    pub fn add_sample(&mut self, sample: Duration) {
        if self.num_samples == 0 {
            self.min = sample;
            self.max = sample;
        }
        else {
            self.min = min(self.min, sample);
            self.max = max(self.max, sample);
        }
        self.sum += sample;
        self.num_samples += 1;
    }

    pub fn num_samples(&self) -> u32 {
        self.num_samples
    }

    /// (mean, minimum, maximum)
    pub fn summary(&self) -> Option<(Duration, Duration, Duration)> {
        if self.num_samples == 0 {
            return None;
        }
        Some((self.sum / self.num_samples, self.min, self.max))
    }
}
