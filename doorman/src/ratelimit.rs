use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Buckets idle this long are forgotten once the table grows past `MAX_PEERS`.
const IDLE: Duration = Duration::from_secs(60);
const MAX_PEERS: usize = 4096;

/// Per-peer token bucket, checked before any decoding or crypto work.
/// Each listener owns one, so no locking.
#[derive(Debug)]
pub struct RateLimiter {
    map: HashMap<IpAddr, (u32, Instant)>,
    pps: u32,
    burst: u32,
}

impl RateLimiter {
    pub fn new(pps: u32, burst: u32) -> Self {
        Self {
            map: HashMap::new(),
            pps,
            burst,
        }
    }

    pub fn allow(&mut self, ip: IpAddr, now: Instant) -> bool {
        if self.map.len() >= MAX_PEERS && !self.map.contains_key(&ip) {
            self.map.retain(|_, (_, last)| now.duration_since(*last) < IDLE);
        }
        let e = self.map.entry(ip).or_insert((self.burst, now));
        let elapsed = now.duration_since(e.1).as_secs_f64();
        let refill = (elapsed * self.pps as f64) as u32;
        let tokens = e.0.saturating_add(refill).min(self.burst);
        if refill > 0 {
            e.1 = now;
        }
        if tokens == 0 {
            e.0 = 0;
            return false;
        }
        e.0 = tokens - 1;
        true
    }
}
