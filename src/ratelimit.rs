//! Fixed-window request limits keyed by client address.
//!
//! Limits are written as `<count>/<period>` where period is `second`,
//! `minute`, `hour` or `day` (plural and short forms accepted), for example
//! `3/minute` or `100/h`.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    pub limit: u32,
    pub window: Duration,
}

impl RateSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (count, period) = match spec.trim().split_once('/') {
            Some(parts) => parts,
            None => bail!("rate limit '{}' must look like '<count>/<period>'", spec),
        };
        let limit: u32 = match count.trim().parse() {
            Ok(n) if n > 0 => n,
            _ => bail!("rate limit count in '{}' must be a positive integer", spec),
        };
        let secs = match period.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => 1,
            "m" | "min" | "minute" | "minutes" => 60,
            "h" | "hour" | "hours" => 3600,
            "d" | "day" | "days" => 86_400,
            other => bail!("unknown rate limit period '{}'", other),
        };
        Ok(Self {
            limit,
            window: Duration::from_secs(secs),
        })
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Per-client counter for one route group.
#[derive(Debug)]
pub struct RateLimiter {
    spec: RateSpec,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(spec: RateSpec) -> Self {
        Self {
            spec,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn spec(&self) -> RateSpec {
        self.spec
    }

    /// Record a hit. Returns `Err(retry_after)` when the client is over the limit.
    pub fn check(&self, client: IpAddr) -> std::result::Result<(), Duration> {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> std::result::Result<(), Duration> {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Drop stale entries so the map does not grow with every client seen.
        if windows.len() > 4096 {
            let window = self.spec.window;
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = windows.entry(client).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.spec.window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= self.spec.limit {
            return Err(self.spec.window - now.duration_since(entry.started));
        }
        entry.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_specs() {
        assert_eq!(
            RateSpec::parse("3/minute").unwrap(),
            RateSpec {
                limit: 3,
                window: Duration::from_secs(60)
            }
        );
        assert_eq!(RateSpec::parse("10/h").unwrap().window.as_secs(), 3600);
        assert!(RateSpec::parse("0/minute").is_err());
        assert!(RateSpec::parse("5").is_err());
        assert!(RateSpec::parse("5/fortnight").is_err());
    }

    #[test]
    fn test_limit_and_window_reset() {
        let limiter = RateLimiter::new(RateSpec::parse("2/second").unwrap());
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let t0 = Instant::now();
        assert!(limiter.check_at(ip, t0).is_ok());
        assert!(limiter.check_at(ip, t0).is_ok());
        assert!(limiter.check_at(ip, t0).is_err());
        assert!(limiter.check_at(ip, t0 + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(RateSpec::parse("1/minute").unwrap());
        let t0 = Instant::now();
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.check_at(a, t0).is_ok());
        assert!(limiter.check_at(b, t0).is_ok());
        assert!(limiter.check_at(a, t0).is_err());
    }
}
