use anyhow::{Result, anyhow};
use dashmap::DashMap;
use ipnet::IpNet;
use std::{
    net::IpAddr,
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// Parses `allowed_ips` entries once, at load time. An entry is either a
/// single address or a CIDR range.
pub fn parse_allowlist(entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                // A bare address is a host-sized network
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                return IpNet::new(ip, prefix).map_err(|e| anyhow!("{entry}: {e}"));
            }
            entry
                .parse::<IpNet>()
                .map_err(|_| anyhow!("Invalid IP address or CIDR in allowed_ips: {entry}"))
        })
        .collect()
}

/// No allowlist means every peer is allowed.
#[must_use]
pub fn is_ip_allowed(peer_ip: IpAddr, allowed: Option<&[IpNet]>) -> bool {
    allowed.is_none_or(|nets| nets.iter().any(|net| net.contains(&peer_ip)))
}

#[derive(Clone, Copy, Debug)]
struct RateLimitState {
    warnings_remaining: u32,
    /// Attempts accepted but not yet judged. They are paid for out of
    /// `warnings_remaining` up front.
    in_flight: u32,
    cooldown_until: Option<Instant>,
    last_activity: Instant,
}

impl RateLimitState {
    const fn fresh(budget: u32, now: Instant) -> Self {
        Self {
            warnings_remaining: budget,
            in_flight: 0,
            cooldown_until: None,
            last_activity: now,
        }
    }

    fn is_idle(&self, budget: u32) -> bool {
        self.in_flight == 0 && self.cooldown_until.is_none() && self.warnings_remaining == budget
    }
}

/// What a failed authentication attempt cost the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthVerdict {
    Retry { remaining: u32 },
    Cooldown { remaining: Duration },
}

/// Why a connection was turned away before its key was read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refusal {
    Cooldown { remaining: Duration },
    /// Every attempt left in the budget is already reserved by another
    /// open connection from the same address.
    Busy,
}

/// Counts failed control-plane logins per peer IP and locks a peer out for
/// a fixed window once its warning budget is spent.
pub struct RateLimitGuard {
    entries: DashMap<IpAddr, RateLimitState>,
    budget: u32,
    window: Duration,
}

impl RateLimitGuard {
    #[must_use]
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            budget: budget.max(1),
            window,
        }
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Reserves one attempt for `ip` before anything is read from it. An
    /// expired cooldown is cleared here.
    pub fn begin_attempt(&self, ip: IpAddr) -> Result<AuthAttempt<'_>, Refusal> {
        self.begin_attempt_at(ip, Instant::now())
    }

    /// Drops entries that no longer hold back anybody.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    fn begin_attempt_at(&self, ip: IpAddr, now: Instant) -> Result<AuthAttempt<'_>, Refusal> {
        let mut entry = self
            .entries
            .entry(ip)
            .or_insert_with(|| RateLimitState::fresh(self.budget, now));
        if let Some(until) = entry.cooldown_until {
            if now < until {
                return Err(Refusal::Cooldown {
                    remaining: until - now,
                });
            }
            debug!(peer_ip = %ip, "Cooldown expired");
            entry.cooldown_until = None;
        }
        if entry.in_flight >= entry.warnings_remaining {
            return Err(Refusal::Busy);
        }
        entry.in_flight += 1;
        entry.last_activity = now;
        Ok(AuthAttempt {
            guard: self,
            ip,
            settled: false,
        })
    }

    fn record_failure_at(&self, ip: IpAddr, now: Instant) -> AuthVerdict {
        let mut entry = self
            .entries
            .entry(ip)
            .or_insert_with(|| RateLimitState::fresh(self.budget, now));
        entry.in_flight = entry.in_flight.saturating_sub(1);
        entry.last_activity = now;
        entry.warnings_remaining = entry.warnings_remaining.saturating_sub(1);

        if entry.warnings_remaining == 0 {
            entry.warnings_remaining = self.budget;
            entry.cooldown_until = Some(now + self.window);
            info!(peer_ip = %ip, cooldown_secs = self.window.as_secs(), "Peer placed on cooldown");
            return AuthVerdict::Cooldown {
                remaining: self.window,
            };
        }
        AuthVerdict::Retry {
            remaining: entry.warnings_remaining,
        }
    }

    /// Gives back a reservation without charging for it.
    fn release(&self, ip: IpAddr) {
        if let Some(mut entry) = self.entries.get_mut(&ip) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
        self.entries
            .remove_if(&ip, |_, state| state.is_idle(self.budget));
    }

    fn sweep_at(&self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, state| {
            let cooling = state.cooldown_until.is_some_and(|until| now < until);
            state.in_flight > 0 || cooling || now.duration_since(state.last_activity) < self.window
        });
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, "Swept rate limit entries");
        }
    }
}

/// One reserved authentication attempt. Dropping it unjudged returns the
/// reservation.
#[must_use]
pub struct AuthAttempt<'a> {
    guard: &'a RateLimitGuard,
    ip: IpAddr,
    settled: bool,
}

impl AuthAttempt<'_> {
    /// The key matched; the attempt costs nothing.
    pub fn succeed(mut self) {
        self.settled = true;
        self.guard.release(self.ip);
    }

    /// The key was wrong or missing.
    pub fn fail(self) -> AuthVerdict {
        self.fail_at(Instant::now())
    }

    fn fail_at(mut self, now: Instant) -> AuthVerdict {
        self.settled = true;
        self.guard.record_failure_at(self.ip, now)
    }
}

impl Drop for AuthAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.guard.release(self.ip);
        }
    }
}
