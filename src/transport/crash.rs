//! Crash tracking, blacklisting and reconnect backoff
//!
//! Pure state over an injected clock: every decision is a function of the
//! recorded crash history and a caller-supplied `now`, so tests drive time
//! forward without sleeping. The stdio adapter records a crash whenever its
//! child exits outside of a deliberate disconnect and acts on the verdict.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Sliding window a crash stays relevant for.
pub const CRASH_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Two crashes closer together than this mean the process dies on startup.
pub const CRASH_LOOP_GAP: Duration = Duration::from_secs(30);

pub const BLACKLIST_HARD_THRESHOLD: usize = 5;
pub const BLACKLIST_HARD: Duration = Duration::from_secs(30 * 60);
pub const BLACKLIST_SOFT_THRESHOLD: usize = 3;
pub const BLACKLIST_SOFT: Duration = Duration::from_secs(10 * 60);

pub const RECONNECT_BASE: Duration = Duration::from_secs(2);
pub const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// What to do about the crash that was just recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    /// Schedule a reconnect attempt after `delay`.
    Reconnect { delay: Duration },
    /// Back-to-back startup crashes; automatic reconnect is paused.
    CrashLoop,
    /// Too many crashes in the window; connects fail until the blacklist
    /// expires.
    Blacklisted { duration: Duration },
}

#[derive(Debug, Default)]
pub struct CrashTracker {
    crashes: VecDeque<Instant>,
    total: u64,
    blacklisted_until: Option<Instant>,
}

impl CrashTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.crashes.front() {
            if now.duration_since(oldest) > CRASH_WINDOW {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a crash at `now` and decide what happens next. Blacklist
    /// thresholds win over the crash-loop check, which only matters before
    /// the soft threshold is reached.
    pub fn record_crash(&mut self, now: Instant) -> CrashVerdict {
        self.prune(now);
        let previous = self.crashes.back().copied();
        self.crashes.push_back(now);
        self.total += 1;

        let recent = self.crashes.len();
        if recent >= BLACKLIST_HARD_THRESHOLD {
            self.blacklisted_until = Some(now + BLACKLIST_HARD);
            return CrashVerdict::Blacklisted {
                duration: BLACKLIST_HARD,
            };
        }
        if recent >= BLACKLIST_SOFT_THRESHOLD {
            self.blacklisted_until = Some(now + BLACKLIST_SOFT);
            return CrashVerdict::Blacklisted {
                duration: BLACKLIST_SOFT,
            };
        }
        if let Some(prev) = previous {
            if now.duration_since(prev) < CRASH_LOOP_GAP {
                return CrashVerdict::CrashLoop;
            }
        }
        CrashVerdict::Reconnect {
            delay: self.reconnect_delay(now),
        }
    }

    /// Backoff ladder keyed by how many crashes the window currently holds,
    /// with up to 50% jitter once the server has crashed more than once
    /// recently so a flapping fleet does not reconnect in lockstep.
    pub fn reconnect_delay(&self, now: Instant) -> Duration {
        let recent = self.recent_crashes(now);
        let base = match recent {
            0 | 1 => RECONNECT_BASE,
            2 => Duration::from_secs(10),
            3 => Duration::from_secs(30),
            _ => RECONNECT_MAX,
        };
        if recent >= 2 {
            base + jitter(base)
        } else {
            base
        }
    }

    /// Crashes currently inside the sliding window.
    pub fn recent_crashes(&self, now: Instant) -> usize {
        self.crashes
            .iter()
            .filter(|&&at| now.duration_since(at) <= CRASH_WINDOW)
            .count()
    }

    pub fn total_crashes(&self) -> u64 {
        self.total
    }

    pub fn is_blacklisted(&self, now: Instant) -> bool {
        self.blacklist_remaining(now).is_some()
    }

    /// Time left on the blacklist, `None` once it has lapsed.
    pub fn blacklist_remaining(&self, now: Instant) -> Option<Duration> {
        self.blacklisted_until
            .filter(|&until| until > now)
            .map(|until| until - now)
    }

    /// Whether the two newest crashes were close enough to count as a
    /// startup crash loop.
    pub fn in_crash_loop(&self, _now: Instant) -> bool {
        let len = self.crashes.len();
        if len < 2 {
            return false;
        }
        let newest = self.crashes[len - 1];
        let prev = self.crashes[len - 2];
        newest.duration_since(prev) < CRASH_LOOP_GAP
    }

    /// Manual override: forget all crash history and lift any blacklist.
    pub fn clear(&mut self) {
        self.crashes.clear();
        self.total = 0;
        self.blacklisted_until = None;
    }
}

fn jitter(base: Duration) -> Duration {
    let cap = base.as_millis() as u64 / 2;
    if cap == 0 {
        return Duration::ZERO;
    }
    let roll = (Uuid::new_v4().as_u128() % (cap as u128 + 1)) as u64;
    Duration::from_millis(roll)
}
