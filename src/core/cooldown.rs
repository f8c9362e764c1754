//! Posting cooldown: a sliding window of recent posts per
//! (platform, channel, job) that modulates downstream posting eagerness.

use std::collections::{HashMap, VecDeque};

use super::{system_clock, Clock};

/// Sliding-window post history with a clamped eagerness multiplier.
///
/// The multiplier grows with the recent posting rate and shrinks as recent
/// engagement approaches 1.0:
/// `1 + k_rate * rate + k_time * time_band_factor + k_eng * (1 - engagement_recent)`,
/// clamped to `[mult_min, mult_max]`.
pub struct CooldownGate {
    window: f64,
    mult_min: f64,
    mult_max: f64,
    k_rate: f64,
    k_time: f64,
    k_eng: f64,
    history: HashMap<(String, String, String), VecDeque<f64>>,
    clock: Clock,
}

impl CooldownGate {
    pub fn new(
        window_sec: u64,
        mult_min: f64,
        mult_max: f64,
        k_rate: f64,
        k_time: f64,
        k_eng: f64,
    ) -> Self {
        Self::with_clock(
            window_sec,
            mult_min,
            mult_max,
            k_rate,
            k_time,
            k_eng,
            system_clock(),
        )
    }

    pub fn with_clock(
        window_sec: u64,
        mult_min: f64,
        mult_max: f64,
        k_rate: f64,
        k_time: f64,
        k_eng: f64,
        clock: Clock,
    ) -> Self {
        Self {
            window: window_sec as f64,
            mult_min,
            mult_max,
            k_rate,
            k_time,
            k_eng,
            history: HashMap::new(),
            clock,
        }
    }

    fn key(platform: &str, channel: &str, job: &str) -> (String, String, String) {
        let or_dash = |s: &str| {
            if s.is_empty() {
                "-".to_string()
            } else {
                s.to_string()
            }
        };
        (or_dash(platform), or_dash(channel), or_dash(job))
    }

    /// Record a post for the key and evict entries older than the window.
    pub fn note_post(&mut self, platform: &str, channel: &str, job: &str) {
        let now = (self.clock)();
        let q = self
            .history
            .entry(Self::key(platform, channel, job))
            .or_default();
        q.push_back(now);
        let cut = now - self.window;
        while q.front().is_some_and(|ts| *ts < cut) {
            q.pop_front();
        }
    }

    /// Current multiplier for the key. O(history) in the window.
    pub fn multiplier(
        &mut self,
        platform: &str,
        channel: &str,
        job: &str,
        time_band_factor: f64,
        engagement_recent: f64,
    ) -> f64 {
        let rate = match self.history.get_mut(&Self::key(platform, channel, job)) {
            Some(q) => {
                let now = (self.clock)();
                let cut = now - self.window;
                while q.front().is_some_and(|ts| *ts < cut) {
                    q.pop_front();
                }
                q.len() as f64
            }
            None => 0.0,
        };
        let mult = 1.0
            + self.k_rate * rate
            + self.k_time * time_band_factor
            + self.k_eng * (1.0 - engagement_recent);
        mult.clamp(self.mult_min, self.mult_max)
    }

    /// Number of posts currently inside the window for the key (test hook).
    pub fn window_count(&self, platform: &str, channel: &str, job: &str) -> usize {
        self.history
            .get(&Self::key(platform, channel, job))
            .map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::CooldownGate;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn stepped_clock(start: f64) -> (super::Clock, Arc<AtomicU64>) {
        let ticks = Arc::new(AtomicU64::new(0));
        let shared = Arc::clone(&ticks);
        let clock: super::Clock =
            Arc::new(move || start + shared.load(Ordering::SeqCst) as f64);
        (clock, ticks)
    }

    #[test]
    fn multiplier_respects_bounds() {
        let (clock, _) = stepped_clock(0.0);
        let mut gate = CooldownGate::with_clock(3600, 0.5, 2.0, 10.0, 0.0, 0.0, clock);
        for _ in 0..50 {
            gate.note_post("discord", "general", "news");
        }
        let m = gate.multiplier("discord", "general", "news", 1.0, 1.0);
        assert_eq!(m, 2.0);
    }

    #[test]
    fn empty_history_uses_floor_terms() {
        let (clock, _) = stepped_clock(0.0);
        let mut gate = CooldownGate::with_clock(3600, 0.1, 3.0, 0.5, 0.2, 0.3, clock);
        // rate = 0, time factor 1.0, engagement 1.0
        let m = gate.multiplier("discord", "general", "news", 1.0, 1.0);
        assert!((m - 1.2).abs() < 1e-9);
    }

    #[test]
    fn low_engagement_raises_multiplier() {
        let (clock, _) = stepped_clock(0.0);
        let mut gate = CooldownGate::with_clock(3600, 0.1, 3.0, 0.0, 0.0, 1.0, clock);
        let cold = gate.multiplier("d", "c", "j", 0.0, 0.0);
        let warm = gate.multiplier("d", "c", "j", 0.0, 1.0);
        assert!(cold > warm);
    }

    #[test]
    fn window_eviction_drops_stale_posts() {
        let (clock, ticks) = stepped_clock(1_000.0);
        let mut gate = CooldownGate::with_clock(10, 0.0, 10.0, 1.0, 0.0, 0.0, clock);
        gate.note_post("d", "c", "j");
        ticks.store(30, std::sync::atomic::Ordering::SeqCst);
        let m = gate.multiplier("d", "c", "j", 0.0, 1.0);
        // The lone post is 30s old with a 10s window: rate contributes nothing.
        assert!((m - 1.0).abs() < 1e-9);
        assert_eq!(gate.window_count("d", "c", "j"), 0);
    }
}
