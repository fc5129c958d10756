//! Backpressure Controller (C5): periodically samples egress queue
//! utilization across all known processors, derives a discrete pressure
//! level and a consumption-rate multiplier that gates the router, and
//! (optionally) adapts the HIGH/CRITICAL thresholds to recent history.

use crate::config::BackpressureConfig;
use crate::model::PressureLevel;
use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const ADAPTATION_MIN_SAMPLES: usize = 50;
const ADAPTATION_MIN_INTERVAL: Duration = Duration::from_secs(60);

struct Thresholds {
    low: f64,
    high: f64,
    critical: f64,
}

struct AdaptiveState {
    samples: VecDeque<PressureLevel>,
    last_adjustment: Instant,
}

pub struct BackpressureController {
    alert_cooldown: Duration,
    thresholds: RwLock<Thresholds>,
    level: RwLock<PressureLevel>,
    entered_at: RwLock<Instant>,
    last_critical_alert: Mutex<Option<Instant>>,
    adaptive: Mutex<AdaptiveState>,
}

pub struct SampleOutcome {
    pub level: PressureLevel,
    pub consumption_rate: f64,
    pub pressure_event: bool,
    pub returned_to_normal_after: Option<Duration>,
    pub critical_alert: bool,
}

impl BackpressureController {
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            alert_cooldown: Duration::from_secs(config.alert_cooldown_s),
            thresholds: RwLock::new(Thresholds {
                low: config.low,
                high: config.high,
                critical: config.critical,
            }),
            level: RwLock::new(PressureLevel::Normal),
            entered_at: RwLock::new(Instant::now()),
            last_critical_alert: Mutex::new(None),
            adaptive: Mutex::new(AdaptiveState {
                samples: VecDeque::with_capacity(128),
                last_adjustment: Instant::now(),
            }),
        }
    }

    pub fn current_level(&self) -> PressureLevel {
        *self.level.read().unwrap()
    }

    pub fn consumption_rate(&self) -> f64 {
        self.current_level().consumption_rate()
    }

    fn level_for(&self, max_utilization: f64) -> PressureLevel {
        let t = self.thresholds.read().unwrap();
        if max_utilization >= t.critical {
            PressureLevel::Critical
        } else if max_utilization >= t.high {
            PressureLevel::High
        } else if max_utilization >= t.low {
            PressureLevel::Low
        } else {
            PressureLevel::Normal
        }
    }

    /// Per-processor throttle: higher declared priority is throttled less.
    pub fn throttle_for(&self, level: PressureLevel, priority_weight: f64) -> f64 {
        let base = match level {
            PressureLevel::Normal => 0.0,
            PressureLevel::Low => 0.2,
            PressureLevel::High => 0.5,
            PressureLevel::Critical => 1.0,
        };
        base / priority_weight.max(1.0)
    }

    /// Feed one observation (the max over all processors of length/capacity)
    /// and update level, consumption rate, and adaptive thresholds.
    pub fn sample(&self, max_utilization: f64) -> SampleOutcome {
        let new_level = self.level_for(max_utilization);
        let previous_level = *self.level.read().unwrap();

        let mut pressure_event = false;
        let mut returned_to_normal_after = None;
        let mut critical_alert = false;

        if new_level != previous_level {
            pressure_event = true;
            if new_level == PressureLevel::Normal {
                let entered_at = *self.entered_at.read().unwrap();
                returned_to_normal_after = Some(entered_at.elapsed());
                info!(duration_ms = entered_at.elapsed().as_millis(), "pressure returned to normal");
            } else {
                info!(?new_level, max_utilization, "entering pressure state");
            }
            *self.level.write().unwrap() = new_level;
            *self.entered_at.write().unwrap() = Instant::now();

            if new_level == PressureLevel::Critical {
                let mut last = self.last_critical_alert.lock().unwrap();
                let fire = last.map(|t| t.elapsed() >= self.alert_cooldown).unwrap_or(true);
                if fire {
                    *last = Some(Instant::now());
                    critical_alert = true;
                    warn!(max_utilization, "CRITICAL backpressure alert");
                }
            }
        }

        self.maybe_adapt(new_level);

        SampleOutcome {
            level: new_level,
            consumption_rate: new_level.consumption_rate(),
            pressure_event,
            returned_to_normal_after,
            critical_alert,
        }
    }

    fn maybe_adapt(&self, level: PressureLevel) {
        let mut adaptive = self.adaptive.lock().unwrap();
        adaptive.samples.push_back(level);
        if adaptive.samples.len() > 200 {
            adaptive.samples.pop_front();
        }

        if adaptive.samples.len() < ADAPTATION_MIN_SAMPLES
            || adaptive.last_adjustment.elapsed() < ADAPTATION_MIN_INTERVAL
        {
            return;
        }

        let total = adaptive.samples.len() as f64;
        let elevated = adaptive
            .samples
            .iter()
            .filter(|l| matches!(l, PressureLevel::High | PressureLevel::Critical))
            .count() as f64;
        let elevated_ratio = elevated / total;

        let mut t = self.thresholds.write().unwrap();
        if elevated_ratio > 0.6 {
            t.high = (t.high * 0.95).max(0.1);
            t.critical = (t.critical * 0.97).max(t.high + 0.01);
            info!(high = t.high, critical = t.critical, "lowered backpressure thresholds");
        } else if elevated_ratio < 0.1 {
            t.high = (t.high * 1.05).min(0.85);
            t.critical = (t.critical * 1.02).min(0.98);
            info!(high = t.high, critical = t.critical, "raised backpressure thresholds");
        }

        adaptive.last_adjustment = Instant::now();
        adaptive.samples.clear();
    }

    pub fn thresholds(&self) -> (f64, f64, f64) {
        let t = self.thresholds.read().unwrap();
        (t.low, t.high, t.critical)
    }
}
