use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::archiver::settings::MonitorSettings;
use crate::sync_ext::MutexExt;

const ALERT_HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthCategory {
    Memory,
    Performance,
    Activity,
    Errors,
    Deadlocks,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringLevel {
    Normal,
    Intensive,
}

#[derive(Debug, Clone)]
pub struct MonitoringEvent {
    pub timestamp: DateTime<Utc>,
    pub category: HealthCategory,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Active alerts keyed by category plus a bounded event history. Raising a
/// category replaces its previous alert; a passing check resolves it.
#[derive(Default)]
pub struct AlertManager {
    active: HashMap<HealthCategory, MonitoringEvent>,
    history: VecDeque<MonitoringEvent>,
}

impl AlertManager {
    pub fn raise(&mut self, category: HealthCategory, severity: AlertSeverity, message: String) {
        let event = MonitoringEvent {
            timestamp: Utc::now(),
            category,
            severity,
            message,
        };
        self.history.push_back(event.clone());
        if self.history.len() > ALERT_HISTORY_CAP {
            self.history.pop_front();
        }
        self.active.insert(category, event);
    }

    pub fn resolve(&mut self, category: HealthCategory) {
        self.active.remove(&category);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_alerts(&self) -> Vec<MonitoringEvent> {
        self.active.values().cloned().collect()
    }

    pub fn recent(&self, n: usize) -> Vec<MonitoringEvent> {
        self.history.iter().rev().take(n).cloned().collect()
    }
}

/// Snapshot of queue health inputs, taken briefly under the queue lock so
/// the checks themselves run without it.
#[derive(Debug, Clone, Default)]
pub struct HealthView {
    pub pending_len: usize,
    /// `(url, start_time, retry_count)` for each processing item.
    pub processing: Vec<(String, Option<DateTime<Utc>>, u32)>,
    pub success_rate: f64,
    pub total_processed: u64,
    pub error_rate: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// What the manager should do after a tick.
#[derive(Debug, Default)]
pub struct MonitorReport {
    /// Items past `deadlock_threshold`, candidates for recovery.
    pub stuck_urls: Vec<String>,
    /// The activity check says the whole queue is hung.
    pub hung: bool,
    /// Sampled RSS in MB, for the peak-memory metric.
    pub memory_mb: f64,
}

/// Periodic health monitor: memory, performance, activity, deadlocks,
/// error rate, and system load, with intensive-mode escalation.
pub struct QueueMonitor {
    settings: MonitorSettings,
    level: Mutex<MonitoringLevel>,
    alerts: Mutex<AlertManager>,
    quiet_since: Mutex<Option<DateTime<Utc>>>,
    system: Mutex<System>,
    pid: Pid,
}

impl QueueMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            settings,
            level: Mutex::new(MonitoringLevel::Normal),
            alerts: Mutex::new(AlertManager::default()),
            quiet_since: Mutex::new(None),
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn level(&self) -> MonitoringLevel {
        *self.level.lock_unpoisoned()
    }

    /// Interval until the next tick; halved while intensive.
    pub fn check_interval(&self) -> Duration {
        let base = Duration::from_secs(self.settings.check_interval_secs.max(1));
        match self.level() {
            MonitoringLevel::Normal => base,
            MonitoringLevel::Intensive => base / 2,
        }
    }

    pub fn active_alerts(&self) -> Vec<MonitoringEvent> {
        self.alerts.lock_unpoisoned().active_alerts()
    }

    fn sample_memory_mb(&self) -> f64 {
        let mut system = self.system.lock_unpoisoned();
        system.refresh_process(self.pid);
        system
            .process(self.pid)
            .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }

    fn sample_cpu_percent(&self) -> f32 {
        let mut system = self.system.lock_unpoisoned();
        system.refresh_process(self.pid);
        system.process(self.pid).map(|p| p.cpu_usage()).unwrap_or(0.0)
    }

    /// Run every check against the snapshot and return what the manager
    /// should act on. Never panics and never blocks on queue state.
    pub fn tick(&self, view: &HealthView) -> MonitorReport {
        let mut report = MonitorReport::default();
        let mut alerts = self.alerts.lock_unpoisoned();
        let now = Utc::now();

        // 1. Memory, with a re-sample after the critical threshold so a
        // transient allocation spike does not escalate on its own.
        let mut memory_mb = self.sample_memory_mb();
        if memory_mb >= self.settings.memory_critical_mb {
            std::thread::sleep(Duration::from_millis(100));
            memory_mb = self.sample_memory_mb();
        }
        report.memory_mb = memory_mb;
        if memory_mb >= self.settings.memory_critical_mb {
            alerts.raise(
                HealthCategory::Memory,
                AlertSeverity::Critical,
                format!("critical memory usage: {memory_mb:.1} MB"),
            );
        } else if memory_mb >= self.settings.memory_warning_mb {
            alerts.raise(
                HealthCategory::Memory,
                AlertSeverity::Warning,
                format!("elevated memory usage: {memory_mb:.1} MB"),
            );
        } else {
            alerts.resolve(HealthCategory::Memory);
        }

        // 2. Performance: success rate thresholds only mean something once
        // a few attempts have been recorded.
        if view.total_processed >= 5 {
            if view.success_rate < self.settings.success_rate_critical {
                alerts.raise(
                    HealthCategory::Performance,
                    AlertSeverity::Critical,
                    format!("success rate {:.0}%", view.success_rate * 100.0),
                );
            } else if view.success_rate < self.settings.success_rate_warning {
                alerts.raise(
                    HealthCategory::Performance,
                    AlertSeverity::Warning,
                    format!("success rate {:.0}%", view.success_rate * 100.0),
                );
            } else {
                alerts.resolve(HealthCategory::Performance);
            }
        }

        // 3. Activity: a non-empty processing set with no recent progress
        // marks the queue as hung and triggers emergency recovery.
        if !view.processing.is_empty()
            && let Some(last) = view.last_activity
        {
            let idle = (now - last).num_seconds();
            if idle > self.settings.inactivity_critical_secs {
                alerts.raise(
                    HealthCategory::Activity,
                    AlertSeverity::Critical,
                    format!("queue appears hung, idle {idle}s"),
                );
                report.hung = true;
            } else if idle > self.settings.inactivity_warning_secs {
                alerts.raise(
                    HealthCategory::Activity,
                    AlertSeverity::Warning,
                    format!("queue idle {idle}s with work in flight"),
                );
            } else {
                alerts.resolve(HealthCategory::Activity);
            }
        } else {
            alerts.resolve(HealthCategory::Activity);
        }

        // 4. Deadlocks: per-item processing age.
        let mut worst_age = 0i64;
        for (url, start_time, _retries) in &view.processing {
            let Some(start) = start_time else { continue };
            let age = (now - *start).num_seconds();
            worst_age = worst_age.max(age);
            if age > self.settings.deadlock_threshold_secs {
                report.stuck_urls.push(url.clone());
            }
        }
        if worst_age > self.settings.deadlock_critical_secs {
            alerts.raise(
                HealthCategory::Deadlocks,
                AlertSeverity::Critical,
                format!("item processing for {worst_age}s"),
            );
        } else if worst_age > self.settings.deadlock_warning_secs {
            alerts.raise(
                HealthCategory::Deadlocks,
                AlertSeverity::Warning,
                format!("item processing for {worst_age}s"),
            );
        } else {
            alerts.resolve(HealthCategory::Deadlocks);
        }

        // 5. Error rate.
        if view.error_rate > self.settings.error_rate_critical {
            alerts.raise(
                HealthCategory::Errors,
                AlertSeverity::Critical,
                format!("error rate {:.0}%", view.error_rate * 100.0),
            );
        } else if view.error_rate > self.settings.error_rate_warning {
            alerts.raise(
                HealthCategory::Errors,
                AlertSeverity::Warning,
                format!("error rate {:.0}%", view.error_rate * 100.0),
            );
        } else {
            alerts.resolve(HealthCategory::Errors);
        }

        // 6. System: process CPU share.
        let cpu = self.sample_cpu_percent();
        if cpu > self.settings.cpu_critical_percent {
            alerts.raise(
                HealthCategory::System,
                AlertSeverity::Critical,
                format!("cpu at {cpu:.0}%"),
            );
        } else if cpu > self.settings.cpu_warning_percent {
            alerts.raise(
                HealthCategory::System,
                AlertSeverity::Warning,
                format!("cpu at {cpu:.0}%"),
            );
        } else {
            alerts.resolve(HealthCategory::System);
        }

        let active = alerts.active_count();
        for event in alerts.active_alerts() {
            if event.severity >= AlertSeverity::Error {
                warn!(category = ?event.category, message = %event.message, "health alert");
            }
        }
        drop(alerts);

        self.adjust_level(active, now);
        if !report.stuck_urls.is_empty() {
            debug!(count = report.stuck_urls.len(), "stuck items detected");
        }
        report
    }

    /// Escalate to intensive when alert pressure passes the threshold;
    /// de-escalate after a sustained quiet period.
    fn adjust_level(&self, active_alerts: usize, now: DateTime<Utc>) {
        let mut level = self.level.lock_unpoisoned();
        let mut quiet_since = self.quiet_since.lock_unpoisoned();

        match *level {
            MonitoringLevel::Normal => {
                if active_alerts >= self.settings.alert_threshold {
                    info!("escalating to intensive monitoring");
                    *level = MonitoringLevel::Intensive;
                    *quiet_since = None;
                }
            }
            MonitoringLevel::Intensive => {
                if active_alerts == 0 {
                    let since = quiet_since.get_or_insert(now);
                    if (now - *since).num_seconds() >= self.settings.deescalate_after_secs {
                        info!("de-escalating to normal monitoring");
                        *level = MonitoringLevel::Normal;
                        *quiet_since = None;
                    }
                } else {
                    *quiet_since = None;
                }
            }
        }
    }

    #[cfg(test)]
    fn force_level(&self, level: MonitoringLevel) {
        *self.level.lock_unpoisoned() = level;
    }
}
