// =============================================================================
// Scheduler — wall-clock-driven job runner anchored to the exchange time zone
// (SPEC_FULL.md §4.2).
// =============================================================================
//
// No cron-in-a-timezone crate appears anywhere in the reference corpus, so
// this is a hand-written minute-granularity loop: `tokio::time::interval`
// ticks once a minute, and every tick scans a small fixed table of
// `JobSpec`s, each a pure `(NaiveTime, Weekday) -> bool` trigger predicate
// plus a misfire grace window. A job whose trigger minute has already passed
// by more than `grace` is skipped and logged as a misfire rather than fired
// late — this can happen after the process was descheduled (laptop sleep,
// container pause) for longer than a job's grace window.
//
// Each job body is wrapped in `AssertUnwindSafe` + `catch_unwind` so a panic
// inside one job increments the error counter and is logged rather than
// taking down the scheduler loop (SPEC_FULL.md §5 "Failure-isolation
// guarantee"), mirroring the teacher's reconnect-on-error pattern for its
// market-data stream loops in `main.rs`.
//
// =============================================================================

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveTime, Timelike, Weekday};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::executor::{Executor, EXCHANGE_TZ};
use crate::persistence::{LogLevel, Persistence};
use crate::types::TradingMode;

/// One minute-granularity trigger plus a misfire grace window.
struct JobSpec {
    id: &'static str,
    name: &'static str,
    matches: fn(NaiveTime, Weekday) -> bool,
    grace: Duration,
}

fn is_weekday(day: Weekday) -> bool {
    !matches!(day, Weekday::Sat | Weekday::Sun)
}

fn floor_to_minute(dt: chrono::DateTime<chrono_tz::Tz>) -> chrono::DateTime<chrono_tz::Tz> {
    dt.with_second(0).and_then(|d| d.with_nanosecond(0)).unwrap_or(dt)
}

/// How far `now` sits past a job's trigger `minute`. Negative (trigger still
/// in the future, shouldn't happen given how `minutes_to_scan` is built) is
/// clamped to zero via `to_std`'s error case.
fn lateness_of(now: chrono::DateTime<chrono_tz::Tz>, minute: chrono::DateTime<chrono_tz::Tz>) -> Duration {
    (now - minute).to_std().unwrap_or_default()
}

/// Every whole minute strictly after `previous` through `now_minute`
/// inclusive. `previous >= now_minute` (first scan ever, or clock hasn't
/// advanced a full minute) degrades to just `[now_minute]`.
fn minutes_since(
    previous: chrono::DateTime<chrono_tz::Tz>,
    now_minute: chrono::DateTime<chrono_tz::Tz>,
) -> Vec<chrono::DateTime<chrono_tz::Tz>> {
    if previous >= now_minute {
        return vec![now_minute];
    }
    let mut minutes = Vec::new();
    let mut m = previous + chrono::Duration::minutes(1);
    while m <= now_minute {
        minutes.push(m);
        m += chrono::Duration::minutes(1);
    }
    minutes
}

fn at(t: NaiveTime, hour: u32, minute: u32) -> bool {
    t.hour() == hour && t.minute() == minute
}

fn in_window_every_15(t: NaiveTime, start: (u32, u32), end: (u32, u32)) -> bool {
    let minute_of_day = t.hour() * 60 + t.minute();
    let start_min = start.0 * 60 + start.1;
    let end_min = end.0 * 60 + end.1;
    minute_of_day >= start_min && minute_of_day <= end_min && (minute_of_day - start_min) % 15 == 0
}

fn in_window_every_5(t: NaiveTime, start: (u32, u32), end: (u32, u32)) -> bool {
    let minute_of_day = t.hour() * 60 + t.minute();
    let start_min = start.0 * 60 + start.1;
    let end_min = end.0 * 60 + end.1;
    minute_of_day >= start_min && minute_of_day <= end_min && (minute_of_day - start_min) % 5 == 0
}

/// SPEC_FULL.md §4.2's trigger calendar, expressed as pure predicates over
/// exchange-local time.
const JOBS: &[JobSpec] = &[
    JobSpec {
        id: "morning_signal",
        name: "Morning signal",
        matches: |t, d| is_weekday(d) && at(t, 9, 35),
        grace: Duration::from_secs(300),
    },
    JobSpec {
        id: "crash_day_poll",
        name: "Crash-day poll",
        matches: |t, d| is_weekday(d) && in_window_every_15(t, (9, 45), (11, 45)),
        grace: Duration::from_secs(120),
    },
    JobSpec {
        id: "pump_day_poll",
        name: "Pump-day poll",
        matches: |t, d| is_weekday(d) && in_window_every_15(t, (9, 45), (11, 45)),
        grace: Duration::from_secs(120),
    },
    JobSpec {
        id: "trailing_hedge_poll",
        name: "Trailing-hedge poll",
        matches: |t, d| is_weekday(d) && in_window_every_5(t, (10, 0), (15, 50)),
        grace: Duration::from_secs(120),
    },
    JobSpec {
        id: "position_close",
        name: "Position close",
        matches: |t, d| is_weekday(d) && at(t, 15, 55),
        grace: Duration::from_secs(300),
    },
    JobSpec {
        id: "broker_token_renewal",
        name: "Broker token renewal",
        matches: |t, d| is_weekday(d) && at(t, 8, 0),
        grace: Duration::from_secs(3600),
    },
    JobSpec {
        id: "heartbeat",
        name: "Heartbeat",
        matches: |t, _d| t.minute() == 0,
        grace: Duration::from_secs(3600),
    },
];

/// Counters the operator can inspect through the command surface / REST
/// endpoints without reaching into the scheduler's internals.
#[derive(Default)]
pub struct SchedulerStats {
    pub jobs_fired: AtomicU64,
    pub jobs_skipped_misfire: AtomicU64,
    pub jobs_failed: AtomicU64,
}

/// Drives the executor on the trigger calendar above. Pausable via
/// `RuntimeConfig::scheduler_paused` without tearing down the process.
pub struct Scheduler {
    executor: Arc<Executor>,
    config: Arc<RwLock<RuntimeConfig>>,
    persistence: Arc<Persistence>,
    stats: SchedulerStats,
    running: AtomicBool,
    /// The last whole minute this scheduler scanned, exchange-local. Used to
    /// detect a missed tick (process suspended, container paused) and replay
    /// the skipped minutes against the misfire-grace window rather than
    /// silently losing them (SPEC_FULL.md §4.2 "Misfire policy").
    last_scan: parking_lot::Mutex<Option<chrono::DateTime<chrono_tz::Tz>>>,
}

impl Scheduler {
    pub fn new(executor: Arc<Executor>, config: Arc<RwLock<RuntimeConfig>>, persistence: Arc<Persistence>) -> Self {
        Self {
            executor,
            config,
            persistence,
            stats: SchedulerStats::default(),
            running: AtomicBool::new(true),
            last_scan: parking_lot::Mutex::new(None),
        }
    }

    pub fn pause(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.config.write().scheduler_paused = true;
    }

    pub fn resume(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.config.write().scheduler_paused = false;
    }

    pub fn is_paused(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.jobs_fired.load(Ordering::Relaxed),
            self.stats.jobs_skipped_misfire.load(Ordering::Relaxed),
            self.stats.jobs_failed.load(Ordering::Relaxed),
        )
    }

    /// The minute-tick loop. Runs until `shutdown` is cancelled, at which
    /// point it stops accepting new fires and returns promptly — in-flight
    /// job bodies are awaited inline (never detached), so a fire that was
    /// already dispatched this tick still completes before `run` returns.
    #[instrument(skip(self, shutdown), name = "scheduler::run")]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("scheduler starting");
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        // Align ticks to the top of the minute so trigger-minute comparisons
        // stay exact even if the process starts mid-minute.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopping on shutdown signal");
                    return;
                }
                _ = interval.tick() => {}
            }

            if self.is_paused() {
                // Jobs scheduled during a pause are dropped, not queued
                // (SPEC_FULL.md §4.2 "Pause/resume"): advance `last_scan` so
                // a later resume does not try to replay the paused window.
                let now = chrono::Utc::now().with_timezone(&EXCHANGE_TZ);
                *self.last_scan.lock() = Some(floor_to_minute(now));
                continue;
            }

            let now = chrono::Utc::now().with_timezone(&EXCHANGE_TZ);
            for minute in self.minutes_to_scan(now) {
                let time = minute.time();
                let weekday = minute.weekday();

                for job in JOBS {
                    if !(job.matches)(time, weekday) {
                        continue;
                    }
                    if job.id == "broker_token_renewal" && self.config.read().bot.mode != TradingMode::Live {
                        continue;
                    }

                    let lateness = lateness_of(now, minute);
                    if lateness > job.grace {
                        self.stats.jobs_skipped_misfire.fetch_add(1, Ordering::Relaxed);
                        warn!(job = job.id, name = job.name, lateness_secs = lateness.as_secs(), "scheduler job misfired, dropping");
                        self.persistence.log_event(
                            LogLevel::Warning,
                            "SCHEDULER_JOB_MISFIRE",
                            json!({ "job": job.id, "lateness_secs": lateness.as_secs() }),
                        );
                        continue;
                    }

                    self.fire(job, minute).await;
                }
            }
        }
    }

    /// Every whole exchange-local minute from just after the last scan
    /// through `now`, inclusive. Normally a single minute (the tick just
    /// elapsed); more than one only after a missed tick.
    fn minutes_to_scan(&self, now: chrono::DateTime<chrono_tz::Tz>) -> Vec<chrono::DateTime<chrono_tz::Tz>> {
        let now_minute = floor_to_minute(now);
        let mut guard = self.last_scan.lock();
        let previous = guard.unwrap_or(now_minute);
        *guard = Some(now_minute);
        drop(guard);
        minutes_since(previous, now_minute)
    }

    async fn fire(&self, job: &JobSpec, now: chrono::DateTime<chrono_tz::Tz>) {
        let body: Pin<Box<dyn Future<Output = ()> + Send + '_>> = match job.id {
            "morning_signal" => Box::pin(async {
                let result = self.executor.execute_signal(None, false).await;
                self.log_job_result(job, result.success, result.error.as_deref());
            }),
            "crash_day_poll" | "pump_day_poll" => Box::pin(async {
                let result = self.executor.execute_signal(None, true).await;
                self.log_job_result(job, result.success, result.error.as_deref());
            }),
            "trailing_hedge_poll" => Box::pin(async {
                match self.executor.check_and_execute_hedge().await {
                    Some(result) => self.log_job_result(job, result.success, result.error.as_deref()),
                    None => self.log_job_result(job, true, None),
                }
                match self.executor.check_and_execute_reversal().await {
                    Some(result) => self.log_job_result(job, result.success, result.error.as_deref()),
                    None => {}
                }
            }),
            "position_close" => Box::pin(async {
                let results = self.executor.run_eod_sweep().await;
                let all_ok = results.iter().all(|r| r.success);
                self.log_job_result(job, all_ok, None);
            }),
            "broker_token_renewal" => Box::pin(async {
                match self.executor.ensure_broker_authenticated().await {
                    Ok(authenticated) => self.log_job_result(job, authenticated, None),
                    Err(e) => self.log_job_result(job, false, Some(&e.to_string())),
                }
            }),
            "heartbeat" => Box::pin(async {
                let (fired, skipped, failed) = self.stats();
                self.persistence.log_event(
                    LogLevel::Info,
                    "HEARTBEAT",
                    json!({
                        "jobs_fired": fired,
                        "jobs_skipped_misfire": skipped,
                        "jobs_failed": failed,
                        "paused": self.is_paused(),
                    }),
                );
                info!(jobs_fired = fired, jobs_failed = failed, "scheduler heartbeat");
            }),
            _ => return,
        };
        let _ = now;

        let caught = AssertUnwindSafe(body).catch_unwind().await;
        if caught.is_err() {
            self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
            error!(job = job.id, "scheduler job panicked");
            self.persistence.log_event(LogLevel::Error, "SCHEDULER_JOB_PANIC", json!({ "job": job.id }));
        }
    }

    fn log_job_result(&self, job: &JobSpec, success: bool, error: Option<&str>) {
        if success {
            self.stats.jobs_fired.fetch_add(1, Ordering::Relaxed);
            info!(job = job.id, name = job.name, "scheduler job fired");
            self.persistence.log_event(LogLevel::Info, "SCHEDULER_JOB_FIRED", json!({ "job": job.id }));
        } else {
            self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
            warn!(job = job.id, name = job.name, error, "scheduler job failed");
            self.persistence.log_event(
                LogLevel::Warning,
                "SCHEDULER_JOB_FAILED",
                json!({ "job": job.id, "error": error }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn morning_signal_fires_only_at_0935_weekday() {
        let job = &JOBS[0];
        assert!((job.matches)(time(9, 35), Weekday::Mon));
        assert!(!(job.matches)(time(9, 36), Weekday::Mon));
        assert!(!(job.matches)(time(9, 35), Weekday::Sat));
    }

    #[test]
    fn crash_day_poll_fires_every_15_minutes_in_window() {
        let job = &JOBS[1];
        assert!((job.matches)(time(9, 45), Weekday::Tue));
        assert!((job.matches)(time(10, 0), Weekday::Tue));
        assert!((job.matches)(time(11, 45), Weekday::Tue));
        assert!(!(job.matches)(time(11, 50), Weekday::Tue));
        assert!(!(job.matches)(time(9, 50), Weekday::Tue));
    }

    #[test]
    fn trailing_hedge_poll_fires_every_5_minutes_in_window() {
        let job = &JOBS[3];
        assert!((job.matches)(time(10, 0), Weekday::Wed));
        assert!((job.matches)(time(10, 5), Weekday::Wed));
        assert!((job.matches)(time(15, 50), Weekday::Wed));
        assert!(!(job.matches)(time(15, 51), Weekday::Wed));
        assert!(!(job.matches)(time(9, 59), Weekday::Wed));
    }

    #[test]
    fn position_close_fires_only_at_1555() {
        let job = &JOBS[4];
        assert!((job.matches)(time(15, 55), Weekday::Thu));
        assert!(!(job.matches)(time(15, 56), Weekday::Thu));
    }

    #[test]
    fn broker_token_renewal_fires_at_0800_weekday_only() {
        let job = &JOBS[5];
        assert!((job.matches)(time(8, 0), Weekday::Fri));
        assert!(!(job.matches)(time(8, 0), Weekday::Sun));
    }

    #[test]
    fn weekday_helper_excludes_weekend() {
        assert!(is_weekday(Weekday::Mon));
        assert!(!is_weekday(Weekday::Sat));
        assert!(!is_weekday(Weekday::Sun));
        let _ = NaiveDate::from_ymd_opt(2026, 7, 29);
    }

    #[test]
    fn heartbeat_fires_on_the_hour_every_day() {
        let job = &JOBS[6];
        assert!((job.matches)(time(9, 0), Weekday::Mon));
        assert!((job.matches)(time(9, 0), Weekday::Sat));
        assert!(!(job.matches)(time(9, 1), Weekday::Mon));
    }

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> chrono::DateTime<chrono_tz::Tz> {
        EXCHANGE_TZ
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn minutes_since_normal_tick_returns_just_the_new_minute() {
        let previous = dt(2026, 7, 29, 9, 34);
        let now_minute = dt(2026, 7, 29, 9, 35);
        let scanned = minutes_since(previous, now_minute);
        assert_eq!(scanned, vec![now_minute]);
    }

    #[test]
    fn minutes_since_first_scan_ever_returns_just_now() {
        let now_minute = dt(2026, 7, 29, 9, 35);
        // previous == now_minute models the "no prior scan" default used by
        // `minutes_to_scan` when `last_scan` is still `None`.
        let scanned = minutes_since(now_minute, now_minute);
        assert_eq!(scanned, vec![now_minute]);
    }

    #[test]
    fn minutes_since_missed_tick_replays_every_skipped_minute() {
        let previous = dt(2026, 7, 29, 9, 33);
        let now_minute = dt(2026, 7, 29, 9, 37);
        let scanned = minutes_since(previous, now_minute);
        assert_eq!(
            scanned,
            vec![
                dt(2026, 7, 29, 9, 34),
                dt(2026, 7, 29, 9, 35),
                dt(2026, 7, 29, 9, 36),
                dt(2026, 7, 29, 9, 37),
            ]
        );
    }

    #[test]
    fn lateness_of_is_zero_for_the_current_minute() {
        let now = dt(2026, 7, 29, 9, 35);
        assert_eq!(lateness_of(now, now), Duration::from_secs(0));
    }

    #[test]
    fn lateness_of_grows_with_replayed_backlog() {
        let now = dt(2026, 7, 29, 9, 40);
        let minute = dt(2026, 7, 29, 9, 35);
        assert_eq!(lateness_of(now, minute), Duration::from_secs(300));
    }

    #[test]
    fn a_replayed_minute_past_its_grace_window_would_be_dropped() {
        // crash_day_poll has a 120s grace; five minutes late blows through it.
        let job = &JOBS[1];
        let now = dt(2026, 7, 29, 9, 50);
        let minute = dt(2026, 7, 29, 9, 45);
        assert!((job.matches)(minute.time(), minute.weekday()));
        assert!(lateness_of(now, minute) > job.grace);
    }

    #[test]
    fn floor_to_minute_drops_seconds_and_sub_second_precision() {
        let with_seconds = EXCHANGE_TZ
            .with_ymd_and_hms(2026, 7, 29, 9, 35, 42)
            .single()
            .unwrap();
        let floored = floor_to_minute(with_seconds);
        assert_eq!(floored.second(), 0);
        assert_eq!(floored.minute(), 35);
    }
}
