//! Named one-shot and periodic timers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, info, warn};

use crate::app::Application;

/// Work run on an interval.
///
/// A periodic timer ticks every [`interval`](Timer::interval) until
/// [`Application::stop_timer`] is called with its name. A non-periodic one
/// runs once, one interval after it was started.
#[async_trait]
pub trait Timer: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self, app: &Application);

    fn interval(&self) -> Duration;

    fn is_periodic(&self) -> bool { true }

    /// Periodic timers only: also run once as part of starting.
    fn is_immediate(&self) -> bool { false }
}

struct TimerJob {
    id: u64,
    stop: mpsc::Sender<()>,
}

/// Running periodic timers, by name.
#[derive(Default)]
pub(crate) struct TimerRegistry {
    jobs: RwLock<HashMap<String, TimerJob>>,
    next_id: AtomicU64,
}

impl Application {
    /// Starts `timer`.
    ///
    /// An immediate timer's first run completes before this returns.
    /// Starting a periodic timer under a name already running stops the
    /// older one.
    pub async fn start_timer(&self, timer: Arc<dyn Timer>) {
        let interval = timer.interval();
        if interval.is_zero() {
            warn!(timer = timer.name(), "timer interval is zero, not started");
            return;
        }

        if !timer.is_periodic() {
            let app = self.clone();
            tokio::spawn(
                async move {
                    tokio::time::sleep(interval).await;
                    timer.run(&app).await;
                }
                .in_current_span(),
            );
            return;
        }

        if timer.is_immediate() {
            timer.run(self).await;
        }

        let name = timer.name().to_owned();
        let id = self.timers().next_id.fetch_add(1, Ordering::Relaxed);
        let (stop, mut stopped) = mpsc::channel(1);
        if let Some(previous) = self.timers().jobs.write().insert(name.clone(), TimerJob { id, stop }) {
            warn!(timer = %name, "timer restarted, stopping the previous one");
            let _ = previous.stop.try_send(());
        }

        let app = self.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = stopped.recv() => break,
                        _ = ticker.tick() => timer.run(&app).await,
                    }
                }

                {
                    let mut jobs = app.timers().jobs.write();
                    if jobs.get(&name).is_some_and(|job| job.id == id) {
                        jobs.remove(&name);
                    }
                }
                info!(timer = %name, "timer stopped");
            }
            .in_current_span(),
        );
    }

    /// Stops the periodic timer `name`. A run already in progress finishes.
    ///
    /// Returns false if no such timer is running.
    pub fn stop_timer(&self, name: &str) -> bool {
        match self.timers().jobs.read().get(name) {
            Some(job) => {
                let _ = job.stop.try_send(());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::config::Config;

    struct Ticker {
        interval: Duration,
        periodic: bool,
        immediate: bool,
        runs: AtomicUsize,
    }

    impl Ticker {
        fn new(interval_ms: u64, periodic: bool, immediate: bool) -> Arc<Self> {
            Arc::new(Self {
                interval: Duration::from_millis(interval_ms),
                periodic,
                immediate,
                runs: AtomicUsize::new(0),
            })
        }

        fn runs(&self) -> usize { self.runs.load(Ordering::SeqCst) }
    }

    #[async_trait]
    impl Timer for Ticker {
        fn name(&self) -> &str { "ticker" }
        async fn run(&self, _: &Application) { self.runs.fetch_add(1, Ordering::SeqCst); }
        fn interval(&self) -> Duration { self.interval }
        fn is_periodic(&self) -> bool { self.periodic }
        fn is_immediate(&self) -> bool { self.immediate }
    }

    fn app() -> Application {
        Application::new(Config::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_ticks_until_stopped() {
        let app = app();
        let ticker = Ticker::new(10, true, false);
        app.start_timer(ticker.clone()).await;
        assert_eq!(ticker.runs(), 0);

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(ticker.runs(), 3);

        assert!(app.stop_timer("ticker"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticker.runs(), 3);
        assert!(!app.stop_timer("ticker"));
    }

    struct Slow {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl Timer for Slow {
        fn name(&self) -> &str { "slow" }

        async fn run(&self, _: &Application) {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(25)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        fn interval(&self) -> Duration { Duration::from_millis(10) }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_a_run_lets_it_finish_and_starts_no_other() {
        let app = app();
        let slow = Arc::new(Slow { started: AtomicUsize::new(0), finished: AtomicUsize::new(0) });
        app.start_timer(slow.clone()).await;

        // First run starts at 10ms and sleeps across the 20ms and 30ms ticks.
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(slow.started.load(Ordering::SeqCst), 1);
        assert_eq!(slow.finished.load(Ordering::SeqCst), 0);

        assert!(app.stop_timer("slow"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(slow.started.load(Ordering::SeqCst), 1);
        assert_eq!(slow.finished.load(Ordering::SeqCst), 1);
        assert!(!app.stop_timer("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_timer_runs_before_start_returns() {
        let app = app();
        let ticker = Ticker::new(10, true, true);
        app.start_timer(ticker.clone()).await;
        assert_eq!(ticker.runs(), 1);

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(ticker.runs(), 2);
        app.stop_timer("ticker");
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_timer_runs_once() {
        let app = app();
        let ticker = Ticker::new(10, false, false);
        app.start_timer(ticker.clone()).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticker.runs(), 1);
        assert!(!app.stop_timer("ticker"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_not_started() {
        let app = app();
        let ticker = Ticker::new(0, true, true);
        app.start_timer(ticker.clone()).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticker.runs(), 0);
    }

    #[test]
    fn stopping_an_unknown_timer_is_ignored() {
        assert!(!app().stop_timer("nope"));
    }
}
