//! # Container Monitor
//!
//! A jail has no process the driver could wait on, so termination is found
//! by polling: every tick the monitor asks `jls` whether the jail is still
//! listed. The first poll that no longer lists it marks the task Exited and
//! ends the monitor. A failed `jls` invocation says nothing about the jail
//! and is only logged.
//!
//! Time is injected through [`Ticker`] and [`Clock`] so tests can step the
//! monitor deterministically.

use crate::driver::{ExitResult, TaskHandle};
use crate::jail::JailControl;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Source of poll ticks.
#[async_trait]
pub trait Ticker: Send {
    /// Waits for the next tick.
    async fn tick(&mut self);
}

/// Source of timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Builds one ticker per monitor.
pub type TickerFactory = Arc<dyn Fn() -> Box<dyn Ticker> + Send + Sync>;

/// [`Ticker`] over `tokio::time::interval`. The first tick is immediate.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    /// Factory producing interval tickers of `period`.
    pub fn factory(period: Duration) -> TickerFactory {
        Arc::new(move || Box::new(IntervalTicker::new(period)) as Box<dyn Ticker>)
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Why a monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The jail disappeared and the task was marked Exited.
    Exited,
    /// The task was destroyed or the driver shut down.
    Cancelled,
}

/// Watches one jail until it disappears.
pub struct ContainerMonitor {
    handle: Arc<TaskHandle>,
    jail: Arc<JailControl>,
    ticker: Box<dyn Ticker>,
    clock: Arc<dyn Clock>,
}

impl ContainerMonitor {
    pub fn new(
        handle: Arc<TaskHandle>,
        jail: Arc<JailControl>,
        ticker: Box<dyn Ticker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            handle,
            jail,
            ticker,
            clock,
        }
    }

    /// Runs the monitor on its own task.
    pub fn spawn(self) -> JoinHandle<MonitorExit> {
        tokio::spawn(self.run())
    }

    /// Polls until the jail is gone or the handle is cancelled.
    pub async fn run(mut self) -> MonitorExit {
        let cancel = self.handle.cancel_token().clone();
        let name = self.handle.container_name().to_string();
        debug!("monitoring jail {}", name);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.ticker.tick() => {}
            }

            let active = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                active = self.jail.is_active(&name) => active,
            };

            match active {
                Ok(true) => continue,
                Ok(false) => {
                    match self
                        .handle
                        .mark_exited(self.clock.now(), ExitResult::default())
                    {
                        Ok(true) => info!(task_id = %self.handle.id(), "Jail {} exited", name),
                        Ok(false) => {}
                        Err(e) => error!("failed to record exit of jail {}: {}", name, e),
                    }
                    return MonitorExit::Exited;
                }
                Err(e) => warn!("jls query for {} failed: {}", name, e),
            }
        }

        debug!("monitor for jail {} cancelled", name);
        MonitorExit::Cancelled
    }
}
