use std::future::Future;

use chrono::{Local, NaiveDateTime, NaiveTime};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Run `job` now and then every `period` until cancelled. A slow job delays
/// the following ticks instead of bunching them up.
pub async fn repeating_loop<F, Fut>(
    name: String,
    period: Duration,
    job: F,
    cancel_token: CancellationToken,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // A started job always runs to completion; cancellation is only
            // observed between ticks.
            _ = ticker.tick() => job().await,
            _ = cancel_token.cancelled() => {
                log_info!("{name} loop shutting down");
                break;
            }
        }
    }
}

/// Next local wall-clock instant at `at`, strictly after `now`.
pub fn next_run(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

/// Run `job` once a day at local time `at` until cancelled.
pub async fn daily_loop<F, Fut>(name: String, at: NaiveTime, job: F, cancel_token: CancellationToken)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut last_target: Option<NaiveDateTime> = None;

    loop {
        let now = Local::now().naive_local();
        let mut target = next_run(now, at);
        // The timer can wake a hair before the wall clock reaches the
        // target; never aim at the same slot twice.
        if let Some(previous) = last_target {
            if target <= previous {
                target = previous + chrono::Duration::days(1);
            }
        }
        let wait = (target - now)
            .to_std()
            .unwrap_or_else(|_| Duration::from_secs(0));
        log_info!("{name} next run at {target}");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                last_target = Some(target);
                job().await;
            }
            _ = cancel_token.cancelled() => {
                log_info!("{name} loop shutting down");
                break;
            }
        }
    }
}
