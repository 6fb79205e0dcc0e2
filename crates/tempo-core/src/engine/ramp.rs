use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::aggregator::Aggregator;
use crate::engine::virtual_user::{run_virtual_user, RequestTemplate};
use crate::store::Store;

const TICK: Duration = Duration::from_millis(100);

/// Launches virtual users to approximate a linear ramp from 0 to `users`
/// over `ramp_up_secs` seconds (§4.5), returning the join handles of every
/// user task spawned. If `ramp_up_secs == 0`, all users launch immediately.
#[allow(clippy::too_many_arguments)]
pub async fn run_ramp(
    users: u32,
    ramp_up_secs: u32,
    rate_per_sec: u32,
    run_key: i64,
    client: Arc<reqwest::Client>,
    template: Arc<RequestTemplate>,
    aggregator: Arc<Aggregator>,
    store: Arc<Store>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(users as usize);
    let spawn_one = |handles: &mut Vec<JoinHandle<()>>| {
        let client = Arc::clone(&client);
        let template = Arc::clone(&template);
        let aggregator = Arc::clone(&aggregator);
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_virtual_user(
                client,
                template,
                rate_per_sec,
                run_key,
                aggregator,
                store,
                cancel,
            )
            .await;
        }));
    };

    if ramp_up_secs == 0 || users == 0 {
        for _ in 0..users {
            spawn_one(&mut handles);
        }
        return handles;
    }

    let start = Instant::now();
    let ramp_duration = Duration::from_secs(ramp_up_secs as u64);
    let mut started: u32 = 0;
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if cancel.is_cancelled() || started >= users {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let elapsed = start.elapsed();
                let target = if elapsed >= ramp_duration {
                    users
                } else {
                    let t = elapsed.as_secs_f64();
                    let r = ramp_up_secs as f64;
                    ((t * users as f64 / r).floor() as u32).min(users)
                };
                while started < target {
                    spawn_one(&mut handles);
                    started += 1;
                }
                if elapsed >= ramp_duration {
                    break;
                }
            }
        }
    }

    handles
}
