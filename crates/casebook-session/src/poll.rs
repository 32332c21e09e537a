//! Polling primitive shared by every synchronized resource.
//!
//! A loop issues its request immediately, hands the response to the caller,
//! and then waits for the next tick: either the interval elapses or, when a
//! trigger is attached, the trigger value changes. A zero interval runs a
//! single tick. The loop ends when the stop predicate accepts a response or
//! its cancellation token fires; nothing is delivered after cancellation.

use std::future::Future;
use std::time::Duration;

use casebook_api::ApiError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type StopPredicate<T> = Box<dyn FnMut(&T) -> bool + Send>;

pub struct PollOptions<T> {
    name: String,
    interval: Duration,
    trigger: Option<watch::Receiver<u64>>,
    stop_when: Option<StopPredicate<T>>,
}

impl<T> PollOptions<T> {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            trigger: None,
            stop_when: None,
        }
    }

    /// Any change of the watched counter forces one extra immediate tick,
    /// ordered after the tick in flight.
    pub fn with_trigger(mut self, trigger: watch::Receiver<u64>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Stops the loop after delivering a response the predicate accepts.
    pub fn stop_when<F>(mut self, predicate: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        self.stop_when = Some(Box::new(predicate));
        self
    }
}

/// Spawns a polling loop bound to `token`. The token is cancelled once the
/// loop ends for any reason, so a live token means a live loop.
pub fn poll<T, R, Fut, H, E>(
    token: CancellationToken,
    options: PollOptions<T>,
    request: R,
    on_response: H,
    on_error: E,
) -> JoinHandle<()>
where
    T: Send + 'static,
    R: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    H: FnMut(T) + Send + 'static,
    E: FnMut(ApiError) + Send + 'static,
{
    tokio::spawn(run(token, options, request, on_response, on_error))
}

async fn run<T, R, Fut, H, E>(
    token: CancellationToken,
    options: PollOptions<T>,
    mut request: R,
    mut on_response: H,
    mut on_error: E,
) where
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
    H: FnMut(T),
    E: FnMut(ApiError),
{
    let PollOptions {
        name,
        interval,
        mut trigger,
        mut stop_when,
    } = options;
    let _finished = token.clone().drop_guard();
    let mut tick: u64 = 0;

    loop {
        if let Some(trigger) = trigger.as_mut() {
            // Bumps arriving from here on schedule the next extra tick.
            trigger.borrow_and_update();
        }
        tick += 1;
        debug!(target: "casebook.poll", poll = %name, tick, "issuing request");

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            outcome = request() => outcome,
        };
        if token.is_cancelled() {
            break;
        }

        match outcome {
            Ok(response) => {
                let stop = stop_when
                    .as_mut()
                    .map(|predicate| predicate(&response))
                    .unwrap_or(false);
                on_response(response);
                if stop {
                    debug!(target: "casebook.poll", poll = %name, tick, "stop condition met");
                    break;
                }
            }
            Err(err) => on_error(err),
        }

        if interval.is_zero() {
            break;
        }
        if !wait_for_next_tick(&token, interval, &mut trigger).await {
            break;
        }
    }

    debug!(target: "casebook.poll", poll = %name, ticks = tick, "poll finished");
}

/// Returns `false` when the loop was cancelled while waiting.
async fn wait_for_next_tick(
    token: &CancellationToken,
    interval: Duration,
    trigger: &mut Option<watch::Receiver<u64>>,
) -> bool {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);

    loop {
        match trigger.as_mut() {
            Some(rx) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return false,
                    changed = rx.changed() => {
                        if changed.is_ok() {
                            return true;
                        }
                        // The signal owner is gone; fall back to the interval.
                        *trigger = None;
                    }
                    _ = &mut sleep => return true,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return false,
                    _ = &mut sleep => return true,
                }
            }
        }
    }
}
