use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time,
    time::{Duration, Instant},
};
use tracing::{event, Level};

use crate::{http::TongaHttpClient, models::FlagValue};

/// Usage counts keyed by flag name, then by the JSON rendering of the value
/// it resolved to. This is the wire shape of the `update_analytics` body.
pub(crate) type CountsByFlag = HashMap<String, HashMap<String, u64>>;

/// Counter of flag resolutions, written by the caller on every `get` and
/// drained by the background reporting task.
#[derive(Debug, Default)]
pub(crate) struct AnalyticsCounter {
    counts: CountsByFlag,
}

impl AnalyticsCounter {
    pub fn record(&mut self, flag: &str, value: &FlagValue) {
        *self
            .counts
            .entry(flag.to_owned())
            .or_default()
            .entry(value.to_json_string())
            .or_default() += 1;
    }

    /// Takes the accumulated counts, leaving the counter empty. Called under
    /// the lock so the network send can happen outside of it.
    pub fn detach(&mut self) -> CountsByFlag {
        std::mem::take(&mut self.counts)
    }

    /// Folds a detached batch back in after a failed report, so the counts
    /// ride the next interval instead of being lost.
    pub fn remerge(&mut self, batch: CountsByFlag) {
        for (flag, per_value) in batch {
            let flag_counts = self.counts.entry(flag).or_default();
            for (value, count) in per_value {
                *flag_counts.entry(value).or_default() += count;
            }
        }
    }
}

/// Background task reporting accumulated analytics to the server every
/// `report_interval`. Idle intervals produce no traffic. On stop the task
/// flushes whatever is left and exits; dropping the reporter without an
/// explicit shutdown closes the stop channel, which has the same effect,
/// except nothing awaits the final flush.
pub(crate) struct AnalyticsReporter {
    counter: Arc<Mutex<AnalyticsCounter>>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AnalyticsReporter {
    pub fn spawn(http_client: TongaHttpClient, report_interval: Duration) -> Self {
        let counter = Arc::new(Mutex::new(AnalyticsCounter::default()));
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(report_loop(
            http_client,
            Arc::clone(&counter),
            report_interval,
            stop_rx,
        ));
        Self {
            counter,
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn record(&self, flag: &str, value: &FlagValue) {
        self.counter
            .lock()
            .expect("should always be able to acquire the analytics lock")
            .record(flag, value);
    }

    /// Signals the loop to stop and waits for its final flush, bounded by
    /// `timeout`. Safe to call more than once.
    pub async fn shutdown(&mut self, timeout: Duration) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if time::timeout(timeout, handle).await.is_err() {
                event!(
                    Level::ERROR,
                    "analytics reporter did not stop within {:?}",
                    timeout
                );
            }
        }
    }
}

async fn report_loop(
    http_client: TongaHttpClient,
    counter: Arc<Mutex<AnalyticsCounter>>,
    report_interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let period = report_interval.max(Duration::from_millis(1));
    let mut interval = time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                event!(Level::DEBUG, "Flushing analytics");
                flush(&http_client, &counter).await;
            }
            _ = &mut stop_rx => break,
        }
    }
    // Flush any pending counts before exiting.
    flush(&http_client, &counter).await;
}

async fn flush(http_client: &TongaHttpClient, counter: &Arc<Mutex<AnalyticsCounter>>) {
    let batch = {
        counter
            .lock()
            .expect("should always be able to acquire the analytics lock")
            .detach()
    };
    if batch.is_empty() {
        return;
    }
    if let Err(e) = http_client.post_analytics(&batch).await {
        event!(Level::ERROR, "Failed to report analytics: {}", e);
        counter
            .lock()
            .expect("should always be able to acquire the analytics lock")
            .remerge(batch);
    }
}
