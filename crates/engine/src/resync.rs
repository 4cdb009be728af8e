use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::Command;

/// Ask the dispatcher for a resync every `every` until cancelled. A tick that lands while a pass is
/// still running is skipped by the dispatcher.
pub(crate) async fn run_periodic(cmd: mpsc::Sender<Command>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; the initial list triggers its own pass
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if cmd.send(Command::Resync(None)).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("periodic resync stopped");
}
