use tracing::{info, warn};
use upload_queue::UploadQueue;

/// Waits for the queue to go idle, then requeues failed uploads up to
/// `retries` times. Stops early once nothing has failed. Returns how many
/// retry rounds ran.
pub async fn drain(queue: &UploadQueue, retries: u32) -> u32 {
    queue.wait_until_idle().await;
    let mut rounds = 0;
    while rounds < retries && queue.stats().failed > 0 {
        rounds += 1;
        let requeued = queue.retry_failed();
        info!(round = rounds, requeued, "retrying failed uploads");
        queue.wait_until_idle().await;
    }
    rounds
}

/// Aborts every upload in flight and empties the queue. Returns how many
/// uploads were cut off.
pub fn interrupt(queue: &UploadQueue) -> usize {
    let in_flight = queue.stats().active;
    queue.clear_queue();
    warn!(cancelled = in_flight, "interrupted, in-flight uploads aborted");
    in_flight
}

#[cfg(test)]
#[path = "tests/run_tests.rs"]
mod tests;
