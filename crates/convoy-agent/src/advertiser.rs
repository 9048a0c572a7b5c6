//! Periodic target advertisement.
//!
//! The first advertisement is what creates the target on the manager; the
//! periodic repeats keep `updated_at` fresh and pick up tag changes.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use convoy_model::{TargetAdvertisement, TargetId, Topic};
use convoy_pipe::{AgentSender, Message};

/// Advertise `target` on the advertisement topic until cancelled.
pub async fn run(
    target_id: TargetId,
    tags: Vec<String>,
    sender: AgentSender,
    interval: Duration,
    cancel: CancellationToken,
) {
    let advertisement = TargetAdvertisement {
        id: target_id,
        tags,
    };

    loop {
        match Message::json(&Topic::Advertisement, &advertisement) {
            Ok(message) => {
                if sender.send(message).await.is_err() {
                    warn!("pipe closed, advertiser stopping");
                    return;
                }
                debug!(target_id = %advertisement.id, "advertised");
            }
            Err(e) => warn!(error = %e, "unable to encode advertisement"),
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
