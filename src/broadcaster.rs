use std::sync::Arc;
use chrono::{SecondsFormat, Utc};
use log::{debug, warn};

use crate::client::DeliveryError;
use crate::envelope::Envelope;
use crate::registry::Registry;

/// Outcome of one broadcast, for logging and tests. The sender never sees it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Members whose queue was full; they stay registered.
    pub dropped: usize,
    /// Members whose connection is gone; they are being unregistered.
    pub failed: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Broadcaster { registry }
    }

    /// Deliver `envelope` to every member of its targeted room, sender
    /// included. Unknown rooms swallow the message.
    pub async fn broadcast(&self, mut envelope: Envelope) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let Some(room) = self.registry.room(&envelope.targeted_room).await else {
            debug!("Dropping message for unknown room {}", envelope.targeted_room);
            return report;
        };

        envelope.timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        for (nickname, member) in room.snapshot().await {
            let Some(client) = member.upgrade() else {
                debug!("{} vanished before delivery in {}", nickname, room.name());
                report.failed += 1;
                continue;
            };

            match client.deliver(envelope.clone()) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Full) => {
                    warn!("Outbound queue full for {}, message dropped", nickname);
                    report.dropped += 1;
                }
                Err(DeliveryError::Closed) => {
                    warn!("Delivery to {} failed, unregistering", nickname);
                    report.failed += 1;
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        registry.unregister_client(&client).await;
                    });
                }
            }
        }

        debug!(
            "Broadcast in {}: {} delivered, {} dropped, {} failed",
            room.name(),
            report.delivered,
            report.dropped,
            report.failed
        );
        report
    }
}
