//! Notification delivery
//!
//! The pipeline appends notifications to the manifest; the bot-owning
//! instance forwards unacknowledged ones to the chat and marks them
//! acknowledged. A blocking notification carries the approval keyboard and
//! registers a pending approval; the decision pressed in the chat is
//! written back into the manifest for the pipeline (and the operator's
//! audit trail) to read.

use std::sync::Arc;
use steward_core::manifest::ManifestStore;
use steward_core::Result;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalDecision, ApprovalManager};
use crate::client::BotClient;

/// Send every unacknowledged notification, oldest first
///
/// Returns how many were delivered. Acknowledgement is written back only
/// after a successful send, so a failed delivery is retried next flush.
pub async fn flush_notifications(
    client: &BotClient,
    chat_id: i64,
    store: &Arc<ManifestStore>,
    approvals: &ApprovalManager,
) -> Result<usize> {
    let manifest = store.read()?;
    let unsent: Vec<(usize, String, bool, Option<String>)> = manifest
        .notifications
        .iter()
        .enumerate()
        .filter(|(_, n)| !n.acknowledged)
        .map(|(i, n)| (i, n.message.clone(), n.blocking, n.resource.clone()))
        .collect();
    if unsent.is_empty() {
        return Ok(0);
    }

    let mut delivered = Vec::new();
    for (index, message, blocking, resource) in unsent {
        if blocking {
            let resource = resource.unwrap_or_else(|| format!("note-{}", index));
            client
                .send_with_keyboard(chat_id, &message, &ApprovalDecision::keyboard_for(&resource))
                .await?;
            register_approval(client, chat_id, store, approvals, resource);
        } else {
            client.send_message(chat_id, &message).await?;
        }
        delivered.push(index);
    }

    debug!("Delivered {} notifications", delivered.len());
    store.update(|m| {
        for index in &delivered {
            if let Some(notification) = m.notifications.get_mut(*index) {
                notification.acknowledged = true;
            }
        }
    })?;
    Ok(delivered.len())
}

/// Track one pending approval: remind the chat if nobody answers, and
/// persist the decision once a button press resolves it
fn register_approval(
    client: &BotClient,
    chat_id: i64,
    store: &Arc<ManifestStore>,
    approvals: &ApprovalManager,
    resource: String,
) {
    let remind_client = client.clone();
    let remind_message = format!("Still waiting on a decision for {}", resource);
    let rx = approvals.request(&resource, move || {
        tokio::spawn(async move {
            let _ = remind_client.send_message(chat_id, &remind_message).await;
        });
    });

    let store = store.clone();
    tokio::spawn(async move {
        // Sender dropped (superseded request) means no decision arrives
        let Ok(decision) = rx.await else {
            return;
        };
        info!("Decision for {}: {}", resource, decision.as_str());
        let write = store.update(|m| {
            m.extra.insert(
                format!("approval:{}", resource),
                serde_json::Value::String(decision.as_str().to_string()),
            );
        });
        if let Err(e) = write {
            warn!("Could not persist decision for {}: {}", resource, e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolved_approval_lands_in_the_manifest() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ManifestStore::new(dir.path().join("manifest.json")));
        let approvals = ApprovalManager::new(Duration::from_secs(1800));
        let client = BotClient::new("unused-token");

        register_approval(&client, 1, &store, &approvals, "stripe".to_string());
        assert!(approvals.resolve("stripe", ApprovalDecision::UseFixture));

        // The persisting task runs off the resolved oneshot
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let manifest = store.read().unwrap();
            if let Some(value) = manifest.extra.get("approval:stripe") {
                assert_eq!(value, &serde_json::Value::String("use-fixture".to_string()));
                return;
            }
        }
        panic!("decision was never persisted");
    }
}
