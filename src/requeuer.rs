//! Visibility-timeout requeueing.
//!
//! Each worker polls the visibility ZSET for leases whose deadline has
//! passed and hands the messages back to their queues via the nack script,
//! scored with their original enqueue timestamp so late messages land at
//! the head. Workers run independently; overlap between them (or with an
//! explicit consumer nack) is safe because nack is a no-op for ids that are
//! no longer leased.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::broker::now_ms;
use crate::config::MarqsConfig;
use crate::error::MarqsResult;
use crate::keys::KeyProducer;
use crate::message::MessagePayload;
use crate::store::{NackKeys, QueueStore};

/// Background workers owned by the broker; stopped on teardown.
pub(crate) struct Requeuer {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Requeuer {
    pub fn start(
        store: Arc<dyn QueueStore>,
        keys: Arc<dyn KeyProducer>,
        config: &MarqsConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let interval = config.requeue_interval;
        let batch_size = config.requeue_batch_size;

        let handles = (0..config.workers.max(1))
            .map(|worker_id| {
                let store = store.clone();
                let keys = keys.clone();
                let mut shutdown_rx = shutdown_tx.subscribe();

                tokio::spawn(async move {
                    debug!(worker_id, "requeue worker started");
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {}
                            _ = shutdown_rx.changed() => break,
                        }

                        match sweep(store.as_ref(), keys.as_ref(), batch_size).await {
                            Ok(0) => {}
                            Ok(count) => debug!(worker_id, count, "requeued expired messages"),
                            Err(e) => error!(worker_id, error = %e, "requeue sweep failed"),
                        }
                    }
                    debug!(worker_id, "requeue worker stopped");
                })
            })
            .collect();

        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Non-blocking shutdown signal, usable from `Drop`.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal and wait for every worker to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn sweep(
    store: &dyn QueueStore,
    keys: &dyn KeyProducer,
    batch_size: usize,
) -> MarqsResult<usize> {
    let visibility = keys.visibility_queue_key();
    let due = store
        .visibility_due(&visibility, now_ms(), batch_size)
        .await?;

    let mut requeued = 0;
    for message_id in due {
        let message_key = keys.message_key(&message_id);

        let Some(raw) = store.read_message(&message_key).await? else {
            error!(message_id = %message_id, "expired lease with no message body, dropping");
            store.remove_from_visibility(&visibility, &message_id).await?;
            continue;
        };

        let payload: MessagePayload = match serde_json::from_str(&raw) {
            Ok(payload) => payload,
            Err(e) => {
                // Removing the id here breaks what would otherwise be a
                // tight redelivery loop on a garbled body.
                error!(message_id = %message_id, error = %e, "expired lease with unparsable body, dropping");
                store.remove_from_visibility(&visibility, &message_id).await?;
                continue;
            }
        };

        let nack_keys = NackKeys {
            queue: payload.queue.clone(),
            shared_parent: keys.shared_queue_key(),
            env_parent: keys.env_shared_queue_key_from_queue(&payload.queue),
            visibility: visibility.clone(),
            queue_current_concurrency: keys.current_concurrency_key_from_queue(&payload.queue),
            env_current_concurrency: keys.env_current_concurrency_key_from_queue(&payload.queue),
            org_current_concurrency: keys.org_current_concurrency_key_from_queue(&payload.queue),
        };

        if store
            .nack(&nack_keys, &message_id, payload.timestamp)
            .await?
        {
            requeued += 1;
        }
    }

    Ok(requeued)
}
