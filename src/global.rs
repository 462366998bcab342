//! Process-wide broker instance.
//!
//! The surrounding system constructs one broker per process, gated by the
//! `V3_ENABLED` environment variable. Construction also starts the requeue
//! workers, so teardown must go through [`shutdown`].

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::broker::Marqs;
use crate::config::MarqsConfig;
use crate::error::{MarqsError, MarqsResult};

static INSTANCE: OnceCell<Option<Arc<Marqs>>> = OnceCell::const_new();

/// The process-wide broker, constructed once from the environment.
/// Returns `None` when `V3_ENABLED` is not `"true"`.
pub async fn marqs() -> MarqsResult<Option<Arc<Marqs>>> {
    let slot = INSTANCE
        .get_or_try_init(|| async {
            let config = MarqsConfig::from_env()?;
            if !config.enabled {
                tracing::info!("marqs is disabled; set V3_ENABLED=true to enable");
                return Ok::<_, MarqsError>(None);
            }
            let broker = Marqs::builder(config).build().await?;
            Ok(Some(Arc::new(broker)))
        })
        .await?;
    Ok(slot.clone())
}

/// Stop the global instance's requeue workers, if it was ever constructed.
pub async fn shutdown() {
    if let Some(Some(broker)) = INSTANCE.get() {
        broker.shutdown().await;
    }
}
