use crate::config::{Config, EnvironmentConfig};
use bigsegments::store::{self, BigSegmentStore, StoreError, now_unix_millis};
use bigsegments::synchronizer::{Synchronizer, SynchronizerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Big segment data older than this counts as stale for health reporting.
const STALE_AFTER: Duration = Duration::from_secs(120);

/// One configured environment: its optional big segment store and the
/// synchronizer bound to it.
///
/// The synchronizer is not started at construction. The flag/segment data
/// plane calls [`note_big_segment_reference`] the first time streamed data
/// actually references a big segment, and synchronization begins then.
/// Environments that never use big segments never open an upstream
/// connection.
///
/// [`note_big_segment_reference`]: Environment::note_big_segment_reference
pub struct Environment {
    name: String,
    store: Option<Arc<dyn BigSegmentStore>>,
    synchronizer: Option<Synchronizer>,
    big_segment_seen: AtomicBool,
}

/// Health snapshot reported upstream for one environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigSegmentsStatus {
    /// A full catch-up cycle has completed since this process started.
    pub available: bool,
    /// The synchronized timestamp is missing or too old to trust.
    pub stale: bool,
}

impl Environment {
    pub async fn new(
        config: &EnvironmentConfig,
        relay_config: &Config,
        client: reqwest::Client,
    ) -> Result<Self, StoreError> {
        let store = store::create_store(config.big_segments.as_ref()).await?;

        let synchronizer = match &store {
            Some(store) => {
                let mut sync_config = SynchronizerConfig::new(
                    &relay_config.base_uri,
                    &relay_config.stream_uri,
                    &config.sdk_key,
                );
                sync_config.trace_logging = relay_config.trace_logging;

                let (synchronizer, mut updates) =
                    Synchronizer::new(sync_config, store.clone(), client);

                // The synchronizer blocks publishing once this channel
                // fills, so it must always be drained.
                let environment = config.name.clone();
                tokio::spawn(async move {
                    while let Some(segment_keys) = updates.recv().await {
                        tracing::debug!(
                            environment = %environment,
                            segments = segment_keys.len(),
                            "Big segment data updated"
                        );
                    }
                });

                Some(synchronizer)
            }
            None => None,
        };

        Ok(Environment {
            name: config.name.clone(),
            store,
            synchronizer,
            big_segment_seen: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Called by the flag/segment data path when streamed data references a
    /// big segment. The first call starts synchronization; every later call
    /// is a no-op, so the data path needs no coordination of its own.
    pub fn note_big_segment_reference(&self) {
        if self.big_segment_seen.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(synchronizer) = &self.synchronizer {
            tracing::debug!(environment = %self.name, "Big segment referenced; starting synchronizer");
            synchronizer.start();
        } else {
            tracing::warn!(
                environment = %self.name,
                "Streamed data references a big segment but no store is configured"
            );
        }
    }

    pub async fn big_segments_status(&self) -> BigSegmentsStatus {
        let available = self
            .synchronizer
            .as_ref()
            .is_some_and(Synchronizer::has_synced);

        let stale = match &self.store {
            Some(store) => match store.get_synchronized_on().await {
                Ok(Some(timestamp)) => {
                    now_unix_millis().saturating_sub(timestamp) > STALE_AFTER.as_millis() as u64
                }
                Ok(None) => true,
                Err(err) => {
                    tracing::warn!(
                        environment = %self.name,
                        error = %err,
                        "Failed to read synchronized timestamp"
                    );
                    true
                }
            },
            // No store configured: nothing can go stale.
            None => false,
        };

        BigSegmentsStatus { available, stale }
    }

    pub async fn shutdown(&self) {
        if let Some(synchronizer) = &self.synchronizer {
            synchronizer.close();
        }
        if let Some(store) = &self.store {
            if let Err(err) = store.close().await {
                tracing::warn!(environment = %self.name, error = %err, "Error closing store");
            }
        }
        tracing::debug!(environment = %self.name, "Environment shut down");
    }
}
