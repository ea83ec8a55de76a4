//! Reference resolution cache
//!
//! Keeps the set of image names known to the asset store. The compiler never
//! consults it; it feeds the name selectors of program graphs, which are
//! reconciled against the fresh set after every refresh.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ImageAsset, RemoteCommandClient, Transport};
use crate::compiler::IMAGE_FIELD_BLOCKS;
use crate::errors::RemoteError;
use crate::graph::{FieldValue, ProgramGraph};

/// Structural change in an edited program graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphEvent {
    BlockCreated,
    BlockDeleted,
    FinishedLoading,
}

/// Asset store operations the cache depends on.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn list_images(&self) -> Result<Vec<ImageAsset>, RemoteError>;
    async fn upload_image(&self, name: &str, data_url: &str) -> Result<(), RemoteError>;
    async fn delete_image(&self, name: &str) -> Result<String, RemoteError>;
}

#[async_trait]
impl<T: Transport> ImageStore for RemoteCommandClient<T> {
    async fn list_images(&self) -> Result<Vec<ImageAsset>, RemoteError> {
        RemoteCommandClient::list_images(self).await
    }

    async fn upload_image(&self, name: &str, data_url: &str) -> Result<(), RemoteError> {
        RemoteCommandClient::upload_image(self, name, data_url).await
    }

    async fn delete_image(&self, name: &str) -> Result<String, RemoteError> {
        RemoteCommandClient::delete_image(self, name).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    pub interval: Duration,
    /// Quiet period after the last graph event before refreshing.
    pub debounce: Duration,
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            debounce: Duration::from_millis(100),
        }
    }
}

/// New value for a selector currently holding `selected`.
///
/// A name that still exists is kept, a vanished one is cleared, and an empty
/// selection stays empty.
pub fn reconcile_selection<'a>(selected: &'a str, known: &BTreeMap<String, ImageAsset>) -> &'a str {
    if selected.is_empty() || known.contains_key(selected) {
        selected
    } else {
        ""
    }
}

pub struct ReferenceCache<S> {
    store: Arc<S>,
    assets: RwLock<BTreeMap<String, ImageAsset>>,
    names: watch::Sender<Vec<String>>,
}

impl<S: ImageStore + 'static> ReferenceCache<S> {
    pub fn new(store: Arc<S>) -> Self {
        let (names, _rx) = watch::channel(Vec::new());
        Self {
            store,
            assets: RwLock::new(BTreeMap::new()),
            names,
        }
    }

    /// Replaces the known set with the store's current listing.
    ///
    /// Returns whether the set of names changed. On failure the previous set
    /// is kept.
    pub async fn refresh(&self) -> Result<bool, RemoteError> {
        let listing = self.store.list_images().await?;
        let assets: BTreeMap<String, ImageAsset> = listing
            .into_iter()
            .map(|asset| (asset.name.clone(), asset))
            .collect();
        let names: Vec<String> = assets.keys().cloned().collect();

        *self.assets.write().unwrap_or_else(PoisonError::into_inner) = assets;
        let changed = self.names.send_if_modified(|current| {
            if *current == names {
                false
            } else {
                *current = names;
                true
            }
        });
        debug!("Image references refreshed (changed: {})", changed);
        Ok(changed)
    }

    pub async fn upload(&self, name: &str, data_url: &str) -> Result<(), RemoteError> {
        self.store.upload_image(name, data_url).await?;
        info!("Uploaded image '{}'", name);
        self.refresh_logged().await;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<String, RemoteError> {
        let message = self.store.delete_image(name).await?;
        info!("Deleted image '{}'", name);
        self.refresh_logged().await;
        Ok(message)
    }

    async fn refresh_logged(&self) {
        if let Err(e) = self.refresh().await {
            warn!("Image list refresh failed: {}", e);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.names.borrow().clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.assets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ImageAsset> {
        self.assets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Notified with the sorted name list each time it changes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.names.subscribe()
    }

    /// Applies the selection merge rule to every image selector in `graph`.
    /// Returns how many selections were cleared.
    pub fn reconcile(&self, graph: &mut ProgramGraph) -> usize {
        let assets = self.assets.read().unwrap_or_else(PoisonError::into_inner);
        let mut cleared = 0;
        for field in graph.fields_mut(&IMAGE_FIELD_BLOCKS, "IMAGE_NAME") {
            let selected = field.as_text();
            if reconcile_selection(&selected, &assets) != selected {
                *field = FieldValue::Text(String::new());
                cleared += 1;
            }
        }
        cleared
    }

    /// Starts the background refresher.
    ///
    /// Refreshes immediately, then every `schedule.interval`, and once more
    /// `schedule.debounce` after the last event received on `events`. Runs
    /// until `cancel` fires.
    pub fn spawn_refresher(
        self: Arc<Self>,
        schedule: RefreshSchedule,
        mut events: mpsc::Receiver<GraphEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(schedule.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut events_open = true;
            let mut pending: Option<Instant> = None;

            loop {
                let deadline = pending;
                let debounce_elapsed = async move {
                    match deadline {
                        Some(deadline) => time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.refresh_logged().await,
                    event = events.recv(), if events_open => match event {
                        Some(event) => {
                            debug!("Graph event {:?}, scheduling refresh", event);
                            pending = Some(Instant::now() + schedule.debounce);
                        }
                        None => events_open = false,
                    },
                    _ = debounce_elapsed => {
                        pending = None;
                        self.refresh_logged().await;
                    }
                }
            }
            debug!("Image reference refresher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(names: &[&str]) -> BTreeMap<String, ImageAsset> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    ImageAsset {
                        name: n.to_string(),
                        created: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_reconcile_selection_rules() {
        let after = known(&["B", "C"]);
        assert_eq!(reconcile_selection("A", &after), "");
        assert_eq!(reconcile_selection("B", &after), "B");
        assert_eq!(reconcile_selection("", &after), "");
    }

    #[test]
    fn test_default_schedule() {
        let schedule = RefreshSchedule::default();
        assert_eq!(schedule.interval, Duration::from_secs(30));
        assert_eq!(schedule.debounce, Duration::from_millis(100));
    }
}
