//! Kubernetes Record Store
//!
//! Backs the record store with cluster-scoped custom resources. Lists are
//! served from a reflector cache kept current by a watch; reads that feed
//! a write go to the API server so retries see the latest version.

use crate::crd::Record;
use crate::domain::ports::RecordStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Record store backed by the Kubernetes API
pub struct KubeRecordStore<K>
where
    K: Record + Serialize + DeserializeOwned,
{
    api: Api<K>,
    reader: Store<K>,
    synced: watch::Receiver<bool>,
}

impl<K> KubeRecordStore<K>
where
    K: Record + Serialize + DeserializeOwned,
{
    /// Start the reflector for `K` and return the store.
    ///
    /// The watch runs until `shutdown` is cancelled.
    pub fn spawn(client: Client, shutdown: CancellationToken) -> Arc<Self> {
        let api: Api<K> = Api::all(client);
        let (reader, writer) = reflector::store::<K>();
        let (synced_tx, synced) = watch::channel(false);

        let stream = reflector::reflector(
            writer,
            watcher(api.clone(), watcher::Config::default()),
        )
        .default_backoff();

        tokio::spawn(async move {
            let kind = K::kind_name();
            info!("Starting {} watch", kind);
            futures::pin_mut!(stream);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Stopping {} watch", kind);
                        break;
                    }
                    event = stream.next() => match event {
                        Some(Ok(watcher::Event::Restarted(objects))) => {
                            debug!("{} cache relisted with {} objects", kind, objects.len());
                            let _ = synced_tx.send(true);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!("{} watch error: {}", kind, e),
                        None => {
                            warn!("{} watch stream ended", kind);
                            break;
                        }
                    }
                }
            }
        });

        Arc::new(Self { api, reader, synced })
    }

    fn map_write_error(e: kube::Error, name: &str, creating: bool) -> Error {
        match &e {
            kube::Error::Api(resp) if resp.code == 409 && creating => Error::ResourceExists {
                kind: K::kind_name(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: K::kind_name(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
                kind: K::kind_name(),
                name: name.to_string(),
            },
            _ => Error::Kube(e),
        }
    }
}

#[async_trait]
impl<K> RecordStore<K> for KubeRecordStore<K>
where
    K: Record + Serialize + DeserializeOwned,
{
    async fn wait_for_sync(&self) -> Result<()> {
        let mut synced = self.synced.clone();
        synced
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| Error::StoreNotSynced(K::kind_name()))?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<K>> {
        if !*self.synced.borrow() {
            return Err(Error::StoreNotSynced(K::kind_name()));
        }
        Ok(self
            .reader
            .state()
            .into_iter()
            .map(|obj| obj.as_ref().clone())
            .collect())
    }

    async fn create(&self, record: &K) -> Result<K> {
        let name = record.record_name();
        self.api
            .create(&PostParams::default(), record)
            .await
            .map_err(|e| Self::map_write_error(e, &name, true))
    }

    async fn update(&self, record: &K) -> Result<K> {
        let name = record.record_name();
        self.api
            .replace(&name, &PostParams::default(), record)
            .await
            .map_err(|e| Self::map_write_error(e, &name, false))
    }

    async fn update_status(&self, record: &K) -> Result<K> {
        let name = record.record_name();
        let body = serde_json::to_vec(record)?;
        self.api
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| Self::map_write_error(e, &name, false))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Self::map_write_error(e, name, false))?;
        Ok(())
    }
}
