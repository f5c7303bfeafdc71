//! Kubernetes watches feeding the cluster index.
//!
//! One watch per kind (Services, Endpoints, Pods). Initial lists and relists
//! after a watch restart are buffered and applied in one step when the list
//! completes, so readers never see a half-rebuilt kind.

use futures::StreamExt;
use k8s_openapi::api::core::v1 as core;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KubernetesConfig;
use crate::error::DnsError;
use crate::index::{ClusterIndex, ObjectKind};
use crate::metrics::{self, WatchEventType};
use crate::model::{Endpoints, ObjectKey, Pod, Service};

/// An index object built from a watched Kubernetes resource.
pub trait Indexed: Sized + Send + 'static {
    /// The watched resource type.
    type Resource: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static;

    /// Kind used for readiness tracking, logs and metrics.
    const KIND: ObjectKind;

    /// Convert a watched resource.
    fn from_resource(resource: &Self::Resource) -> Result<Self, DnsError>;

    /// Insert or update in the index.
    fn upsert(index: &ClusterIndex, object: Self);

    /// Remove from the index.
    fn remove(index: &ClusterIndex, key: &ObjectKey);

    /// Replace every object of this kind.
    fn replace(index: &ClusterIndex, objects: Vec<Self>);
}

impl Indexed for Service {
    type Resource = core::Service;
    const KIND: ObjectKind = ObjectKind::Service;

    fn from_resource(resource: &core::Service) -> Result<Self, DnsError> {
        Service::try_from(resource)
    }

    fn upsert(index: &ClusterIndex, object: Self) {
        index.upsert_service(object);
    }

    fn remove(index: &ClusterIndex, key: &ObjectKey) {
        index.remove_service(key);
    }

    fn replace(index: &ClusterIndex, objects: Vec<Self>) {
        index.replace_services(objects);
    }
}

impl Indexed for Endpoints {
    type Resource = core::Endpoints;
    const KIND: ObjectKind = ObjectKind::Endpoints;

    fn from_resource(resource: &core::Endpoints) -> Result<Self, DnsError> {
        Endpoints::try_from(resource)
    }

    fn upsert(index: &ClusterIndex, object: Self) {
        index.upsert_endpoints(object);
    }

    fn remove(index: &ClusterIndex, key: &ObjectKey) {
        index.remove_endpoints(key);
    }

    fn replace(index: &ClusterIndex, objects: Vec<Self>) {
        index.replace_endpoints(objects);
    }
}

impl Indexed for Pod {
    type Resource = core::Pod;
    const KIND: ObjectKind = ObjectKind::Pod;

    fn from_resource(resource: &core::Pod) -> Result<Self, DnsError> {
        Pod::try_from(resource)
    }

    fn upsert(index: &ClusterIndex, object: Self) {
        index.upsert_pod(object);
    }

    fn remove(index: &ClusterIndex, key: &ObjectKey) {
        index.remove_pod(key);
    }

    fn replace(index: &ClusterIndex, objects: Vec<Self>) {
        index.replace_pods(objects);
    }
}

/// Objects received during an in-progress (re)list.
pub struct Relist<T> {
    buffer: Option<Vec<T>>,
}

impl<T> Default for Relist<T> {
    fn default() -> Self {
        Self { buffer: None }
    }
}

fn key_of<K: Resource>(resource: &K) -> ObjectKey {
    ObjectKey::new(
        resource.meta().namespace.as_deref().unwrap_or_default(),
        resource.meta().name.as_deref().unwrap_or_default(),
    )
}

/// Apply one watch event to the index.
pub fn handle_event<T: Indexed>(
    index: &ClusterIndex,
    relist: &mut Relist<T>,
    event: Event<T::Resource>,
) {
    let kind = T::KIND.as_str();
    match event {
        Event::Init => {
            debug!(kind, "list started");
            metrics::record_watch_event(kind, WatchEventType::Init);
            relist.buffer = Some(Vec::new());
        }
        Event::InitApply(resource) => match T::from_resource(&resource) {
            Ok(object) => {
                metrics::record_watch_event(kind, WatchEventType::InitApply);
                relist.buffer.get_or_insert_with(Vec::new).push(object);
            }
            Err(e) => {
                warn!(kind, object = %key_of(&resource), error = %e, "skipping invalid object");
                metrics::record_watch_event(kind, WatchEventType::Invalid);
            }
        },
        Event::InitDone => {
            let objects = relist.buffer.take().unwrap_or_default();
            info!(kind, count = objects.len(), "list complete");
            metrics::record_watch_event(kind, WatchEventType::InitDone);
            T::replace(index, objects);
            index.mark_ready(T::KIND);
        }
        Event::Apply(resource) => {
            let key = key_of(&resource);
            match T::from_resource(&resource) {
                Ok(object) => {
                    metrics::record_watch_event(kind, WatchEventType::Apply);
                    T::upsert(index, object);
                }
                Err(e) => {
                    // A previous valid version must not keep answering.
                    warn!(kind, object = %key, error = %e, "dropping invalid object");
                    metrics::record_watch_event(kind, WatchEventType::Invalid);
                    T::remove(index, &key);
                }
            }
        }
        Event::Delete(resource) => {
            metrics::record_watch_event(kind, WatchEventType::Delete);
            T::remove(index, &key_of(&resource));
        }
    }
}

/// Runs the Service, Endpoints and Pod watches against the API server.
pub struct ClusterWatcher {
    client: Client,
    index: ClusterIndex,
    config: KubernetesConfig,
}

impl ClusterWatcher {
    /// Create a watcher feeding `index`.
    pub fn new(client: Client, index: ClusterIndex, config: KubernetesConfig) -> Self {
        Self {
            client,
            index,
            config,
        }
    }

    /// Watch all three kinds until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DnsError> {
        let mut selected = watcher::Config::default();
        if let Some(selector) = &self.config.label_selector {
            selected = selected.labels(selector);
        }

        let services = tokio::spawn(watch_kind::<Service>(
            Api::all(self.client.clone()),
            selected.clone(),
            self.index.clone(),
            cancel.clone(),
        ));
        let endpoints = tokio::spawn(watch_kind::<Endpoints>(
            Api::all(self.client.clone()),
            selected,
            self.index.clone(),
            cancel.clone(),
        ));
        let pods = tokio::spawn(watch_kind::<Pod>(
            Api::all(self.client),
            watcher::Config::default(),
            self.index,
            cancel,
        ));

        let (services, endpoints, pods) = tokio::join!(services, endpoints, pods);
        for (kind, result) in [
            (ObjectKind::Service, services),
            (ObjectKind::Endpoints, endpoints),
            (ObjectKind::Pod, pods),
        ] {
            if let Err(e) = result {
                error!(%kind, "watch task panicked: {}", e);
            }
        }

        Ok(())
    }
}

async fn watch_kind<T: Indexed>(
    api: Api<T::Resource>,
    config: watcher::Config,
    index: ClusterIndex,
    cancel: CancellationToken,
) {
    let kind = T::KIND.as_str();
    info!(kind, "starting watch");

    let stream = watcher::watcher(api, config).default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut relist = Relist::<T>::default();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(kind, "watch shutting down");
                return;
            }

            next = stream.next() => match next {
                Some(Ok(event)) => handle_event(&index, &mut relist, event),
                Some(Err(e)) => {
                    // The backoff wrapper retries; the stream stays usable.
                    warn!(kind, error = %e, "watch error");
                    metrics::record_watch_event(kind, WatchEventType::Error);
                }
                None => {
                    error!(kind, "watch stream ended");
                    return;
                }
            }
        }
    }
}
