//! Watch loops turning API server events into queued notifications

use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher::{self, watcher, Event};
use kube_runtime::WatchStreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync_core::{stopped, Notification, NotificationQueue, Resource, ResourceKind};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Objects seen while a relist is in progress
struct Relist<K: kube::Resource<DynamicType = ()>> {
    before: Vec<Arc<K>>,
    seen: HashSet<ObjectRef<K>>,
}

/// Keeps one reflector store current and derives notifications from the
/// changes applied to it.
pub struct ResourceWatch<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + 'static,
{
    kind: ResourceKind,
    reader: Store<K>,
    writer: Writer<K>,
    synced: Arc<AtomicBool>,
    wrap: fn(Arc<K>) -> Resource,
    relist: Option<Relist<K>>,
}

impl<K> ResourceWatch<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(
        kind: ResourceKind,
        reader: Store<K>,
        writer: Writer<K>,
        synced: Arc<AtomicBool>,
        wrap: fn(Arc<K>) -> Resource,
    ) -> Self {
        Self {
            kind,
            reader,
            writer,
            synced,
            wrap,
            relist: None,
        }
    }

    /// Apply one watch event to the store and return what changed.
    ///
    /// Objects whose resource version did not move produce nothing. Objects
    /// missing from a relist are reported as deleted once it completes.
    pub fn handle(&mut self, event: Event<K>) -> Vec<Notification> {
        let mut notifications = Vec::new();

        match &event {
            Event::Init => {
                self.relist = Some(Relist {
                    before: self.reader.state(),
                    seen: HashSet::new(),
                });
            }
            Event::InitApply(obj) => {
                if let Some(relist) = self.relist.as_mut() {
                    relist.seen.insert(ObjectRef::from_obj(obj));
                }
                notifications.extend(self.applied(obj));
            }
            Event::Apply(obj) => notifications.extend(self.applied(obj)),
            Event::Delete(obj) => {
                notifications.push(Notification::delete((self.wrap)(Arc::new(obj.clone()))));
            }
            Event::InitDone => {
                if let Some(relist) = self.relist.take() {
                    for obj in relist.before {
                        if !relist.seen.contains(&ObjectRef::from_obj(&*obj)) {
                            notifications.push(Notification::delete((self.wrap)(obj)));
                        }
                    }
                }
            }
        }

        self.writer.apply_watcher_event(&event);

        if matches!(event, Event::InitDone) && !self.synced.swap(true, Ordering::AcqRel) {
            info!(
                kind = %self.kind,
                objects = self.reader.state().len(),
                "Initial list complete"
            );
        }

        notifications
    }

    fn applied(&self, obj: &K) -> Option<Notification> {
        let new = (self.wrap)(Arc::new(obj.clone()));
        match self.reader.get(&ObjectRef::from_obj(obj)) {
            None => Some(Notification::add(new)),
            Some(old)
                if old.resource_version().is_some()
                    && old.resource_version() == obj.resource_version() =>
            {
                None
            }
            Some(old) => Some(Notification::update((self.wrap)(old), new)),
        }
    }

    /// Stream events from `api` until `stop` fires, queueing every change.
    pub async fn run(mut self, api: Api<K>, queue: NotificationQueue, mut stop: watch::Receiver<bool>) {
        info!(kind = %self.kind, "Starting watch");

        let stream = watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        for notification in self.handle(event) {
                            let key = notification.key();
                            if !queue.add(key.clone(), notification) {
                                debug!(%key, "Queue is shutting down, dropping notification");
                            }
                        }
                    }
                    Some(Err(e)) => warn!(kind = %self.kind, error = %e, "Watch stream error"),
                    None => break,
                },
            }
        }

        info!(kind = %self.kind, "Watch stopped");
    }
}

/// The Service and Endpoints watch loops behind a `KubeWatchCache`
pub struct CacheWatchers {
    service_api: Api<Service>,
    services: ResourceWatch<Service>,
    endpoints_api: Api<Endpoints>,
    endpoints: ResourceWatch<Endpoints>,
}

impl CacheWatchers {
    pub fn new(
        service_api: Api<Service>,
        services: ResourceWatch<Service>,
        endpoints_api: Api<Endpoints>,
        endpoints: ResourceWatch<Endpoints>,
    ) -> Self {
        Self {
            service_api,
            services,
            endpoints_api,
            endpoints,
        }
    }

    /// Run both watches until `stop` fires
    pub async fn run(self, queue: NotificationQueue, stop: watch::Receiver<bool>) {
        tokio::join!(
            self.services.run(self.service_api, queue.clone(), stop.clone()),
            self.endpoints.run(self.endpoints_api, queue, stop),
        );
    }
}
