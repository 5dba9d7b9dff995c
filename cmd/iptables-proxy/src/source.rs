//! Service / Endpoints event source.
//!
//! Polls the API server's list endpoints and turns the difference between
//! consecutive lists into add / update / delete calls on the proxier. The
//! first successful list of each kind marks that kind as synced.

use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pkg_proxy::Proxier;
use pkg_types::endpoint::Endpoints;
use pkg_types::service::Service;

const SERVICES_PATH: &str = "/api/v1/services";
const ENDPOINTS_PATH: &str = "/api/v1/endpoints";

/// One observed change to a keyed object.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Added(T),
    Updated(T, T),
    Deleted(T),
}

/// Last list seen for one object kind, keyed by `namespace/name`.
#[derive(Debug)]
pub struct ObjectCache<T> {
    items: BTreeMap<String, T>,
    key: fn(&T) -> String,
    synced: bool,
}

impl<T: Clone + PartialEq> ObjectCache<T> {
    pub fn new(key: fn(&T) -> String) -> Self {
        Self {
            items: BTreeMap::new(),
            key,
            synced: false,
        }
    }

    /// Replace the cache with `list` and return what changed.
    pub fn replace(&mut self, list: Vec<T>) -> Vec<Change<T>> {
        let mut next = BTreeMap::new();
        for item in list {
            next.insert((self.key)(&item), item);
        }

        let mut changes = Vec::new();
        for (key, old) in &self.items {
            if !next.contains_key(key) {
                changes.push(Change::Deleted(old.clone()));
            }
        }
        for (key, new) in &next {
            match self.items.get(key) {
                None => changes.push(Change::Added(new.clone())),
                Some(old) if old != new => changes.push(Change::Updated(old.clone(), new.clone())),
                Some(_) => {}
            }
        }
        self.items = next;
        changes
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` the first time it is called.
    fn mark_synced(&mut self) -> bool {
        !std::mem::replace(&mut self.synced, true)
    }
}

pub struct EventSource {
    client: reqwest::Client,
    server: String,
    token: Option<String>,
    interval: Duration,
}

impl EventSource {
    pub fn new(server: &str, token: Option<String>, interval: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            token,
            interval,
        })
    }

    async fn list<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<Vec<T>> {
        let url = format!("{}{}", self.server, path);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        let resp = req.send().await?.error_for_status()?;
        Ok(resp.json::<Vec<T>>().await?)
    }

    /// Poll until `shutdown` is set.
    pub async fn run(self, proxier: &Proxier, mut shutdown: watch::Receiver<bool>) {
        info!("Polling {} every {:?}", self.server, self.interval);
        let mut services = ObjectCache::new(Service::key);
        let mut endpoints = ObjectCache::new(Endpoints::key);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event source stopping");
                        return;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            match self.list::<Service>(SERVICES_PATH).await {
                Ok(list) => {
                    for change in services.replace(list) {
                        match change {
                            Change::Added(svc) => proxier.on_service_add(&svc),
                            Change::Updated(old, new) => proxier.on_service_update(&old, &new),
                            Change::Deleted(svc) => proxier.on_service_delete(&svc),
                        }
                    }
                    if services.mark_synced() {
                        info!("Services synced ({} objects)", services.len());
                        proxier.on_services_synced();
                    }
                }
                Err(e) => warn!("Failed to list services: {:#}", e),
            }

            match self.list::<Endpoints>(ENDPOINTS_PATH).await {
                Ok(list) => {
                    for change in endpoints.replace(list) {
                        match change {
                            Change::Added(ep) => proxier.on_endpoints_add(&ep),
                            Change::Updated(old, new) => proxier.on_endpoints_update(&old, &new),
                            Change::Deleted(ep) => proxier.on_endpoints_delete(&ep),
                        }
                    }
                    if endpoints.mark_synced() {
                        info!("Endpoints synced ({} objects)", endpoints.len());
                        proxier.on_endpoints_synced();
                    }
                }
                Err(e) => warn!("Failed to list endpoints: {:#}", e),
            }
            debug!(
                "Poll complete: {} services, {} endpoints",
                services.len(),
                endpoints.len()
            );
        }
    }
}
