//! In-process provider simulator.
//!
//! Keeps resources in memory, assigns ids and echoes inputs back as outputs.
//! Used for dry runs and tests; failures can be injected per resource name.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::graph::Outputs;

use super::{ApplyRequest, Operation, ResourceProvider};

/// A call observed by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Logical resource name.
    pub name: String,
    /// Operation performed.
    pub operation: Operation,
}

/// In-memory provider.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    /// Live resources by id.
    resources: Mutex<HashMap<String, Outputs>>,
    /// Every call, in arrival order.
    calls: Mutex<Vec<RecordedCall>>,
    /// Names whose calls fail.
    failing: Mutex<HashSet<String>>,
    /// Simulated call duration.
    latency: Option<Duration>,
    /// Calls currently in progress.
    in_flight: AtomicUsize,
    /// Highest observed `in_flight`.
    peak: AtomicUsize,
    /// Counter for simulated addresses.
    addresses: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryProvider {
    /// Creates an empty simulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call for `name` fail.
    pub fn fail_on(&self, name: &str) {
        lock(&self.failing).insert(name.to_string());
    }

    /// Lets calls for `name` succeed again.
    pub fn recover(&self, name: &str) {
        lock(&self.failing).remove(name);
    }

    /// Makes every call take `latency` before completing.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns every call received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Returns the logical names called with `operation`, in call order.
    #[must_use]
    pub fn names_for(&self, operation: Operation) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Returns the number of live resources.
    #[must_use]
    pub fn live_count(&self) -> usize {
        lock(&self.resources).len()
    }

    /// Returns the highest number of concurrent calls observed.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn create(&self, request: &ApplyRequest) -> Outputs {
        let ty = request.resource_type();
        let id = format!("{ty}-{}", &Uuid::new_v4().simple().to_string()[..8]);

        let mut outputs = request.inputs.clone();
        outputs.insert(String::from("id"), Value::String(id.clone()));
        outputs
            .entry(String::from("name"))
            .or_insert_with(|| Value::String(request.name.clone()));
        outputs
            .entry(String::from("label"))
            .or_insert_with(|| Value::String(request.name.clone()));

        if ty == "instance" {
            let n = self.addresses.fetch_add(1, Ordering::SeqCst) % 254 + 1;
            outputs.insert(String::from("ipAddress"), Value::String(format!("192.0.2.{n}")));
        }

        lock(&self.resources).insert(id, outputs.clone());
        outputs
    }

    fn update(&self, request: &ApplyRequest) -> Result<Outputs, ProviderError> {
        let id = request.id.clone().unwrap_or_default();
        let mut resources = lock(&self.resources);
        let current = resources
            .get_mut(&id)
            .ok_or_else(|| ProviderError::NotFound { id: id.clone() })?;

        for (key, value) in &request.inputs {
            current.insert(key.clone(), value.clone());
        }
        Ok(current.clone())
    }

    fn delete(&self, request: &ApplyRequest) -> Result<Outputs, ProviderError> {
        let id = request.id.clone().unwrap_or_default();
        lock(&self.resources)
            .remove(&id)
            .map(|_| Outputs::new())
            .ok_or(ProviderError::NotFound { id })
    }
}

#[async_trait]
impl ResourceProvider for MemoryProvider {
    async fn apply(&self, request: ApplyRequest) -> Result<Outputs, ProviderError> {
        lock(&self.calls).push(RecordedCall {
            name: request.name.clone(),
            operation: request.operation,
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = if lock(&self.failing).contains(&request.name) {
            Err(ProviderError::request(
                500,
                format!("simulated failure for '{}'", request.name),
            ))
        } else {
            match request.operation {
                Operation::Create => Ok(self.create(&request)),
                Operation::Update => self.update(&request),
                Operation::Delete => self.delete(&request),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug!(
            "memory provider {} '{}': {}",
            request.operation,
            request.name,
            if result.is_ok() { "ok" } else { "failed" }
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(kind: &str, operation: Operation, name: &str, id: Option<&str>) -> ApplyRequest {
        ApplyRequest {
            kind: kind.to_string(),
            operation,
            name: name.to_string(),
            inputs: Outputs::new(),
            id: id.map(ToString::to_string),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_address() {
        let provider = MemoryProvider::new();
        let outputs = provider
            .apply(request("linode:instance", Operation::Create, "web", None))
            .await
            .expect("created");

        let id = outputs["id"].as_str().expect("id");
        assert!(id.starts_with("instance-"));
        assert_eq!(outputs["ipAddress"], json!("192.0.2.1"));
        assert_eq!(outputs["label"], json!("web"));
        assert_eq!(provider.live_count(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_by_id() {
        let provider = MemoryProvider::new();
        let created = provider
            .apply(request("linode:volume", Operation::Create, "data", None))
            .await
            .expect("created");
        let id = created["id"].as_str().expect("id").to_string();

        let mut update = request("linode:volume", Operation::Update, "data", Some(&id));
        update.inputs.insert(String::from("size"), json!(100));
        let updated = provider.apply(update).await.expect("updated");
        assert_eq!(updated["size"], json!(100));
        assert_eq!(updated["id"], json!(id));

        provider
            .apply(request("linode:volume", Operation::Delete, "data", Some(&id)))
            .await
            .expect("deleted");
        assert_eq!(provider.live_count(), 0);

        let err = provider
            .apply(request("linode:volume", Operation::Delete, "data", Some(&id)))
            .await
            .expect_err("already gone");
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let provider = MemoryProvider::new();
        provider.fail_on("web");

        assert!(
            provider
                .apply(request("linode:instance", Operation::Create, "web", None))
                .await
                .is_err()
        );
        assert_eq!(provider.names_for(Operation::Create), vec!["web"]);

        provider.recover("web");
        assert!(
            provider
                .apply(request("linode:instance", Operation::Create, "web", None))
                .await
                .is_ok()
        );
    }
}
