#![allow(dead_code)]

use std::sync::Arc;

use overseer::{
    machinery::{api::ResourceApi, local::LocalCluster},
    resources::{CustomResource, ResourceSpec, metadata::ObjectMeta, metadata::ResourceId},
    settings::Settings,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatus {
    pub state: Option<String>,
    pub message: Option<String>,
    pub observed_generation: Option<i64>,
}

impl ResourceSpec for TestSpec {
    const KIND: &'static str = "testresources.sample.overseer.dev";
    type Status = TestStatus;
}

pub type TestResource = CustomResource<TestSpec>;

pub const NAMESPACE: &str = "default";

pub struct TestCluster {
    _dir: TempDir,
    pub cluster: Arc<LocalCluster>,
}

impl TestCluster {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let cluster = LocalCluster::open(dir.path())
            .await
            .expect("failed to open cluster");
        Self { _dir: dir, cluster }
    }

    pub fn api(&self) -> Arc<dyn ResourceApi<TestResource>> {
        self.cluster.api::<TestResource>()
    }

    pub async fn create(&self, name: &str, value: &str) -> TestResource {
        self.api()
            .create(test_resource(name, value))
            .await
            .expect("failed to create resource")
    }

    pub async fn get(&self, name: &str) -> Option<TestResource> {
        self.api()
            .get(&id(name))
            .await
            .expect("failed to get resource")
    }

    /// Applies `f` to the current state and writes it back, retrying when a
    /// controller wrote in between.
    pub async fn modify(&self, name: &str, f: impl Fn(&mut TestResource)) -> TestResource {
        loop {
            let mut resource = self.get(name).await.expect("resource not found");
            f(&mut resource);
            match self.api().replace(resource).await {
                Ok(updated) => return updated,
                Err(e) if e.is_conflict() => continue,
                Err(e) => panic!("failed to replace resource: {}", e),
            }
        }
    }
}

pub fn id(name: &str) -> ResourceId {
    ResourceId::namespaced(NAMESPACE, name)
}

pub fn test_resource(name: &str, value: &str) -> TestResource {
    TestResource::new(
        ObjectMeta::new(name, Some(NAMESPACE)),
        TestSpec {
            value: value.to_string(),
        },
    )
}

pub fn settings() -> Settings {
    Settings {
        concurrent_reconciliations: 5,
        ..Default::default()
    }
}

/// Re-evaluates `condition` (which may `.await`) until it holds or
/// `timeout` elapses; yields whether it held.
macro_rules! eventually {
    ($timeout:expr, $condition:expr) => {{
        let deadline = tokio::time::Instant::now() + $timeout;
        loop {
            if $condition {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }};
}
