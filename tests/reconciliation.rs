#[macro_use]
mod common;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use overseer::{
    constants::NO_FINALIZER,
    controller::{
        DeleteControl, Reconciler, UpdateControl, config::ControllerConfiguration,
        context::Context,
        retry::{RetryInfo, RetryPolicy},
    },
    operator::Operator,
    resources::Resource,
    utils::naming::default_finalizer_name,
};

use crate::common::{TestCluster, TestResource, settings};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Fails a fixed number of times, then marks the resource as reconciled.
struct FlakyReconciler {
    failures: usize,
    executions: Arc<AtomicUsize>,
    attempts: Arc<Mutex<Vec<Option<u32>>>>,
}

#[async_trait]
impl Reconciler<TestResource> for FlakyReconciler {
    fn configuration(&self) -> ControllerConfiguration<TestResource> {
        ControllerConfiguration::new(self.name()).with_retry(
            RetryPolicy::default()
                .with_linear_retry()
                .with_initial_interval(Duration::from_millis(150))
                .with_max_attempts(5),
        )
    }

    async fn reconcile(
        &self,
        mut resource: TestResource,
        ctx: &Context<TestResource>,
    ) -> Result<UpdateControl<TestResource>> {
        let execution = self.executions.fetch_add(1, Ordering::SeqCst);
        self.attempts
            .lock()
            .unwrap()
            .push(ctx.retry_info().map(|info| info.attempt_count()));

        if execution < self.failures {
            bail!("simulated failure {}", execution + 1);
        }

        resource.status_mut().state = Some("success".to_string());
        Ok(UpdateControl::update_status(resource))
    }
}

#[tokio::test]
async fn test_failed_reconciliation_is_retried_until_success() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let executions = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(Mutex::new(Vec::new()));
    operator
        .register(
            FlakyReconciler {
                failures: 3,
                executions: executions.clone(),
                attempts: attempts.clone(),
            },
            cluster.api(),
        )
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("flaky", "a").await;

    assert!(
        eventually!(TIMEOUT, {
            cluster
                .get("flaky")
                .await
                .and_then(|r| r.status)
                .and_then(|s| s.state)
                .is_some_and(|state| state == "success")
        })
    );
    assert_eq!(executions.load(Ordering::SeqCst), 4);
    assert_eq!(
        *attempts.lock().unwrap(),
        vec![None, Some(1), Some(2), Some(3)]
    );

    operator.stop().await;
}

/// Always fails and reports the failure through the error status hook.
struct BrokenReconciler {
    executions: Arc<AtomicUsize>,
    retries: Arc<Mutex<Vec<Option<RetryInfo>>>>,
    generation_aware: bool,
}

impl BrokenReconciler {
    fn new(generation_aware: bool) -> (Self, Arc<AtomicUsize>, Arc<Mutex<Vec<Option<RetryInfo>>>>) {
        let executions = Arc::new(AtomicUsize::new(0));
        let retries = Arc::new(Mutex::new(Vec::new()));
        let reconciler = Self {
            executions: executions.clone(),
            retries: retries.clone(),
            generation_aware,
        };
        (reconciler, executions, retries)
    }
}

#[async_trait]
impl Reconciler<TestResource> for BrokenReconciler {
    fn configuration(&self) -> ControllerConfiguration<TestResource> {
        ControllerConfiguration::new(self.name())
            .with_finalizer(NO_FINALIZER)
            .with_generation_aware(self.generation_aware)
            .with_retry(
                RetryPolicy::default()
                    .with_linear_retry()
                    .with_initial_interval(Duration::from_millis(50))
                    .with_max_attempts(2),
            )
    }

    async fn reconcile(
        &self,
        _resource: TestResource,
        ctx: &Context<TestResource>,
    ) -> Result<UpdateControl<TestResource>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.retries.lock().unwrap().push(ctx.retry_info());
        bail!("always broken")
    }

    async fn update_error_status(
        &self,
        mut resource: TestResource,
        _ctx: &Context<TestResource>,
        error: &anyhow::Error,
    ) -> Option<TestResource> {
        let status = resource.status_mut();
        status.state = Some("error".to_string());
        status.message = Some(format!("Error Retries Exceeded: {}", error));
        Some(resource)
    }
}

#[tokio::test]
async fn test_exhausted_retries_update_error_status() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let (reconciler, executions, retries) = BrokenReconciler::new(true);
    operator.register(reconciler, cluster.api()).await.unwrap();
    operator.start().await.unwrap();

    cluster.create("broken", "a").await;

    assert!(
        eventually!(TIMEOUT, {
            cluster
                .get("broken")
                .await
                .and_then(|r| r.status)
                .and_then(|s| s.message)
                .is_some_and(|m| m.starts_with("Error Retries Exceeded"))
        })
    );
    assert_eq!(executions.load(Ordering::SeqCst), 3);
    assert_eq!(
        *retries.lock().unwrap(),
        vec![
            None,
            Some(RetryInfo {
                attempt_count: 1,
                last_attempt: false
            }),
            Some(RetryInfo {
                attempt_count: 2,
                last_attempt: true
            }),
        ]
    );

    // no more retries once exhausted, and the status write is filtered
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executions.load(Ordering::SeqCst), 3);
    assert!(cluster.get("broken").await.unwrap().meta().finalizers.is_empty());

    // a real change starts over
    cluster.modify("broken", |r| r.spec.value = "b".to_string()).await;
    assert!(
        eventually!(TIMEOUT, { executions.load(Ordering::SeqCst) > 3 })
    );

    operator.stop().await;
}

#[tokio::test]
async fn test_error_status_write_does_not_restart_retries() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    // every write echoes back when generation awareness is off
    let (reconciler, executions, _) = BrokenReconciler::new(false);
    operator.register(reconciler, cluster.api()).await.unwrap();
    operator.start().await.unwrap();

    cluster.create("echo", "a").await;
    assert!(
        eventually!(TIMEOUT, {
            cluster
                .get("echo")
                .await
                .and_then(|r| r.status)
                .and_then(|s| s.state)
                .is_some_and(|state| state == "error")
        })
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(executions.load(Ordering::SeqCst), 3);

    // any other change, even metadata only, starts over
    cluster
        .modify("echo", |r| {
            r.meta_mut()
                .labels
                .insert("touched".to_string(), "yes".to_string());
        })
        .await;
    assert!(eventually!(TIMEOUT, { executions.load(Ordering::SeqCst) == 6 }));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(executions.load(Ordering::SeqCst), 6);

    operator.stop().await;
}

/// Panics on its first run, then records the spec value in the status.
struct PanickingReconciler {
    executions: Arc<AtomicUsize>,
}

#[async_trait]
impl Reconciler<TestResource> for PanickingReconciler {
    fn configuration(&self) -> ControllerConfiguration<TestResource> {
        ControllerConfiguration::new(self.name()).with_retry(
            RetryPolicy::default()
                .with_linear_retry()
                .with_initial_interval(Duration::from_millis(50))
                .with_max_attempts(3),
        )
    }

    async fn reconcile(
        &self,
        mut resource: TestResource,
        _ctx: &Context<TestResource>,
    ) -> Result<UpdateControl<TestResource>> {
        if self.executions.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("first run blows up");
        }

        resource.status_mut().message = Some(resource.spec.value.clone());
        Ok(UpdateControl::update_status(resource))
    }
}

async fn status_message(cluster: &TestCluster, name: &str) -> Option<String> {
    cluster
        .get(name)
        .await
        .and_then(|r| r.status)
        .and_then(|s| s.message)
}

#[tokio::test]
async fn test_panicking_reconciler_is_retried() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let executions = Arc::new(AtomicUsize::new(0));
    operator
        .register(
            PanickingReconciler {
                executions: executions.clone(),
            },
            cluster.api(),
        )
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("fragile", "a").await;
    assert!(
        eventually!(TIMEOUT, {
            status_message(&cluster, "fragile").await.as_deref() == Some("a")
        })
    );
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    // the identity is still schedulable after the panic
    cluster.modify("fragile", |r| r.spec.value = "b".to_string()).await;
    assert!(
        eventually!(TIMEOUT, {
            status_message(&cluster, "fragile").await.as_deref() == Some("b")
        })
    );

    // and the other resources are unaffected
    cluster.create("sturdy", "c").await;
    assert!(
        eventually!(TIMEOUT, {
            status_message(&cluster, "sturdy").await.as_deref() == Some("c")
        })
    );

    operator.stop().await;
}

/// Labels the resource once, through a full resource update, optionally
/// writing the status in the same step. Also drops every finalizer it sees.
struct LabelingReconciler {
    with_status: bool,
}

#[async_trait]
impl Reconciler<TestResource> for LabelingReconciler {
    async fn reconcile(
        &self,
        mut resource: TestResource,
        _ctx: &Context<TestResource>,
    ) -> Result<UpdateControl<TestResource>> {
        if resource.meta().labels.contains_key("labeled") {
            return Ok(UpdateControl::no_update());
        }

        let meta = resource.meta_mut();
        meta.labels.insert("labeled".to_string(), "yes".to_string());
        meta.finalizers.clear();

        if self.with_status {
            resource.status_mut().state = Some("labeled".to_string());
            Ok(UpdateControl::update_resource_and_status(resource))
        } else {
            Ok(UpdateControl::update_resource(resource))
        }
    }
}

async fn labeled(cluster: &TestCluster, name: &str) -> Option<TestResource> {
    cluster
        .get(name)
        .await
        .filter(|r| r.meta().labels.get("labeled").is_some_and(|v| v == "yes"))
}

#[tokio::test]
async fn test_resource_update_keeps_the_finalizer() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());
    operator
        .register(LabelingReconciler { with_status: false }, cluster.api())
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("labels", "a").await;
    assert!(eventually!(TIMEOUT, { labeled(&cluster, "labels").await.is_some() }));

    let resource = cluster.get("labels").await.unwrap();
    assert!(
        resource
            .meta()
            .has_finalizer(&default_finalizer_name(TestResource::kind()))
    );
    assert_eq!(resource.spec.value, "a");
    assert!(resource.status.is_none());

    operator.stop().await;
}

#[tokio::test]
async fn test_resource_and_status_update_persists_both() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());
    operator
        .register(LabelingReconciler { with_status: true }, cluster.api())
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("both", "a").await;
    assert!(
        eventually!(TIMEOUT, {
            labeled(&cluster, "both")
                .await
                .and_then(|r| r.status)
                .and_then(|s| s.state)
                .is_some_and(|state| state == "labeled")
        })
    );
    assert!(
        cluster
            .get("both")
            .await
            .unwrap()
            .meta()
            .has_finalizer(&default_finalizer_name(TestResource::kind()))
    );

    operator.stop().await;
}

/// Writes its status once and asks to see the resulting event.
struct WhitelistingReconciler {
    executions: Arc<AtomicUsize>,
}

#[async_trait]
impl Reconciler<TestResource> for WhitelistingReconciler {
    fn configuration(&self) -> ControllerConfiguration<TestResource> {
        ControllerConfiguration::new(self.name()).with_finalizer(NO_FINALIZER)
    }

    async fn reconcile(
        &self,
        mut resource: TestResource,
        ctx: &Context<TestResource>,
    ) -> Result<UpdateControl<TestResource>> {
        if self.executions.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(UpdateControl::no_update());
        }

        ctx.whitelist_next_event();
        resource.status_mut().state = Some("first".to_string());
        Ok(UpdateControl::update_status(resource))
    }
}

#[tokio::test]
async fn test_whitelisted_status_write_triggers_one_more_run() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let executions = Arc::new(AtomicUsize::new(0));
    operator
        .register(
            WhitelistingReconciler {
                executions: executions.clone(),
            },
            cluster.api(),
        )
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("listed", "a").await;
    assert!(eventually!(TIMEOUT, { executions.load(Ordering::SeqCst) == 2 }));

    // the whitelist is used up: further metadata changes are filtered again
    cluster
        .modify("listed", |r| {
            r.meta_mut()
                .labels
                .insert("touched".to_string(), "yes".to_string());
        })
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    operator.stop().await;
}

/// Counts executions and leaves the resource alone.
struct CountingReconciler {
    executions: Arc<AtomicUsize>,
    generation_aware: bool,
}

#[async_trait]
impl Reconciler<TestResource> for CountingReconciler {
    fn configuration(&self) -> ControllerConfiguration<TestResource> {
        ControllerConfiguration::new(self.name()).with_generation_aware(self.generation_aware)
    }

    async fn reconcile(
        &self,
        _resource: TestResource,
        _ctx: &Context<TestResource>,
    ) -> Result<UpdateControl<TestResource>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(UpdateControl::no_update())
    }
}

#[tokio::test]
async fn test_finalizer_is_added_before_reconciling() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let executions = Arc::new(AtomicUsize::new(0));
    let reconciler = CountingReconciler {
        executions: executions.clone(),
        generation_aware: true,
    };
    let finalizer = default_finalizer_name(TestResource::kind());
    operator.register(reconciler, cluster.api()).await.unwrap();
    operator.start().await.unwrap();

    cluster.create("plain", "a").await;

    assert!(
        eventually!(TIMEOUT, {
            cluster
                .get("plain")
                .await
                .is_some_and(|r| r.meta().has_finalizer(&finalizer))
        })
    );
    assert!(eventually!(TIMEOUT, { executions.load(Ordering::SeqCst) == 1 }));

    operator.stop().await;
}

#[tokio::test]
async fn test_generation_aware_controller_skips_metadata_changes() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let executions = Arc::new(AtomicUsize::new(0));
    operator
        .register(
            CountingReconciler {
                executions: executions.clone(),
                generation_aware: true,
            },
            cluster.api(),
        )
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("gen", "a").await;
    assert!(eventually!(TIMEOUT, { executions.load(Ordering::SeqCst) == 1 }));

    cluster
        .modify("gen", |r| {
            r.meta_mut()
                .labels
                .insert("touched".to_string(), "yes".to_string());
        })
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    cluster.modify("gen", |r| r.spec.value = "b".to_string()).await;
    assert!(eventually!(TIMEOUT, { executions.load(Ordering::SeqCst) == 2 }));

    operator.stop().await;
}

#[tokio::test]
async fn test_generation_unaware_controller_sees_every_change() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let executions = Arc::new(AtomicUsize::new(0));
    operator
        .register(
            CountingReconciler {
                executions: executions.clone(),
                generation_aware: false,
            },
            cluster.api(),
        )
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("every", "a").await;
    assert!(eventually!(TIMEOUT, { executions.load(Ordering::SeqCst) >= 1 }));
    tokio::time::sleep(Duration::from_millis(200)).await;
    let before = executions.load(Ordering::SeqCst);

    cluster
        .modify("every", |r| {
            r.meta_mut()
                .labels
                .insert("touched".to_string(), "yes".to_string());
        })
        .await;
    assert!(eventually!(TIMEOUT, { executions.load(Ordering::SeqCst) > before }));

    operator.stop().await;
}

/// Records cleanups and optionally keeps the finalizer in place.
struct CleanupReconciler {
    cleanups: Arc<AtomicUsize>,
    remove_finalizer: bool,
}

#[async_trait]
impl Reconciler<TestResource> for CleanupReconciler {
    async fn reconcile(
        &self,
        _resource: TestResource,
        _ctx: &Context<TestResource>,
    ) -> Result<UpdateControl<TestResource>> {
        Ok(UpdateControl::no_update())
    }

    async fn cleanup(
        &self,
        _resource: TestResource,
        _ctx: &Context<TestResource>,
    ) -> Result<DeleteControl> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.remove_finalizer {
            Ok(DeleteControl::default_delete())
        } else {
            Ok(DeleteControl::no_finalizer_removal())
        }
    }
}

#[tokio::test]
async fn test_cleanup_removes_finalizer_and_resource() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let cleanups = Arc::new(AtomicUsize::new(0));
    operator
        .register(
            CleanupReconciler {
                cleanups: cleanups.clone(),
                remove_finalizer: true,
            },
            cluster.api(),
        )
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("doomed", "a").await;
    assert!(
        eventually!(TIMEOUT, {
            cluster
                .get("doomed")
                .await
                .is_some_and(|r| !r.meta().finalizers.is_empty())
        })
    );

    cluster.api().delete(&common::id("doomed")).await.unwrap();

    assert!(eventually!(TIMEOUT, { cluster.get("doomed").await.is_none() }));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    operator.stop().await;
}

#[tokio::test]
async fn test_cleanup_may_keep_the_finalizer() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let cleanups = Arc::new(AtomicUsize::new(0));
    operator
        .register(
            CleanupReconciler {
                cleanups: cleanups.clone(),
                remove_finalizer: false,
            },
            cluster.api(),
        )
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("sticky", "a").await;
    assert!(
        eventually!(TIMEOUT, {
            cluster
                .get("sticky")
                .await
                .is_some_and(|r| !r.meta().finalizers.is_empty())
        })
    );

    cluster.api().delete(&common::id("sticky")).await.unwrap();
    assert!(eventually!(TIMEOUT, { cleanups.load(Ordering::SeqCst) == 1 }));

    let sticky = cluster.get("sticky").await.unwrap();
    assert!(sticky.meta().is_marked_for_deletion());
    assert!(!sticky.meta().finalizers.is_empty());

    // further events keep invoking cleanup without side effects
    cluster
        .modify("sticky", |r| {
            r.meta_mut()
                .labels
                .insert("again".to_string(), "yes".to_string());
        })
        .await;
    assert!(eventually!(TIMEOUT, { cleanups.load(Ordering::SeqCst) == 2 }));
    assert!(cluster.get("sticky").await.is_some());

    operator.stop().await;
}

/// Asks to be called again shortly after every successful run.
struct PollingReconciler {
    executions: Arc<AtomicUsize>,
}

#[async_trait]
impl Reconciler<TestResource> for PollingReconciler {
    async fn reconcile(
        &self,
        _resource: TestResource,
        _ctx: &Context<TestResource>,
    ) -> Result<UpdateControl<TestResource>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(UpdateControl::no_update().reschedule_after(Duration::from_millis(100)))
    }
}

#[tokio::test]
async fn test_successful_reconciliation_can_be_rescheduled() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let executions = Arc::new(AtomicUsize::new(0));
    operator
        .register(
            PollingReconciler {
                executions: executions.clone(),
            },
            cluster.api(),
        )
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("poll", "a").await;
    assert!(eventually!(TIMEOUT, { executions.load(Ordering::SeqCst) >= 3 }));

    operator.stop().await;
    let stopped_at = executions.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executions.load(Ordering::SeqCst), stopped_at);
}

/// Sleeps while tracking how many executions overlap for the same resource.
struct SlowReconciler {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

#[async_trait]
impl Reconciler<TestResource> for SlowReconciler {
    async fn reconcile(
        &self,
        mut resource: TestResource,
        _ctx: &Context<TestResource>,
    ) -> Result<UpdateControl<TestResource>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let generation = resource.generation();
        resource.status_mut().observed_generation = Some(generation);
        Ok(UpdateControl::update_status(resource))
    }
}

#[tokio::test]
async fn test_one_execution_per_resource_at_a_time() {
    let cluster = TestCluster::new().await;
    let operator = Operator::new(cluster.cluster.clone(), settings());

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    operator
        .register(
            SlowReconciler {
                in_flight: in_flight.clone(),
                max_in_flight: max_in_flight.clone(),
            },
            cluster.api(),
        )
        .await
        .unwrap();
    operator.start().await.unwrap();

    cluster.create("busy", "0").await;
    for i in 1..=10 {
        cluster
            .modify("busy", |r| r.spec.value = i.to_string())
            .await;
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    let last_generation = cluster.get("busy").await.unwrap().generation();

    // the latest state is reconciled even though events arrived mid-flight
    assert!(
        eventually!(TIMEOUT, {
            cluster
                .get("busy")
                .await
                .and_then(|r| r.status)
                .and_then(|s| s.observed_generation)
                == Some(last_generation)
        })
    );
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);

    operator.stop().await;
}
