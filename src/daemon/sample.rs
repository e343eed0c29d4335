use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use overseer::{
    controller::{
        DeleteControl, Reconciler, UpdateControl, config::ControllerConfiguration,
        context::Context, dependent::DependentResource,
    },
    machinery::api::ResourceApi,
    resources::{CustomResource, ResourceSpec, metadata::ObjectMeta},
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleSpec {
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleStatus {
    pub observed_generation: Option<i64>,
    pub greeting: Option<String>,
}

impl ResourceSpec for SampleSpec {
    const KIND: &'static str = "samples.overseer.dev";
    type Status = SampleStatus;
}

pub type Sample = CustomResource<SampleSpec>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GreetingSpec {
    pub text: String,
}

impl ResourceSpec for GreetingSpec {
    const KIND: &'static str = "greetings.overseer.dev";
    type Status = ();
}

pub type Greeting = CustomResource<GreetingSpec>;

const GREETING_DEPENDENT: &str = "greeting";

struct GreetingDependent;

impl DependentResource<Greeting, Sample> for GreetingDependent {
    fn name(&self) -> String {
        GREETING_DEPENDENT.to_string()
    }

    fn build(&self, owner: &Sample) -> Result<Greeting> {
        Ok(Greeting::new(
            ObjectMeta::new(&owner.metadata.name, owner.metadata.namespace.as_ref()),
            GreetingSpec {
                text: format!("hello, {}", owner.spec.message),
            },
        ))
    }

    fn update(&self, mut fetched: Greeting, owner: &Sample) -> Result<Greeting> {
        fetched.spec = self.build(owner)?.spec;
        Ok(fetched)
    }

    fn updated(&self) -> bool {
        true
    }
}

/// Keeps a `Greeting` next to every `Sample` and mirrors its text into the
/// sample's status.
pub struct SampleReconciler {
    greetings: Arc<dyn ResourceApi<Greeting>>,
}

impl SampleReconciler {
    pub fn new(greetings: Arc<dyn ResourceApi<Greeting>>) -> Self {
        Self { greetings }
    }
}

#[async_trait]
impl Reconciler<Sample> for SampleReconciler {
    fn configuration(&self) -> ControllerConfiguration<Sample> {
        ControllerConfiguration::new(self.name())
            .with_dependent(GreetingDependent, self.greetings.clone())
    }

    async fn reconcile(
        &self,
        mut resource: Sample,
        ctx: &Context<Sample>,
    ) -> Result<UpdateControl<Sample>> {
        let greeting = match ctx.secondary::<Greeting>(GREETING_DEPENDENT) {
            Some(greeting) => greeting,
            None => ctx.desired::<Greeting>(GREETING_DEPENDENT)?,
        };

        info!(
            "sample {} says '{}'",
            resource.metadata.name, greeting.spec.text
        );

        let generation = resource.metadata.generation;
        let status = resource.status_mut();
        status.observed_generation = Some(generation);
        status.greeting = Some(greeting.spec.text);

        Ok(UpdateControl::update_status(resource))
    }

    async fn cleanup(&self, resource: Sample, _ctx: &Context<Sample>) -> Result<DeleteControl> {
        info!("sample {} deleted", resource.metadata.name);
        Ok(DeleteControl::default_delete())
    }
}
