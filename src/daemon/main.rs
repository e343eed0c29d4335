mod cmd;
mod sample;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use overseer::{
    machinery::{api::ResourceApi, local::LocalCluster},
    operator::Operator,
    resources::metadata::ObjectMeta,
    settings::Settings,
    utils::tracing::init_tracing,
};
use tracing::{info, warn};

use crate::{
    cmd::Cli,
    sample::{Greeting, Sample, SampleReconciler, SampleSpec},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::load_or_default(cli.config_path).await?;

    let cluster = LocalCluster::open(settings.absolute_data_dir()).await?;
    let operator = Operator::new(cluster.clone(), settings);

    let samples: Arc<dyn ResourceApi<Sample>> = cluster.api::<Sample>();
    operator
        .register(
            SampleReconciler::new(cluster.api::<Greeting>()),
            samples.clone(),
        )
        .await?;
    operator.start().await?;

    if cli.demo {
        let demo = Sample::new(
            ObjectMeta::new("demo", Some("default")),
            SampleSpec {
                message: "overseer".to_string(),
            },
        );
        match samples.create(demo).await {
            Ok(created) => info!("created demo sample {}", created.metadata.name),
            Err(e) => warn!("failed to create demo sample: {}", e),
        }
    }

    tokio::signal::ctrl_c().await?;
    operator.stop().await;

    Ok(())
}
