use clap::Parser;
use feed_consumer::{shutdown, Config, FeedPipeline};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json);

    info!(
        group = %config.kafka_group_id,
        location_topic = %config.location_topic,
        intent_topic = %config.intent_topic,
        "starting feed consumer"
    );

    let pipeline = FeedPipeline::start(&config).await.map_err(|e| {
        error!(error = %e, "startup failed");
        e
    })?;

    let mut ready = pipeline.readiness();
    tokio::spawn(async move {
        if ready.wait_for(|up| *up).await.is_ok() {
            info!("consumer up and running");
        }
    });

    let cancel = shutdown::install_signal_handler();
    pipeline.run(cancel).await?;

    info!("feed consumer exited cleanly");
    Ok(())
}
