use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use skald_controller::{Controller, RunMode};
use skald_core::SkaldConfig;
use skald_kafka::KafkaBus;
use skald_mongo::MongoTaskRepository;
use skald_redis::RedisKv;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "SKALD_REDIS_URL")]
    redis_url: String,

    #[arg(long, env = "SKALD_KAFKA_BROKERS")]
    kafka_brokers: String,

    #[arg(long, env = "SKALD_KAFKA_GROUP_ID", default_value = "skald-controller")]
    kafka_group_id: String,

    #[arg(long, env = "SKALD_MONGO_URL")]
    mongo_url: String,

    #[arg(long, env = "SKALD_MONGO_DATABASE", default_value = "skalds")]
    mongo_database: String,

    #[arg(long, env = "SKALD_CONTROLLER_MODE", default_value = "dispatcher")]
    mode: RunMode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let args = Args::parse();
    let config = SkaldConfig::default();

    let kv = Arc::new(
        RedisKv::connect(&args.redis_url, &config)
            .await
            .context("failed to connect to redis")?,
    );
    let bus = Arc::new(
        KafkaBus::connect(&args.kafka_brokers, &args.kafka_group_id, &config)
            .context("failed to connect to kafka")?,
    );
    bus.ensure_control_topics().await.context("failed to create control topics")?;
    let repo = Arc::new(
        MongoTaskRepository::connect(&args.mongo_url, &args.mongo_database, &config)
            .await
            .context("failed to connect to mongo")?,
    );

    let controller = Arc::new(Controller::new(kv, bus, repo, config, args.mode));

    let run_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run().await })
    };

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("got shutdown signal, stopping controller loops");
    controller.stop();

    run_handle.await.context("controller run task panicked")?;

    Ok(())
}
