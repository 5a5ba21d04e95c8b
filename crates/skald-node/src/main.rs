use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use skald_core::SkaldConfig;
use skald_kafka::KafkaBus;
use skald_mongo::MongoTaskRepository;
use skald_node::{Node, WorkerRegistry, WorkerSpec};
use skald_redis::RedisKv;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// One `--worker-class NAME=PROGRAM[,ARG...]` registration, parsed from the
/// CLI rather than a config file.
#[derive(Clone, Debug)]
struct WorkerClassArg {
    class_name: String,
    program: String,
    args: Vec<String>,
}

impl std::str::FromStr for WorkerClassArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (class_name, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=PROGRAM[,ARG...], got {s}"))?;
        let mut parts = rest.split(',');
        let program = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| format!("missing program in {s}"))?
            .to_string();
        Ok(WorkerClassArg {
            class_name: class_name.to_string(),
            program,
            args: parts.map(str::to_string).collect(),
        })
    }
}

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "SKALD_NODE_ID")]
    node_id: String,

    /// `node` accepts controller-dispatched tasks; `edge` only ever runs
    /// this node's own locally-declared Active tasks.
    #[arg(long = "node-mode", env = "SKALD_NODE_MODE", default_value = "node")]
    node_mode: skald_core::NodeMode,

    #[arg(long, env = "SKALD_REDIS_URL")]
    redis_url: String,

    #[arg(long, env = "SKALD_KAFKA_BROKERS")]
    kafka_brokers: String,

    #[arg(long, env = "SKALD_KAFKA_GROUP_ID")]
    kafka_group_id: Option<String>,

    #[arg(long, env = "SKALD_MONGO_URL")]
    mongo_url: String,

    #[arg(long, env = "SKALD_MONGO_DATABASE", default_value = "skalds")]
    mongo_database: String,

    /// One entry per worker class this node is willing to run, e.g.
    /// `Camera=/usr/bin/skald-camera-worker`.
    #[arg(long = "worker-class", value_name = "NAME=PROGRAM[,ARG...]")]
    worker_classes: Vec<WorkerClassArg>,
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
    let group_id = args
        .kafka_group_id
        .unwrap_or_else(|| format!("skald-node-{}", args.node_id));
    let bus = Arc::new(
        KafkaBus::connect(&args.kafka_brokers, &group_id, &config).context("failed to connect to kafka")?,
    );
    let repo = Arc::new(
        MongoTaskRepository::connect(&args.mongo_url, &args.mongo_database, &config)
            .await
            .context("failed to connect to mongo")?,
    );

    let mut registry = WorkerRegistry::new();
    for class in args.worker_classes {
        let mut spec = WorkerSpec::new(class.program);
        for arg in class.args {
            spec = spec.with_arg(arg);
        }
        registry = registry.register(class.class_name, spec);
    }

    let node = Arc::new(Node::new(kv, bus, repo, args.node_id, args.node_mode, registry, config));

    let run_handle = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.run().await })
    };

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("got shutdown signal, stopping task worker manager");
    node.stop();

    run_handle.await.context("node run task panicked")?;
    node.shutdown().await;

    Ok(())
}
