use osquery_broker::{Broker, BrokerConfig, Reply};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub(crate) async fn cmd_run(
    config: Option<PathBuf>,
    queries: Vec<String>,
    instance: Option<String>,
) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let broker = Broker::new();

    let result = run(&broker, config, queries, instance.as_deref()).await;
    broker.close_all().await;
    result
}

async fn run(
    broker: &Broker,
    config: BrokerConfig,
    queries: Vec<String>,
    target: Option<&str>,
) -> anyhow::Result<()> {
    if config.instances.is_empty() {
        anyhow::bail!("No [[instance]] tables in broker config");
    }

    let mut started = Vec::new();
    for raw in config.instances {
        let instance = broker.construct(raw)?;
        broker.start(&instance).await?;
        started.push(instance);
    }

    let default = match config.default.as_deref() {
        Some(name) => broker.require(name)?,
        None => Arc::clone(&started[0]),
    };
    broker.mark_default(&default);
    info!(instance = %default.name(), instances = started.len(), "Broker running");

    let target = target.map(|name| broker.require(name)).transpose()?;

    let dispatch = |sql: String| {
        let target = target.clone();
        async move {
            match target {
                Some(instance) => broker.query(&instance, &sql).await,
                None => broker.query_default(&sql).await,
            }
        }
    };

    if !queries.is_empty() {
        for sql in queries {
            print_reply(&dispatch(sql).await)?;
        }
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(sql) if sql.trim().is_empty() => continue,
                    Some(sql) => print_reply(&dispatch(sql).await)?,
                    None => break,
                }
            }
        }
    }
    Ok(())
}

fn print_reply(reply: &Reply) -> anyhow::Result<()> {
    if let Some(e) = reply.error() {
        warn!("Query failed: {}", e);
    }
    println!("{}", serde_json::to_string(reply)?);
    Ok(())
}
