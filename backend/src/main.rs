use anyhow::{bail, Context, Result};
use common::SubscriberConfig;
use log::info;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};

mod db;
mod handler;
mod pump;
mod schema;
mod session;

use handler::{ConsoleHandler, Finish, StoreHandler};
use pump::PumpExit;

const QUEUE_DEPTH: usize = 32;

/// Resolves on the first console line, end of input, or Ctrl-C.
async fn shutdown_requested() {
    // a plain thread, a blocking stdin read must not hold up runtime shutdown
    let (line_tx, line_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        let _ = line_tx.send(());
    });

    tokio::select! {
        _ = line_rx => info!("shutdown requested from console"),
        Ok(()) = signal::ctrl_c() => info!("interrupted"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    dotenvy::dotenv().ok();
    let config = SubscriberConfig::from_env().context("bad subscriber configuration")?;

    let store = match &config.database_url {
        Some(url) => {
            let db = db::Db::connect(url).with_context(|| format!("cannot open {}", url))?;
            info!("storing readings in {}", url);
            Some(StoreHandler::new(db))
        }
        None => None,
    };

    let source = session::connect(&config)
        .await
        .with_context(|| format!("cannot reach {}:{}", config.broker_host, config.broker_port))?;

    let (queue_tx, mut queue_rx) = mpsc::channel(QUEUE_DEPTH);
    let pump = pump::spawn(source, queue_tx, config.reconnect_delay);

    println!("Listening on '{}', press Enter to quit", config.topic);

    let mut handlers = (ConsoleHandler::stdout(), store);
    let finish = handler::consume(&mut queue_rx, &mut handlers, shutdown_requested()).await;

    let (source, exit) = pump.stop().await;

    match (finish, exit) {
        (Finish::QueueClosed, PumpExit::ConnectionLost(reason)) => {
            bail!("connection to broker lost: {}", reason)
        }
        (_, PumpExit::Failed(reason)) => bail!("subscriber died: {}", reason),
        _ => {}
    }

    if let Some(source) = source {
        source.close().await;
    }
    info!("bye");
    Ok(())
}
