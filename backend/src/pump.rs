//! Background task that drives the broker connection and forwards deliveries
//! to the main task over a bounded queue.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub trait EventSource: Send + 'static {
    /// Drives the connection until something happens. `Ok(None)` is protocol
    /// traffic the caller does not care about.
    fn next_delivery(&mut self) -> impl Future<Output = Result<Option<Delivery>>> + Send;
}

#[derive(Debug, PartialEq, Eq)]
pub enum PumpExit {
    Stopped,
    /// The main task dropped its end of the queue.
    QueueClosed,
    ConnectionLost(String),
    /// The task panicked or was cancelled.
    Failed(String),
}

pub struct Pump<S> {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<(S, PumpExit)>>,
}

/// Starts pumping `source` into `queue`. With `reconnect` set a connection
/// error is logged and polling resumes after the delay; without it the pump
/// ends and the queue closes.
pub fn spawn<S: EventSource>(
    source: S,
    queue: mpsc::Sender<Delivery>,
    reconnect: Option<Duration>,
) -> Pump<S> {
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(pump(source, queue, reconnect, stop_rx));
    Pump {
        stop: Some(stop_tx),
        task: Some(task),
    }
}

async fn pump<S: EventSource>(
    mut source: S,
    queue: mpsc::Sender<Delivery>,
    reconnect: Option<Duration>,
    mut stop: oneshot::Receiver<()>,
) -> (S, PumpExit) {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut stop => return (source, PumpExit::Stopped),
            event = source.next_delivery() => event,
        };

        match event {
            Ok(Some(delivery)) => {
                tokio::select! {
                    biased;
                    _ = &mut stop => return (source, PumpExit::Stopped),
                    sent = queue.send(delivery) => {
                        if sent.is_err() {
                            return (source, PumpExit::QueueClosed);
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => match reconnect {
                None => return (source, PumpExit::ConnectionLost(e.to_string())),
                Some(delay) => {
                    warn!("connection error: {}, retrying in {:?}", e, delay);
                    tokio::select! {
                        biased;
                        _ = &mut stop => return (source, PumpExit::Stopped),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
        }
    }
}

impl<S: EventSource> Pump<S> {
    /// Stops the task and waits for it. Hands the source back unless the
    /// task died.
    pub async fn stop(mut self) -> (Option<S>, PumpExit) {
        if let Some(stop) = self.stop.take() {
            // the task may already be gone
            let _ = stop.send(());
        }

        let Some(task) = self.task.take() else {
            return (None, PumpExit::Stopped);
        };

        match task.await {
            Ok((source, exit)) => {
                info!("pump finished: {:?}", exit);
                (Some(source), exit)
            }
            Err(e) => {
                warn!("pump task failed: {}", e);
                (None, PumpExit::Failed(e.to_string()))
            }
        }
    }
}

impl<S> Drop for Pump<S> {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
