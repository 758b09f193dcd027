use std::future::Future;
use std::io::Write;

use common::Reading;
use log::{debug, log_enabled, warn, Level};
use tokio::sync::mpsc;

use crate::db::{Db, NewReading};
use crate::pump::Delivery;

pub trait MessageHandler {
    fn handle(&mut self, delivery: &Delivery);
}

/// Prints every delivery as a line of text.
pub struct ConsoleHandler<W> {
    out: W,
}

impl ConsoleHandler<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> ConsoleHandler<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn output(&self) -> &W {
        &self.out
    }
}

impl<W: Write> MessageHandler for ConsoleHandler<W> {
    fn handle(&mut self, delivery: &Delivery) {
        let payload = String::from_utf8_lossy(&delivery.payload);
        let line = writeln!(
            self.out,
            "Message received on topic {}: {}",
            delivery.topic, payload
        );
        if let Err(e) = line {
            warn!("console write failed: {}", e);
        }

        if log_enabled!(Level::Debug) {
            match serde_json::from_slice::<Reading>(&delivery.payload) {
                Ok(reading) => debug!("decoded: {}", reading),
                Err(e) => debug!("not a sensor reading: {}", e),
            }
        }
    }
}

/// Stores every delivery that decodes as a sensor reading, stamped with the
/// time it arrived here.
pub struct StoreHandler {
    db: Db,
}

impl StoreHandler {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    #[cfg(test)]
    pub fn db(&mut self) -> &mut Db {
        &mut self.db
    }
}

impl MessageHandler for StoreHandler {
    fn handle(&mut self, delivery: &Delivery) {
        let reading = match serde_json::from_slice::<Reading>(&delivery.payload) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("not storing message on {}: {}", delivery.topic, e);
                return;
            }
        };

        let row = NewReading {
            topic: &delivery.topic,
            temperature: reading.temperature,
            humidity: reading.humidity,
            received_at: chrono::Utc::now().timestamp_millis(),
        };
        match self.db.insert_reading(&row) {
            Ok(()) => debug!("stored {}", reading),
            Err(e) => warn!("insert failed: {}", e),
        }
    }
}

impl<H: MessageHandler> MessageHandler for Option<H> {
    fn handle(&mut self, delivery: &Delivery) {
        if let Some(handler) = self {
            handler.handle(delivery);
        }
    }
}

impl<A: MessageHandler, B: MessageHandler> MessageHandler for (A, B) {
    fn handle(&mut self, delivery: &Delivery) {
        self.0.handle(delivery);
        self.1.handle(delivery);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Finish {
    /// Shutdown was requested.
    Shutdown,
    /// The pump went away.
    QueueClosed,
}

/// Hands queued deliveries to `handler` until `shutdown` resolves or the
/// queue closes. Once shutdown is seen nothing else reaches the handler, even
/// if deliveries are still queued.
pub async fn consume<H: MessageHandler>(
    queue: &mut mpsc::Receiver<Delivery>,
    handler: &mut H,
    shutdown: impl Future<Output = ()>,
) -> Finish {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return Finish::Shutdown,
            delivery = queue.recv() => match delivery {
                Some(delivery) => handler.handle(&delivery),
                None => return Finish::QueueClosed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[derive(Default)]
    struct Counting(usize);

    impl MessageHandler for Counting {
        fn handle(&mut self, _delivery: &Delivery) {
            self.0 += 1;
        }
    }

    fn delivery(topic: &str, payload: &str) -> Delivery {
        Delivery {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn console_prints_topic_and_payload() {
        let mut handler = ConsoleHandler::new(Vec::new());
        handler.handle(&delivery("test/topic", "hello"));

        let out = String::from_utf8(handler.output().clone()).unwrap();
        assert!(out.contains("test/topic"));
        assert!(out.contains("hello"));
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn console_prints_sensor_json_verbatim() {
        let mut handler = ConsoleHandler::new(Vec::new());
        let json = r#"{"temperature":23.45,"humidity":51.20}"#;
        handler.handle(&delivery("sensor/data", json));

        let out = String::from_utf8(handler.output().clone()).unwrap();
        assert_eq!(out, format!("Message received on topic sensor/data: {}\n", json));
    }

    #[test]
    fn store_keeps_decoded_readings_only() {
        let mut store = StoreHandler::new(Db::connect(":memory:").unwrap());
        let before = chrono::Utc::now().timestamp_millis();

        store.handle(&delivery("sensor/data", r#"{"temperature":23.45,"humidity":51.20}"#));
        store.handle(&delivery("test/topic", "hello"));
        store.handle(&delivery("sensor/data", r#"{"temperature":-4.00}"#));

        let rows = store.db().latest_readings(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, "sensor/data");
        assert!((rows[0].temperature - 23.45).abs() < 1e-4);
        assert!((rows[0].humidity - 51.2).abs() < 1e-4);
        assert!(rows[0].received_at >= before);
    }

    #[test]
    fn console_and_store_both_see_a_delivery() {
        let store = Some(StoreHandler::new(Db::connect(":memory:").unwrap()));
        let mut handlers = (ConsoleHandler::new(Vec::new()), store);

        handlers.handle(&delivery("sensor/data", r#"{"temperature":20.00,"humidity":60.00}"#));

        let out = String::from_utf8(handlers.0.output().clone()).unwrap();
        assert!(out.contains("sensor/data"));
        let rows = handlers.1.as_mut().unwrap().db().latest_readings(10).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn missing_store_is_skipped() {
        let mut handlers = (Counting::default(), None::<Counting>);
        handlers.handle(&delivery("test/topic", "hello"));
        assert_eq!(handlers.0 .0, 1);
    }

    #[tokio::test]
    async fn hello_reaches_the_console() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(delivery("test/topic", "hello")).await.unwrap();
        drop(tx);

        let mut handler = ConsoleHandler::new(Vec::new());
        let finish = consume(&mut rx, &mut handler, std::future::pending()).await;

        assert_eq!(finish, Finish::QueueClosed);
        let out = String::from_utf8(handler.output().clone()).unwrap();
        assert!(out.contains("test/topic") && out.contains("hello"));
    }

    #[tokio::test]
    async fn handler_is_idle_after_shutdown() {
        let (tx, mut rx) = mpsc::channel(8);
        for _ in 0..3 {
            tx.send(delivery("test/topic", "late")).await.unwrap();
        }

        let mut handler = Counting::default();
        let finish = consume(&mut rx, &mut handler, async {}).await;
        assert_eq!(finish, Finish::Shutdown);
        assert_eq!(handler.0, 0);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_waiting_consumer() {
        let (_tx, mut rx) = mpsc::channel::<Delivery>(8);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let mut handler = Counting::default();
        let consumer = async {
            consume(&mut rx, &mut handler, async {
                let _ = stop_rx.await;
            })
            .await
        };

        stop_tx.send(()).unwrap();
        let finish = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap();
        assert_eq!(finish, Finish::Shutdown);
        assert_eq!(handler.0, 0);
    }
}
