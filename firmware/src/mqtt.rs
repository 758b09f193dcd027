use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use common::node::{BrokerClient, BrokerError};

#[cfg(target_os = "espidf")]
pub use esp::Broker;

#[cfg(not(target_os = "espidf"))]
pub use host::Broker;

/// How long `connect` waits for the broker to acknowledge the session.
const CONNACK_TIMEOUT: Duration = Duration::from_secs(5);

const KEEP_ALIVE: Duration = Duration::from_secs(15);

#[cfg(target_os = "espidf")]
mod esp {
    use embedded_svc::{
        mqtt::client::{Connection, Event, MessageImpl, QoS},
        utils::mqtt::client::ConnState,
    };
    use esp_idf_svc::mqtt::client::*;
    use esp_idf_sys::EspError;
    use log::{debug, info, warn};

    use super::*;

    struct Session {
        client: EspMqttClient<ConnState<MessageImpl, EspError>>,
        _events: JoinHandle<()>,
    }

    pub struct Broker {
        url: String,
        session: Option<Session>,
        connected: Arc<AtomicBool>,
    }

    impl Broker {
        pub fn new(host: &str, port: u16) -> Self {
            Self {
                url: format!("mqtt://{}:{}", host, port),
                session: None,
                connected: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl BrokerClient for Broker {
        fn connect(&mut self, client_id: &str) -> Result<(), BrokerError> {
            // the old client is torn down so the new id is used
            self.session = None;
            // fresh flag, a dying event thread must not touch the new session's
            self.connected = Arc::new(AtomicBool::new(false));

            let client_config = MqttClientConfiguration {
                protocol_version: Some(MqttProtocolVersion::V3_1_1),
                client_id: Some(client_id),
                keep_alive_interval: Some(KEEP_ALIVE),
                ..Default::default()
            };

            let (client, mut conn) = EspMqttClient::new_with_conn(&self.url, &client_config)
                .map_err(|e| BrokerError::Transport(e.to_string()))?;

            let connected = self.connected.clone();
            let events = std::thread::spawn(move || {
                while let Some(event) = conn.next() {
                    match event {
                        Ok(Event::Connected(_)) => connected.store(true, Ordering::SeqCst),
                        Ok(Event::Disconnected) => {
                            info!("MQTT disconnected");
                            connected.store(false, Ordering::SeqCst);
                        }
                        Ok(event) => debug!("MQTT event {:?}", event),
                        Err(e) => warn!("MQTT error: {}", e),
                    }
                }
                connected.store(false, Ordering::SeqCst);
            });

            self.session = Some(Session {
                client,
                _events: events,
            });

            let step = Duration::from_millis(50);
            let mut waited = Duration::ZERO;
            while !self.connected.load(Ordering::SeqCst) {
                if waited >= CONNACK_TIMEOUT {
                    self.session = None;
                    return Err(BrokerError::Refused(-4));
                }
                std::thread::sleep(step);
                waited += step;
            }

            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.session.is_some() && self.connected.load(Ordering::SeqCst)
        }

        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
            let session = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
            session
                .client
                .publish(topic, QoS::AtMostOnce, false, payload)
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(not(target_os = "espidf"))]
mod host {
    use log::{debug, info, warn};
    use rumqttc::{
        Client, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
    };

    use super::*;

    struct Session {
        client: Client,
        events: Option<JoinHandle<()>>,
    }

    impl Drop for Session {
        fn drop(&mut self) {
            let _ = self.client.disconnect();
            if let Some(events) = self.events.take() {
                let _ = events.join();
            }
        }
    }

    pub struct Broker {
        host: String,
        port: u16,
        session: Option<Session>,
        connected: Arc<AtomicBool>,
    }

    impl Broker {
        pub fn new(host: &str, port: u16) -> Self {
            Self {
                host: host.to_owned(),
                port,
                session: None,
                connected: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    fn refused(code: ConnectReturnCode) -> BrokerError {
        BrokerError::Refused(code as i32)
    }

    impl BrokerClient for Broker {
        fn connect(&mut self, client_id: &str) -> Result<(), BrokerError> {
            self.session = None;
            // fresh flag, a dying event thread must not touch the new session's
            self.connected = Arc::new(AtomicBool::new(false));

            let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
            options.set_keep_alive(KEEP_ALIVE);

            let (client, mut connection) = Client::new(options, 10);

            let mut waited = Duration::ZERO;
            loop {
                let started = std::time::Instant::now();
                let remaining = CONNACK_TIMEOUT.saturating_sub(waited);
                let event = connection
                    .recv_timeout(remaining)
                    .map_err(|_| BrokerError::Transport("no CONNACK".into()))?;
                waited += started.elapsed();

                match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            return Err(refused(ack.code));
                        }
                        break;
                    }
                    Ok(event) => debug!("MQTT event {:?}", event),
                    Err(ConnectionError::ConnectionRefused(code)) => return Err(refused(code)),
                    Err(e) => return Err(BrokerError::Transport(e.to_string())),
                }
            }

            self.connected.store(true, Ordering::SeqCst);

            let connected = self.connected.clone();
            let events = std::thread::spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::Disconnect))
                        | Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(event) => debug!("MQTT event {:?}", event),
                        Err(e) => {
                            warn!("MQTT connection lost: {}", e);
                            break;
                        }
                    }
                }
                info!("MQTT disconnected");
                connected.store(false, Ordering::SeqCst);
            });

            self.session = Some(Session {
                client,
                events: Some(events),
            });
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.session.is_some() && self.connected.load(Ordering::SeqCst)
        }

        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
            let session = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
            session
                .client
                .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
                .map_err(|e| BrokerError::Transport(e.to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use std::io::{Read, Write};
        use std::net::{TcpListener, TcpStream};
        use std::sync::mpsc;

        use super::*;

        const CONNECT: u8 = 1;
        const PUBLISH: u8 = 3;

        fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte)?;
            let kind = byte[0] >> 4;

            let mut len = 0usize;
            let mut shift = 0;
            loop {
                stream.read_exact(&mut byte)?;
                len |= ((byte[0] & 0x7f) as usize) << shift;
                if byte[0] & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }

            let mut body = vec![0u8; len];
            stream.read_exact(&mut body)?;
            Ok((kind, body))
        }

        fn expect(stream: &mut TcpStream, kind: u8) -> Vec<u8> {
            loop {
                let (k, body) = read_packet(stream).unwrap();
                if k == kind {
                    return body;
                }
            }
        }

        /// Client id out of a v3.1.1 CONNECT body.
        fn client_id_of(connect: &[u8]) -> String {
            let len = u16::from_be_bytes([connect[10], connect[11]]) as usize;
            String::from_utf8(connect[12..12 + len].to_vec()).unwrap()
        }

        fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
            for _ in 0..100 {
                if cond() {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            false
        }

        #[test]
        fn publishes_then_notices_the_broker_going_away() {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let (seen_tx, seen_rx) = mpsc::channel();

            let fake = std::thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                let connect = expect(&mut stream, CONNECT);
                seen_tx.send(client_id_of(&connect)).unwrap();
                stream.write_all(&[0x20, 0x02, 0x00, 0x00]).unwrap();

                let publish = expect(&mut stream, PUBLISH);
                seen_tx
                    .send(String::from_utf8_lossy(&publish).into_owned())
                    .unwrap();
                // broker restarts: socket closed under the client
            });

            let mut broker = Broker::new("127.0.0.1", port);
            broker.connect("ESP32Client-BEEF").unwrap();
            assert!(broker.is_connected());
            assert_eq!(seen_rx.recv().unwrap(), "ESP32Client-BEEF");

            broker
                .publish("sensor/data", br#"{"temperature":21.00,"humidity":45.00}"#)
                .unwrap();
            let publish = seen_rx.recv().unwrap();
            assert!(publish.contains("sensor/data"));
            assert!(publish.ends_with(r#"{"temperature":21.00,"humidity":45.00}"#));

            fake.join().unwrap();
            assert!(wait_until(|| !broker.is_connected()), "drop went unnoticed");
        }

        #[test]
        fn refused_connack_keeps_the_return_code() {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();

            let fake = std::thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                expect(&mut stream, CONNECT);
                // 5: not authorized
                stream.write_all(&[0x20, 0x02, 0x00, 0x05]).unwrap();
                let _ = read_packet(&mut stream);
            });

            let mut broker = Broker::new("127.0.0.1", port);
            let err = broker.connect("ESP32Client-1").unwrap_err();
            assert!(matches!(err, BrokerError::Refused(5)), "{:?}", err);
            assert!(!broker.is_connected());

            drop(broker);
            fake.join().unwrap();
        }

        #[test]
        fn publish_without_session_fails() {
            let mut broker = Broker::new("127.0.0.1", 1883);
            assert!(!broker.is_connected());
            assert!(matches!(
                broker.publish("sensor/data", b"{}"),
                Err(BrokerError::NotConnected)
            ));
        }

        #[test]
        fn unreachable_broker_is_a_transport_error() {
            // grab a free port and close it again so nothing is listening
            let port = TcpListener::bind("127.0.0.1:0")
                .unwrap()
                .local_addr()
                .unwrap()
                .port();

            let mut broker = Broker::new("127.0.0.1", port);
            let err = broker.connect("ESP32Client-1234").unwrap_err();
            assert!(matches!(err, BrokerError::Transport(_)), "{:?}", err);
            assert!(!broker.is_connected());
        }
    }
}
