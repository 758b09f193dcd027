//! Sensor node control loop.
//!
//! The loop is written against small traits so the same code drives the
//! ESP32 build and the desktop simulation. Everything blocks; there is one
//! thread of execution and nothing else to service.

use core::fmt::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::NodeConfig;
use crate::interval::Interval;
use crate::reading::{Message, Reading};
use crate::retry::RetryPolicy;

pub const LINK_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const SESSION_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const IDLE_DELAY: Duration = Duration::from_millis(100);
pub const CLIENT_ID_PREFIX: &str = "ESP32Client-";

const CLIENT_ID_CAPACITY: usize = 32;

pub type ClientId = heapless::String<CLIENT_ID_CAPACITY>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("wifi: {0}")]
    Wifi(String),
    #[error("link still down after {0} polls")]
    GaveUp(u32),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection refused, rc={0}")]
    Refused(i32),
    #[error("transport: {0}")]
    Transport(String),
    #[error("not connected")]
    NotConnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("no response from sensor")]
    Timeout,
    #[error("checksum mismatch")]
    Checksum,
    #[error("sensor driver: {0}")]
    Driver(String),
}

pub trait WirelessLink {
    /// Starts association. Completion is observed through `is_connected`.
    fn begin(&mut self, ssid: &str, passphrase: &str) -> Result<(), LinkError>;
    fn is_connected(&mut self) -> bool;
    fn local_ip(&self) -> Option<Ipv4Addr>;
}

pub trait BrokerClient {
    fn connect(&mut self, client_id: &str) -> Result<(), BrokerError>;
    fn is_connected(&self) -> bool;
    /// Gives the client a chance to service its connection.
    fn poll(&mut self) {}
    /// Fire and forget, default delivery guarantee.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

pub trait Sensor {
    fn read(&mut self) -> Result<Reading, SensorError>;
}

pub trait Clock {
    /// Free running millisecond counter; wraps at `u32::MAX`.
    fn now_ms(&self) -> u32;
    fn delay(&mut self, duration: Duration);
}

/// `ESP32Client-` followed by a random 16 bit value in upper case hex.
pub fn client_id(prefix: &str, random: u16) -> ClientId {
    let mut id = ClientId::new();
    // prefix is truncated rather than failing the connect
    for c in prefix.chars() {
        if id.len() + c.len_utf8() + 4 > CLIENT_ID_CAPACITY || id.push(c).is_err() {
            break;
        }
    }
    let _ = write!(id, "{:X}", random);
    id
}

pub struct ConnectionManager<L, B> {
    link: L,
    broker: B,
    random: Box<dyn FnMut() -> u16>,
    link_poll: RetryPolicy,
    session_retry: RetryPolicy,
}

impl<L: WirelessLink, B: BrokerClient> ConnectionManager<L, B> {
    pub fn new(link: L, broker: B, random: impl FnMut() -> u16 + 'static) -> Self {
        Self {
            link,
            broker,
            random: Box::new(random),
            link_poll: RetryPolicy::forever(LINK_POLL_INTERVAL),
            session_retry: RetryPolicy::forever(SESSION_RETRY_DELAY),
        }
    }

    pub fn with_policies(mut self, link_poll: RetryPolicy, session_retry: RetryPolicy) -> Self {
        self.link_poll = link_poll;
        self.session_retry = session_retry;
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Blocks until the radio is associated. With the default policy this
    /// never gives up. Returns the number of status polls.
    pub fn bring_up_link(
        &mut self,
        ssid: &str,
        passphrase: &str,
        clock: &mut impl Clock,
    ) -> Result<u32, LinkError> {
        info!("Connecting to {}", ssid);

        let policy = self.link_poll;
        let link = &mut self.link;
        let mut begun = false;

        let (_, polls) = policy
            .run(
                |d| clock.delay(d),
                |_| {
                    if !begun {
                        if let Err(e) = link.begin(ssid, passphrase) {
                            warn!("wifi start failed: {}", e);
                            return Err("not started");
                        }
                        begun = true;
                    }
                    if link.is_connected() {
                        Ok(())
                    } else {
                        debug!(".");
                        Err("not connected")
                    }
                },
            )
            .map_err(|e| LinkError::GaveUp(e.attempts))?;

        info!("WiFi connected");
        if let Some(ip) = self.link.local_ip() {
            info!("IP address: {}", ip);
        }

        Ok(polls)
    }

    /// Re-establishes the broker session if it dropped, blocking until it is
    /// back. Returns the number of connection attempts, 0 if it was alive.
    pub fn ensure_session(&mut self, clock: &mut impl Clock) -> Result<u32, BrokerError> {
        if self.broker.is_connected() {
            return Ok(0);
        }

        let policy = self.session_retry;
        let broker = &mut self.broker;
        let random = &mut self.random;

        let (_, attempts) = policy
            .run(
                |d| clock.delay(d),
                |attempt| {
                    info!("Attempting MQTT connection...");
                    let id = client_id(CLIENT_ID_PREFIX, random());
                    match broker.connect(&id) {
                        Ok(()) => {
                            info!("connected as {}", id);
                            Ok(())
                        }
                        Err(e) => {
                            let wait = policy.delay_after(attempt);
                            warn!("failed, {} try again in {:?}", e, wait);
                            Err(e)
                        }
                    }
                },
            )
            .map_err(|e| e.last)?;

        Ok(attempts)
    }

    pub fn poll(&mut self) {
        self.broker.poll();
    }

    pub fn publish(&mut self, topic: &str, message: &str) -> Result<(), BrokerError> {
        self.broker.publish(topic, message.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Interval has not elapsed.
    Idle,
    /// Sensor read failed or produced NaN; nothing published.
    Skipped,
    Published(Message),
    /// Handed to the client but the client reported an error. Not retried.
    PublishFailed(Message),
}

pub struct Node<L, B, S, C> {
    conn: ConnectionManager<L, B>,
    sensor: S,
    clock: C,
    interval: Interval,
    topic: String,
    ssid: String,
    passphrase: String,
}

impl<L, B, S, C> Node<L, B, S, C>
where
    L: WirelessLink,
    B: BrokerClient,
    S: Sensor,
    C: Clock,
{
    pub fn new(config: &NodeConfig, conn: ConnectionManager<L, B>, sensor: S, clock: C) -> Self {
        let interval = Interval::new(config.publish_interval_ms, clock.now_ms());
        Self {
            conn,
            sensor,
            clock,
            interval,
            topic: config.topic.clone(),
            ssid: config.ssid.clone(),
            passphrase: config.passphrase.clone(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager<L, B> {
        &self.conn
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn start(&mut self) -> Result<(), LinkError> {
        self.conn
            .bring_up_link(&self.ssid, &self.passphrase, &mut self.clock)?;
        Ok(())
    }

    /// One pass of the main loop: keep the session alive, let the client do
    /// its housekeeping, maybe sample and publish, then idle briefly.
    pub fn run_once(&mut self) -> Result<Step, BrokerError> {
        self.conn.ensure_session(&mut self.clock)?;
        self.conn.poll();

        let now = self.clock.now_ms();
        let step = self.step(now);

        self.clock.delay(IDLE_DELAY);
        Ok(step)
    }

    /// Sampler state machine: idle until the interval elapses, then sample,
    /// then publish a valid reading.
    pub fn step(&mut self, now_ms: u32) -> Step {
        if !self.interval.poll(now_ms) {
            return Step::Idle;
        }

        let reading = match self.sensor.read() {
            Ok(reading) if reading.is_valid() => reading,
            Ok(_) => {
                warn!("Failed to read from DHT sensor! (NaN)");
                return Step::Skipped;
            }
            Err(e) => {
                warn!("Failed to read from DHT sensor! ({})", e);
                return Step::Skipped;
            }
        };

        info!("{}", reading);

        let message = match reading.to_message() {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping reading: {}", e);
                return Step::Skipped;
            }
        };

        info!("Publishing message: {}", message);

        match self.conn.publish(&self.topic, &message) {
            Ok(()) => Step::Published(message),
            Err(e) => {
                warn!("publish failed: {}", e);
                Step::PublishFailed(message)
            }
        }
    }

    /// Never returns on the device; only an error from a bounded retry
    /// policy ends the loop.
    pub fn run(mut self) -> Result<(), LinkError> {
        self.start()?;
        loop {
            if let Err(e) = self.run_once() {
                warn!("broker session: {}", e);
            }
        }
    }
}
