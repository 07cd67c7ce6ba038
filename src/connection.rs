//! Transport session management.
//!
//! One transport session per device. The engine never talks to the broker
//! directly: everything goes through the [`Transport`] trait so the whole
//! engine can run against an in-memory transport in tests, with
//! [`MqttTransport`] as the real implementation.
//!
//! Reconnects are fully owned here: on any session loss the client is torn
//! down and rebuilt after a jittered exponential backoff, and the
//! subscribe set is re-issued once the new session acknowledges.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};

use crate::config::BrokerSettings;

/// How long one poll call waits for broker traffic.
const POLL_WAIT: Duration = Duration::from_millis(10);
/// Max events drained per poll call so a chatty broker cannot starve the
/// rest of the tick.
const POLL_BUDGET: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session is up and ready for subscriptions.
    Connected,
    Disconnected { reason: String },
    Message { topic: String, payload: Vec<u8> },
}

pub trait Transport {
    /// Begin a fresh session. Success means the attempt started, not that
    /// the broker accepted - that arrives as [`TransportEvent::Connected`].
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn subscribe(&mut self, topic: &str) -> Result<()>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;
    fn poll(&mut self) -> Vec<TransportEvent>;
}

/// rumqttc-backed MQTT session.
pub struct MqttTransport {
    settings: BrokerSettings,
    session: Option<(Client, Connection)>,
}

impl MqttTransport {
    pub fn new(settings: BrokerSettings) -> Self {
        MqttTransport {
            settings,
            session: None,
        }
    }
}

impl Transport for MqttTransport {
    fn open(&mut self) -> Result<()> {
        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs));
        options.set_clean_start(true);
        options.set_credentials(
            self.settings.username.clone(),
            self.settings.password.clone(),
        );

        let (client, connection) = Client::new(options, 16);
        self.session = Some((client, connection));
        Ok(())
    }

    fn close(&mut self) {
        if let Some((client, _)) = self.session.take() {
            // Best effort; the broker side times the session out anyway.
            let _ = client.disconnect();
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        let (client, _) = self.session.as_mut().context("no transport session")?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .with_context(|| format!("subscribe {}", topic))?;
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        let (client, _) = self.session.as_mut().context("no transport session")?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .with_context(|| format!("publish {}", topic))?;
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let mut session_dead = false;

        if let Some((_, connection)) = self.session.as_mut() {
            for _ in 0..POLL_BUDGET {
                match connection.recv_timeout(POLL_WAIT) {
                    Ok(Ok(Event::Incoming(Incoming::ConnAck(_)))) => {
                        events.push(TransportEvent::Connected);
                    }
                    Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                        match std::str::from_utf8(&publish.topic) {
                            Ok(topic) => events.push(TransportEvent::Message {
                                topic: topic.to_string(),
                                payload: publish.payload.to_vec(),
                            }),
                            Err(e) => log::warn!("skipping publish with invalid topic: {}", e),
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        events.push(TransportEvent::Disconnected {
                            reason: e.to_string(),
                        });
                        session_dead = true;
                        break;
                    }
                    // `recv_timeout`'s error type (rumqttc v5 `RecvTimeoutError`) is a
                    // public enum in a private, un-re-exported module, so it cannot be
                    // named by path. Discriminate its two unit variants via their derived
                    // `Debug` representation.
                    Err(e) => {
                        if format!("{:?}", e) == "Disconnected" {
                            events.push(TransportEvent::Disconnected {
                                reason: "event loop gone".to_string(),
                            });
                            session_dead = true;
                        }
                        break;
                    }
                }
            }
        }

        if session_dead {
            self.session = None;
        }
        events
    }
}

/// Jittered exponential backoff. The jitter is additive (up to +25%) and
/// the result clamps at the cap, so consecutive delays never decrease
/// until a reset.
pub struct Backoff {
    min_ms: i64,
    max_ms: i64,
    current_ms: i64,
}

impl Backoff {
    pub fn new(min_ms: i64, max_ms: i64) -> Self {
        Backoff {
            min_ms,
            max_ms,
            current_ms: min_ms,
        }
    }

    pub fn next_delay(&mut self) -> i64 {
        let jitter = rand::thread_rng().gen_range(0..=self.current_ms / 4);
        let delay = (self.current_ms + jitter).min(self.max_ms);
        self.current_ms = (self.current_ms * 2).min(self.max_ms);
        delay
    }

    /// The delay the next attempt would get, jitter aside.
    pub fn current_ms(&self) -> i64 {
        self.current_ms
    }

    pub fn reset(&mut self) {
        self.current_ms = self.min_ms;
    }
}

/// Owns the transport session, the backoff schedule, and resubscription.
pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    subscribe_set: Vec<String>,
    backoff: Backoff,
    retry_at_ms: Option<i64>,
    online_since_ms: Option<i64>,
}

impl ConnectionManager {
    pub fn new(transport: Box<dyn Transport>, subscribe_set: Vec<String>, backoff: Backoff) -> Self {
        ConnectionManager {
            transport,
            subscribe_set,
            backoff,
            retry_at_ms: None,
            online_since_ms: None,
        }
    }

    /// Start a connect attempt right now. On an immediate failure the
    /// retry is scheduled as if the session had dropped.
    pub fn connect_now(&mut self, now_ms: i64) -> bool {
        self.retry_at_ms = None;
        match self.transport.open() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("connect attempt failed: {:#}", e);
                self.schedule_retry(now_ms);
                false
            }
        }
    }

    pub fn poll(&mut self) -> Vec<TransportEvent> {
        self.transport.poll()
    }

    /// The broker accepted the session: issue the whole subscribe set.
    pub fn on_session_established(&mut self) -> Result<()> {
        for topic in self.subscribe_set.clone() {
            self.transport.subscribe(&topic)?;
        }
        log::info!("subscribed to {} topics", self.subscribe_set.len());
        Ok(())
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        self.transport.publish(topic, payload)
    }

    /// The session is gone (transport error or supervision decision):
    /// tear it down and schedule the next attempt.
    pub fn session_lost(&mut self, now_ms: i64) {
        self.transport.close();
        self.online_since_ms = None;
        self.schedule_retry(now_ms);
    }

    fn schedule_retry(&mut self, now_ms: i64) {
        let delay = self.backoff.next_delay();
        self.retry_at_ms = Some(now_ms + delay);
        log::info!("reconnect in {}ms", delay);
    }

    pub fn reconnect_due(&self, now_ms: i64) -> bool {
        matches!(self.retry_at_ms, Some(at) if now_ms >= at)
    }

    pub fn note_online(&mut self, now_ms: i64) {
        self.online_since_ms = Some(now_ms);
    }

    pub fn note_offline(&mut self) {
        self.online_since_ms = None;
    }

    /// A sustained `Online` stretch (longer than one current backoff
    /// cycle) earns a reset to the minimum delay.
    pub fn maybe_reset_backoff(&mut self, now_ms: i64) {
        if let Some(since) = self.online_since_ms {
            if now_ms.saturating_sub(since) > self.backoff.current_ms() {
                self.backoff.reset();
            }
        }
    }

    pub fn backoff_current_ms(&self) -> i64 {
        self.backoff.current_ms()
    }

    pub fn close(&mut self) {
        self.retry_at_ms = None;
        self.online_since_ms = None;
        self.transport.close();
    }
}
