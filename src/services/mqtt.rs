//! MQTT client handler for the bridge.
//!
//! Subscribes to command topics and publishes every station event:
//!
//! **Subscribe Topics:**
//! - `layout/power/set` - `"on"`, `"off"` or `{"on": true}`
//! - `layout/estop` - Emergency stop (any payload)
//! - `layout/locos/<address>/speed/set` - `40` or `{"speed": 40, "protocol": "dcc"}`
//! - `layout/locos/<address>/direction/set` - `"forward"`, `"backward"` or JSON
//! - `layout/locos/<address>/functions/<n>/set` - `"on"`, `"off"` or JSON
//! - `layout/accessories/<address>/set` - `"green"`, `"red"` or JSON
//!
//! **Publish Topics:**
//! - `layout/events/<kind>` - Every event as JSON
//! - `layout/power` - Track power `on`/`off` (retained)
//! - `layout/sensors/<id>` - Sensor value `1`/`0` (retained)
//! - `layout/status` - Status JSON (heartbeat)

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::commands::{AccessoryValue, DecoderProtocol, Direction};
use crate::config::MqttConfig as SharedMqttConfig;
use crate::events::BridgeEvent;
use crate::fanout::ListenerId;
use crate::traits::CommandStationController;

use super::api::{AccessoryRequest, DirectionRequest, FunctionRequest, PowerRequest, SpeedRequest, StatusResponse};
use super::shared::SharedStation;

/// Events buffered between the station thread and the publisher.
const EVENT_BUFFER: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

/// Runtime MQTT client configuration for `rumqttc`.
///
/// Uses `String` where [`crate::config::MqttConfig`] uses fixed-size
/// `ShortString`; convert with [`MqttRuntimeConfig::from_config`].
#[derive(Debug, Clone)]
pub struct MqttRuntimeConfig {
    /// MQTT broker hostname
    pub host: String,
    /// MQTT broker port
    pub port: u16,
    /// Client ID
    pub client_id: String,
    /// Topic prefix (default: "layout")
    pub topic_prefix: String,
    /// Optional credentials
    pub credentials: Option<(String, String)>,
    /// Status heartbeat interval in milliseconds
    pub heartbeat_ms: u64,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u16,
}

impl Default for MqttRuntimeConfig {
    fn default() -> Self {
        Self::from_config(&SharedMqttConfig::default())
    }
}

impl MqttRuntimeConfig {
    /// Create a new config with the given broker address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Create from shared MqttConfig
    pub fn from_config(config: &SharedMqttConfig) -> Self {
        Self {
            host: config.host.as_str().to_string(),
            port: config.port,
            client_id: config.client_id.as_str().to_string(),
            topic_prefix: config.topic_prefix.as_str().to_string(),
            credentials: config.has_auth().then(|| {
                (
                    config.username.as_str().to_string(),
                    config.password.as_str().to_string(),
                )
            }),
            heartbeat_ms: 5000,
            keep_alive_secs: config.keep_alive_secs,
        }
    }

    /// Set the client ID
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set the topic prefix
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Set the heartbeat interval
    pub fn heartbeat_ms(mut self, ms: u64) -> Self {
        self.heartbeat_ms = ms;
        self
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.topic_prefix, suffix)
    }
}

// ============================================================================
// Inbound Commands
// ============================================================================

/// A command decoded from one MQTT message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MqttCommand {
    /// Switch track power
    Power(bool),
    /// Emergency stop
    EmergencyStop,
    /// Locomotive speed
    Speed(u32, SpeedRequest),
    /// Locomotive direction
    Direction(u32, DirectionRequest),
    /// Locomotive function
    Function(u32, u8, FunctionRequest),
    /// Accessory
    Accessory(u32, AccessoryRequest),
}

fn on_off(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Some(true),
        "off" | "0" | "false" => Some(false),
        _ => None,
    }
}

/// Decode a message on `topic` below `prefix`.
///
/// Payloads may be JSON request bodies or plain text.
pub fn parse_message(prefix: &str, topic: &str, payload: &[u8]) -> Option<MqttCommand> {
    let suffix = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let text = std::str::from_utf8(payload).unwrap_or("");
    let parts: Vec<&str> = suffix.split('/').collect();

    match parts.as_slice() {
        ["power", "set"] => serde_json::from_slice::<PowerRequest>(payload)
            .map(|r| r.on)
            .ok()
            .or_else(|| on_off(text))
            .map(MqttCommand::Power),
        ["estop"] => Some(MqttCommand::EmergencyStop),
        ["locos", address, "speed", "set"] => {
            let address = address.parse().ok()?;
            let req = serde_json::from_slice::<SpeedRequest>(payload).ok().or_else(|| {
                Some(SpeedRequest {
                    speed: text.trim().parse().ok()?,
                    protocol: DecoderProtocol::default(),
                })
            })?;
            Some(MqttCommand::Speed(address, req))
        }
        ["locos", address, "direction", "set"] => {
            let address = address.parse().ok()?;
            let req = serde_json::from_slice::<DirectionRequest>(payload).ok().or_else(|| {
                Some(DirectionRequest {
                    direction: Direction::from_text(text)?,
                    protocol: DecoderProtocol::default(),
                })
            })?;
            Some(MqttCommand::Direction(address, req))
        }
        ["locos", address, "functions", number, "set"] => {
            let address = address.parse().ok()?;
            let number = number.parse().ok()?;
            let req = serde_json::from_slice::<FunctionRequest>(payload).ok().or_else(|| {
                Some(FunctionRequest {
                    on: on_off(text)?,
                    protocol: DecoderProtocol::default(),
                })
            })?;
            Some(MqttCommand::Function(address, number, req))
        }
        ["accessories", address, "set"] => {
            let address = address.parse().ok()?;
            let req = serde_json::from_slice::<AccessoryRequest>(payload).ok().or_else(|| {
                Some(AccessoryRequest {
                    value: AccessoryValue::from_text(text)?,
                    protocol: DecoderProtocol::default(),
                    switch_time_ms: 0,
                })
            })?;
            Some(MqttCommand::Accessory(address, req))
        }
        _ => None,
    }
}

/// Apply a decoded command to the station.
pub fn execute(station: &dyn CommandStationController, command: MqttCommand) {
    match command {
        MqttCommand::Power(on) => {
            station.power(on);
        }
        MqttCommand::EmergencyStop => {
            station.emergency_stop();
        }
        MqttCommand::Speed(address, req) => station.change_velocity(address, req.protocol, req.speed),
        MqttCommand::Direction(address, req) => {
            station.change_direction(address, req.protocol, req.direction)
        }
        MqttCommand::Function(address, number, req) => {
            station.change_function_value(address, req.protocol, number, req.on)
        }
        MqttCommand::Accessory(address, req) => {
            station.switch_accessory(address, req.protocol, req.value, req.switch_time_ms)
        }
    }
}

// ============================================================================
// Outbound Events
// ============================================================================

/// Messages published for one event: `(topic suffix, payload, retained)`.
pub fn event_messages(event: &BridgeEvent) -> Vec<(String, String, bool)> {
    let json = serde_json::to_string(event).unwrap_or_default();
    let mut messages = vec![(format!("events/{}", event.name()), json, false)];
    match event {
        BridgeEvent::Power(p) => {
            messages.push(("power".to_string(), if p.on { "on" } else { "off" }.to_string(), true));
        }
        BridgeEvent::Sensor(s) => {
            messages.push((format!("sensors/{}", s.id), u8::from(s.active).to_string(), true));
        }
        _ => {}
    }
    messages
}

// ============================================================================
// MQTT Handler
// ============================================================================

/// MQTT handler that bridges MQTT messages to the shared station
pub struct MqttHandler {
    state: Arc<SharedStation>,
    config: MqttRuntimeConfig,
}

impl MqttHandler {
    /// Create a handler over shared state.
    pub fn new(state: Arc<SharedStation>, config: MqttRuntimeConfig) -> Self {
        Self { state, config }
    }

    /// Get a reference to the shared state.
    pub fn state(&self) -> Arc<SharedStation> {
        Arc::clone(&self.state)
    }

    /// Run the MQTT handler
    ///
    /// Handles MQTT messages until the task is dropped; only a failed
    /// subscription returns.
    pub async fn run(self) -> Result<(), MqttError> {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs as u64));
        if let Some((user, password)) = &self.config.credentials {
            options.set_credentials(user, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let topics = [
            self.config.topic("power/set"),
            self.config.topic("estop"),
            self.config.topic("locos/+/speed/set"),
            self.config.topic("locos/+/direction/set"),
            self.config.topic("locos/+/functions/+/set"),
            self.config.topic("accessories/+/set"),
        ];
        for topic in &topics {
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| MqttError::Subscribe(e.to_string()))?;
        }
        tracing::info!(host = %self.config.host, port = self.config.port, ?topics, "mqtt subscribed");

        // Station events arrive on the dispatcher thread; hand them over without blocking it
        let (tx, mut rx) = mpsc::channel::<BridgeEvent>(EVENT_BUFFER);
        let listener = self.state.station().events().add_listener(move |event: &BridgeEvent| {
            if tx.try_send(*event).is_err() {
                tracing::warn!(event = event.name(), "mqtt event buffer full, dropping event");
            }
        });

        // Publisher task
        let client_for_publish = client.clone();
        let config_for_publish = self.config.clone();
        let publisher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for (suffix, payload, retain) in event_messages(&event) {
                    if let Err(e) = client_for_publish
                        .publish(config_for_publish.topic(&suffix), QoS::AtLeastOnce, retain, payload)
                        .await
                    {
                        tracing::warn!(error = %e, "mqtt publish failed");
                    }
                }
            }
        });

        // Heartbeat task
        let client_for_heartbeat = client.clone();
        let config_for_heartbeat = self.config.clone();
        let state_for_heartbeat = Arc::clone(&self.state);
        let heartbeat = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(config_for_heartbeat.heartbeat_ms.max(100)));
            loop {
                interval.tick().await;
                let status = StatusResponse::from(state_for_heartbeat.as_ref());
                let payload = serde_json::to_string(&status).unwrap_or_default();
                let _ = client_for_heartbeat
                    .publish(config_for_heartbeat.topic("status"), QoS::AtMostOnce, false, payload)
                    .await;
            }
        });

        let _guard = Background {
            state: Arc::clone(&self.state),
            listener,
            tasks: [publisher, heartbeat],
        };

        // Main event loop; rumqttc reconnects on the next poll
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_message(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("mqtt connected");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "mqtt connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let Some(command) = parse_message(&self.config.topic_prefix, topic, payload) else {
            tracing::debug!(topic, "ignoring mqtt message");
            return;
        };
        tracing::debug!(topic, ?command, "mqtt command");
        let state = Arc::clone(&self.state);
        let result =
            tokio::task::spawn_blocking(move || execute(state.station().as_ref(), command)).await;
        if let Err(e) = result {
            tracing::error!(error = %e, "mqtt command task failed");
        }
    }
}

/// Detaches the event listener and stops helper tasks when `run` ends.
struct Background {
    state: Arc<SharedStation>,
    listener: ListenerId,
    tasks: [tokio::task::JoinHandle<()>; 2],
}

impl Drop for Background {
    fn drop(&mut self) {
        self.state.station().events().remove_listener(self.listener);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// MQTT-related errors
#[derive(Debug, Error)]
pub enum MqttError {
    /// Failed to subscribe to topic
    #[error("mqtt subscribe failed: {0}")]
    Subscribe(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VirtualStation;
    use crate::events::{PowerEvent, SensorEvent};

    // ========================================================================
    // MqttRuntimeConfig tests
    // ========================================================================

    #[test]
    fn runtime_config_from_shared_config() {
        let shared = SharedMqttConfig::default()
            .with_host("mqtt.test.com")
            .with_port(8883)
            .with_client_id("test-id")
            .with_topic_prefix("club")
            .with_auth("user", "pw");
        let config = MqttRuntimeConfig::from_config(&shared);
        assert_eq!(config.host, "mqtt.test.com");
        assert_eq!(config.port, 8883);
        assert_eq!(config.client_id, "test-id");
        assert_eq!(config.topic("power"), "club/power");
        assert_eq!(config.credentials, Some(("user".to_string(), "pw".to_string())));
    }

    #[test]
    fn runtime_config_builder_chaining() {
        let config = MqttRuntimeConfig::new("broker.local", 1883)
            .client_id("custom-id")
            .topic_prefix("my-layout")
            .heartbeat_ms(2000);
        assert_eq!(config.client_id, "custom-id");
        assert_eq!(config.topic("estop"), "my-layout/estop");
        assert_eq!(config.heartbeat_ms, 2000);
        assert_eq!(config.credentials, None);
    }

    // ========================================================================
    // Message parsing
    // ========================================================================

    #[test]
    fn power_accepts_text_and_json() {
        assert_eq!(
            parse_message("layout", "layout/power/set", b"on"),
            Some(MqttCommand::Power(true))
        );
        assert_eq!(
            parse_message("layout", "layout/power/set", br#"{"on": false}"#),
            Some(MqttCommand::Power(false))
        );
        assert_eq!(parse_message("layout", "layout/power/set", b"maybe"), None);
    }

    #[test]
    fn loco_topics_carry_address() {
        assert_eq!(
            parse_message("layout", "layout/locos/3/speed/set", b"40"),
            Some(MqttCommand::Speed(
                3,
                SpeedRequest {
                    speed: 40,
                    protocol: DecoderProtocol::Mm
                }
            ))
        );
        assert_eq!(
            parse_message("layout", "layout/locos/3/direction/set", br#"{"direction":"backward","protocol":"dcc"}"#),
            Some(MqttCommand::Direction(
                3,
                DirectionRequest {
                    direction: Direction::Backward,
                    protocol: DecoderProtocol::Dcc
                }
            ))
        );
        assert!(matches!(
            parse_message("layout", "layout/locos/3/functions/2/set", b"off"),
            Some(MqttCommand::Function(3, 2, FunctionRequest { on: false, .. }))
        ));
        assert_eq!(parse_message("layout", "layout/locos/x/speed/set", b"40"), None);
    }

    #[test]
    fn accessory_and_foreign_topics() {
        assert!(matches!(
            parse_message("layout", "layout/accessories/12/set", b"green"),
            Some(MqttCommand::Accessory(12, AccessoryRequest { value: AccessoryValue::Green, .. }))
        ));
        assert_eq!(parse_message("layout", "other/power/set", b"on"), None);
        assert_eq!(parse_message("layout", "layoutx/power/set", b"on"), None);
        assert_eq!(parse_message("layout", "layout/estop", b""), Some(MqttCommand::EmergencyStop));
    }

    #[test]
    fn execute_drives_station() {
        let station = VirtualStation::with_defaults();
        station.connect();
        execute(&station, MqttCommand::Power(true));
        assert_eq!(station.session().power(), Some(true));
        execute(&station, MqttCommand::EmergencyStop);
        assert_eq!(station.session().power(), Some(false));
    }

    // ========================================================================
    // Outbound messages
    // ========================================================================

    #[test]
    fn power_event_is_also_retained() {
        let messages = event_messages(&BridgeEvent::Power(PowerEvent { on: true }));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, "events/power");
        assert!(messages[0].1.contains("\"type\":\"power\""));
        assert_eq!(messages[1], ("power".to_string(), "on".to_string(), true));
    }

    #[test]
    fn sensor_event_publishes_contact_value() {
        let event = BridgeEvent::Sensor(SensorEvent {
            id: 1002,
            device_id: 0,
            contact: 2,
            active: true,
            previous_active: false,
            millis: 0,
        });
        let messages = event_messages(&event);
        assert_eq!(messages[1], ("sensors/1002".to_string(), "1".to_string(), true));
    }
}
