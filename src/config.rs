//! Bridge configuration.
//!
//! One [`BridgeConfig`] tree selects the backend and carries the settings of
//! every backend, the safety monitor and the optional network surfaces.
//! Defaults equal the protocol constants, so an empty JSON document is a
//! valid configuration for the virtual station.
//!
//! Hostnames and port names use `heapless::String` so the tree stays `Clone`
//! without allocation concerns and has a fixed upper size.
//!
//! # Example
//!
//! ```rust
//! use rs_trainz_bridge::config::{BackendKind, BridgeConfig, CanConfig, WebConfig};
//!
//! // Use defaults
//! let config = BridgeConfig::default();
//! assert_eq!(config.backend, BackendKind::Virtual);
//!
//! // Or customize
//! let config = BridgeConfig::default()
//!     .with_backend(BackendKind::MarklinCan)
//!     .with_can(CanConfig::default().with_host("192.168.1.50"))
//!     .with_web(WebConfig::default().with_port(3000));
//! assert_eq!(config.can.host.as_str(), "192.168.1.50");
//! ```

use core::time::Duration;

use heapless::String as HString;

use crate::backend::{CanSettings, LegacySettings, TextSettings};
use crate::codec::can::DEFAULT_SENDER_UID;
use crate::connection::ConnectionSettings;
use crate::safety::DEFAULT_MAX_DWELL_MS;

/// Maximum length for short config strings (hostnames, port names, client IDs)
pub const MAX_SHORT_STRING: usize = 64;

/// Maximum length for longer config strings (topic prefixes)
pub const MAX_LONG_STRING: usize = 128;

/// Type alias for short config strings
pub type ShortString = HString<MAX_SHORT_STRING>;

/// Type alias for longer config strings
pub type LongString = HString<MAX_LONG_STRING>;

// ============================================================================
// Helpers for creating heapless strings
// ============================================================================

fn truncated<const N: usize>(s: &str) -> HString<N> {
    let mut hs = HString::new();
    // last char boundary that fits
    let end = s
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= N)
        .last()
        .unwrap_or(0);
    let _ = hs.push_str(&s[..end]);
    hs
}

/// Create a ShortString from a &str, truncating if too long
pub fn short_string(s: &str) -> ShortString {
    truncated(s)
}

/// Create a LongString from a &str, truncating if too long
pub fn long_string(s: &str) -> LongString {
    truncated(s)
}

// ============================================================================
// Main Config
// ============================================================================

/// Which command station family the bridge talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BackendKind {
    /// 6050-style serial interface.
    LegacySerial,
    /// CAN central station over TCP or UDP.
    MarklinCan,
    /// Text-protocol station over TCP or serial.
    DccEx,
    /// Software station without hardware.
    #[default]
    Virtual,
}

impl BackendKind {
    /// Parse a backend name as used on the command line.
    pub fn from_text(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "legacy" | "legacy_serial" | "6050" => Some(Self::LegacySerial),
            "can" | "marklin_can" | "cs2" | "cs3" => Some(Self::MarklinCan),
            "text" | "dcc_ex" | "dccex" => Some(Self::DccEx),
            "virtual" => Some(Self::Virtual),
            _ => None,
        }
    }
}

/// Complete bridge configuration
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BridgeConfig {
    /// Selected backend
    pub backend: BackendKind,
    /// Legacy serial interface
    pub serial: SerialConfig,
    /// CAN central station
    pub can: CanConfig,
    /// Text-protocol station
    pub text: TextConfig,
    /// Accessory coil supervision
    pub safety: SafetyConfig,
    /// Feedback modules
    pub feedback: FeedbackConfig,
    /// Reconnects and query timeouts
    pub connection: ConnectionConfig,
    /// UDP discovery responder
    pub discovery: DiscoveryConfig,
    /// Web server configuration
    pub web: WebConfig,
    /// MQTT client configuration
    pub mqtt: MqttConfig,
}

impl BridgeConfig {
    /// Load a full or partial JSON document; missing fields keep their defaults.
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> crate::error::Result<Self> {
        serde_json::from_str(json).map_err(|e| crate::error::BridgeError::Config(e.to_string()))
    }

    /// Set the backend
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set serial configuration
    pub fn with_serial(mut self, serial: SerialConfig) -> Self {
        self.serial = serial;
        self
    }

    /// Set CAN configuration
    pub fn with_can(mut self, can: CanConfig) -> Self {
        self.can = can;
        self
    }

    /// Set text-protocol configuration
    pub fn with_text(mut self, text: TextConfig) -> Self {
        self.text = text;
        self
    }

    /// Set safety configuration
    pub fn with_safety(mut self, safety: SafetyConfig) -> Self {
        self.safety = safety;
        self
    }

    /// Set feedback configuration
    pub fn with_feedback(mut self, feedback: FeedbackConfig) -> Self {
        self.feedback = feedback;
        self
    }

    /// Set connection configuration
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set discovery configuration
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    /// Set web configuration
    pub fn with_web(mut self, web: WebConfig) -> Self {
        self.web = web;
        self
    }

    /// Set MQTT configuration
    pub fn with_mqtt(mut self, mqtt: MqttConfig) -> Self {
        self.mqtt = mqtt;
        self
    }

    /// Settings of the legacy backend.
    pub fn legacy_settings(&self) -> LegacySettings {
        LegacySettings::default()
            .with_pacing(Duration::from_millis(self.serial.pacing_ms.into()))
            .with_tick(Duration::from_millis(self.connection.tick_ms.into()))
            .with_reply_timeout(Duration::from_millis(self.serial.reply_timeout_ms.into()))
            .with_max_dwell_ms(self.safety.max_dwell_ms.into())
            .with_feedback(self.feedback.modules, self.feedback.address_offset)
            .with_poll_interval(Duration::from_millis(self.feedback.poll_interval_ms.into()))
    }

    /// Settings of the CAN backend.
    pub fn can_settings(&self) -> CanSettings {
        CanSettings::default()
            .with_pacing(Duration::from_millis(self.can.pacing_ms.into()))
            .with_tick(Duration::from_millis(self.connection.tick_ms.into()))
            .with_reply_timeout(Duration::from_millis(self.can.reply_timeout_ms.into()))
            .with_probe_timeout(Duration::from_millis(self.can.probe_timeout_ms.into()))
            .with_max_dwell_ms(self.safety.max_dwell_ms.into())
            .with_sender_uid(self.can.sender_uid)
            .with_address_offset(self.feedback.address_offset)
            .with_describe_devices(self.can.describe_devices)
    }

    /// Settings of the text backend.
    pub fn text_settings(&self) -> TextSettings {
        TextSettings::default()
            .with_tick(Duration::from_millis(self.connection.tick_ms.into()))
            .with_reply_timeout(Duration::from_millis(self.text.reply_timeout_ms.into()))
            .with_grace(Duration::from_millis(self.text.grace_ms.into()))
            .with_sensor_window(Duration::from_millis(self.text.sensor_window_ms.into()))
            .with_address_offset(self.feedback.address_offset)
    }

    /// Settings of the connection manager.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings::default()
            .with_reconnect(self.connection.reconnect)
            .with_request_timeout(Duration::from_millis(self.connection.request_timeout_ms.into()))
    }
}

// ============================================================================
// Serial Config
// ============================================================================

/// Legacy serial interface configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SerialConfig {
    /// OS port name
    pub port: ShortString,
    /// Pause between the bytes of one command (milliseconds)
    pub byte_pause_ms: u32,
    /// Longest wait for CTS before sending anyway (milliseconds)
    pub cts_timeout_ms: u32,
    /// Delay between commands (milliseconds)
    pub pacing_ms: u32,
    /// Feedback reply deadline (milliseconds)
    pub reply_timeout_ms: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: short_string("/dev/ttyUSB0"),
            byte_pause_ms: 10,
            cts_timeout_ms: 100,
            pacing_ms: 50,
            reply_timeout_ms: 2000,
        }
    }
}

impl SerialConfig {
    /// Set the port name
    pub fn with_port(mut self, port: &str) -> Self {
        self.port = short_string(port);
        self
    }

    /// Set the inter-byte pause
    pub fn with_byte_pause_ms(mut self, ms: u32) -> Self {
        self.byte_pause_ms = ms;
        self
    }

    /// Set the CTS wait limit
    pub fn with_cts_timeout_ms(mut self, ms: u32) -> Self {
        self.cts_timeout_ms = ms;
        self
    }

    /// Set the inter-command pacing
    pub fn with_pacing_ms(mut self, ms: u32) -> Self {
        self.pacing_ms = ms;
        self
    }
}

// ============================================================================
// CAN Config
// ============================================================================

/// Transport to a CAN central station.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CanTransport {
    /// 13-byte frames over one TCP stream.
    #[default]
    Tcp,
    /// Datagrams to the command port, replies on the receive port.
    Udp,
}

/// CAN central station configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CanConfig {
    /// Station hostname or IP
    pub host: ShortString,
    /// TCP or UDP
    pub transport: CanTransport,
    /// TCP port and UDP command port
    pub port: u16,
    /// Local UDP receive port
    pub receive_port: u16,
    /// UID the bridge sends as
    pub sender_uid: u32,
    /// Delay between commands (milliseconds)
    pub pacing_ms: u32,
    /// Reply deadline (milliseconds)
    pub reply_timeout_ms: u32,
    /// Liveness probe deadline (milliseconds)
    pub probe_timeout_ms: u32,
    /// Read device descriptions on connect
    pub describe_devices: bool,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            host: short_string("192.168.1.2"),
            transport: CanTransport::Tcp,
            port: 15731,
            receive_port: 15730,
            sender_uid: DEFAULT_SENDER_UID,
            pacing_ms: 10,
            reply_timeout_ms: 1000,
            probe_timeout_ms: 500,
            describe_devices: true,
        }
    }
}

impl CanConfig {
    /// Set the station host
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = short_string(host);
        self
    }

    /// Set the transport
    pub fn with_transport(mut self, transport: CanTransport) -> Self {
        self.transport = transport;
        self
    }

    /// Set the TCP / UDP command port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the sender UID
    pub fn with_sender_uid(mut self, uid: u32) -> Self {
        self.sender_uid = uid;
        self
    }
}

// ============================================================================
// Text Config
// ============================================================================

/// Transport to a text-protocol station.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TextTransport {
    /// TCP (WiFi shield).
    #[default]
    Tcp,
    /// USB serial, 115200 8N1.
    Serial,
}

/// Text-protocol station configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TextConfig {
    /// TCP or serial
    pub transport: TextTransport,
    /// Station hostname or IP
    pub host: ShortString,
    /// Station TCP port
    pub port: u16,
    /// Serial port name
    pub serial_port: ShortString,
    /// Time after a write during which replies belong to it (milliseconds)
    pub grace_ms: u32,
    /// Reply deadline (milliseconds)
    pub reply_timeout_ms: u32,
    /// Sensor list collection window (milliseconds)
    pub sensor_window_ms: u32,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            transport: TextTransport::Tcp,
            host: short_string("192.168.4.1"),
            port: 2560,
            serial_port: short_string("/dev/ttyACM0"),
            grace_ms: 50,
            reply_timeout_ms: 1000,
            sensor_window_ms: 200,
        }
    }
}

impl TextConfig {
    /// Connect over TCP
    pub fn with_tcp(mut self, host: &str, port: u16) -> Self {
        self.transport = TextTransport::Tcp;
        self.host = short_string(host);
        self.port = port;
        self
    }

    /// Connect over a serial port
    pub fn with_serial_port(mut self, port: &str) -> Self {
        self.transport = TextTransport::Serial;
        self.serial_port = short_string(port);
        self
    }

    /// Set the grace period
    pub fn with_grace_ms(mut self, ms: u32) -> Self {
        self.grace_ms = ms;
        self
    }
}

// ============================================================================
// Safety / Feedback / Connection Config
// ============================================================================

/// Accessory coil supervision
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SafetyConfig {
    /// Longest time a coil may stay energized (milliseconds)
    pub max_dwell_ms: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_dwell_ms: DEFAULT_MAX_DWELL_MS as u32,
        }
    }
}

impl SafetyConfig {
    /// Set the maximum dwell
    pub fn with_max_dwell_ms(mut self, ms: u32) -> Self {
        self.max_dwell_ms = ms;
        self
    }
}

/// Feedback module layout
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FeedbackConfig {
    /// Number of legacy modules to poll (0 = no polling)
    pub modules: u16,
    /// Added to every sensor id
    pub address_offset: u32,
    /// Legacy poll interval (milliseconds)
    pub poll_interval_ms: u32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            modules: 0,
            address_offset: 0,
            poll_interval_ms: 250,
        }
    }
}

impl FeedbackConfig {
    /// Set module count and id offset
    pub fn with_modules(mut self, modules: u16, address_offset: u32) -> Self {
        self.modules = modules;
        self.address_offset = address_offset;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval_ms(mut self, ms: u32) -> Self {
        self.poll_interval_ms = ms;
        self
    }
}

/// Reconnect and dispatch timing
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectionConfig {
    /// Reconnect transparently before operations
    pub reconnect: bool,
    /// Deadline for synchronous queries (milliseconds)
    pub request_timeout_ms: u32,
    /// Dispatcher idle tick (milliseconds)
    pub tick_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            request_timeout_ms: 5000,
            tick_ms: 50,
        }
    }
}

impl ConnectionConfig {
    /// Enable or disable reconnects
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the idle tick
    pub fn with_tick_ms(mut self, ms: u32) -> Self {
        self.tick_ms = ms;
        self
    }
}

// ============================================================================
// Discovery Config
// ============================================================================

/// UDP discovery responder configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DiscoveryConfig {
    /// UDP port to listen on
    pub port: u16,
    /// Datagram a client broadcasts
    pub challenge: ShortString,
    /// Answer sent back, followed by the service port
    pub response: ShortString,
    /// Whether discovery is enabled
    pub enabled: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 15732,
            challenge: short_string("RS-TRAINZ-BRIDGE?"),
            response: short_string("RS-TRAINZ-BRIDGE"),
            enabled: false,
        }
    }
}

impl DiscoveryConfig {
    /// Set the listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set challenge and response strings
    pub fn with_strings(mut self, challenge: &str, response: &str) -> Self {
        self.challenge = short_string(challenge);
        self.response = short_string(response);
        self
    }

    /// Enable or disable discovery
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

// ============================================================================
// MQTT Config
// ============================================================================

/// MQTT client configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MqttConfig {
    /// Broker hostname or IP
    pub host: ShortString,
    /// Broker port
    pub port: u16,
    /// Client ID (should be unique per bridge)
    pub client_id: ShortString,
    /// Topic prefix for all pub/sub (e.g., "layout" -> "layout/power")
    pub topic_prefix: ShortString,
    /// Username for authentication (empty = no auth)
    pub username: ShortString,
    /// Password for authentication
    pub password: ShortString,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u16,
    /// Whether MQTT is enabled
    pub enabled: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: short_string("localhost"),
            port: 1883,
            client_id: short_string("rs-trainz-bridge"),
            topic_prefix: short_string("layout"),
            username: ShortString::new(),
            password: ShortString::new(),
            keep_alive_secs: 30,
            enabled: false,
        }
    }
}

impl MqttConfig {
    /// Set the broker host
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = short_string(host);
        self
    }

    /// Set the broker port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the client ID
    pub fn with_client_id(mut self, id: &str) -> Self {
        self.client_id = short_string(id);
        self
    }

    /// Set the topic prefix
    pub fn with_topic_prefix(mut self, prefix: &str) -> Self {
        self.topic_prefix = short_string(prefix);
        self
    }

    /// Set authentication credentials
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.username = short_string(username);
        self.password = short_string(password);
        self
    }

    /// Enable or disable MQTT
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Build a topic string with the configured prefix
    pub fn topic(&self, suffix: &str) -> LongString {
        let mut topic = LongString::new();
        let _ = topic.push_str(self.topic_prefix.as_str());
        let _ = topic.push('/');
        let _ = topic.push_str(suffix);
        topic
    }

    /// Check if authentication is configured
    pub fn has_auth(&self) -> bool {
        !self.username.is_empty()
    }
}

// ============================================================================
// Web Config
// ============================================================================

/// Web server configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WebConfig {
    /// Port to listen on
    pub port: u16,
    /// Whether to enable CORS for all origins
    pub cors_permissive: bool,
    /// Whether web server is enabled
    pub enabled: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            cors_permissive: true,
            enabled: true,
        }
    }
}

impl WebConfig {
    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set CORS mode
    pub fn with_cors(mut self, permissive: bool) -> Self {
        self.cors_permissive = permissive;
        self
    }

    /// Enable or disable web server
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
