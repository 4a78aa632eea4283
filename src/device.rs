//! Hardware modules discovered on a backend and their measurement channels.
//!
//! Device metadata arrives in fragments: a ping reply carries UID, firmware
//! version and device type, and a status-config dump carries channel counts,
//! serial number, article number and name across several 8-byte packets.
//! [`DeviceAssembler`] collects the packets of one dump; [`Device`] folds in
//! whatever has arrived and reports [`is_complete`](Device::is_complete) once
//! both name and article number look plausible.

use std::collections::BTreeMap;

// ============================================================================
// Device
// ============================================================================

/// Kind of module reported in a ping reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceKind {
    /// Track format processor of a central station.
    CentralStation,
    /// Track box (60112/60113).
    TrackBox,
    /// Handheld mobile station.
    MobileStation,
    /// Feedback bus link module (L88).
    FeedbackLink,
    /// Central station user interface.
    CentralStationGui,
    /// Anything else.
    #[default]
    Unknown,
}

impl DeviceKind {
    /// Map the 16-bit device type of a ping reply.
    pub fn from_type_code(code: u16) -> Self {
        match code {
            0x0000 | 0xFFFF => DeviceKind::CentralStation,
            0x0010..=0x0012 => DeviceKind::TrackBox,
            0x0030..=0x0033 => DeviceKind::MobileStation,
            0x0040 => DeviceKind::FeedbackLink,
            0xFFE0 => DeviceKind::CentralStationGui,
            _ => DeviceKind::Unknown,
        }
    }
}

/// Identity and capabilities of a backend-discovered module.
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Device {
    /// Module UID.
    pub uid: u32,
    /// Module kind.
    pub kind: DeviceKind,
    /// Article number, e.g. `60214`.
    pub article: String,
    /// Serial number.
    pub serial: u32,
    /// Firmware version (major, minor).
    pub version: (u8, u8),
    /// Human-readable name.
    pub name: String,
    /// Declared number of measurement channels.
    pub measurement_channels: u8,
    /// Declared number of configuration channels.
    pub config_channels: u8,
}

impl Device {
    /// A device known only by UID.
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            ..Self::default()
        }
    }

    /// True once name and article number are both present and plausible.
    pub fn is_complete(&self) -> bool {
        plausible(&self.article, 4, 8) && plausible(&self.name, 2, 64)
    }

    /// Fold in a ping reply.
    pub fn apply_ping(&mut self, major: u8, minor: u8, type_code: u16) {
        self.version = (major, minor);
        self.kind = DeviceKind::from_type_code(type_code);
    }

    /// Fold in a reassembled index-0 description dump.
    ///
    /// Layout: channel counts, two reserved bytes, serial (big endian), eight
    /// ASCII article bytes, then the NUL-terminated name.
    pub fn apply_description(&mut self, bytes: &[u8]) {
        if bytes.len() >= 8 {
            self.measurement_channels = bytes[0];
            self.config_channels = bytes[1];
            self.serial = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        }
        if bytes.len() >= 16 {
            self.article = ascii_field(&bytes[8..16]);
        }
        if bytes.len() > 16 {
            self.name = ascii_field(&bytes[16..]);
        }
    }
}

fn plausible(s: &str, min: usize, max: usize) -> bool {
    let len = s.chars().count();
    len >= min && len <= max && s.chars().all(|c| !c.is_control())
}

fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

// ============================================================================
// Multi-packet Assembly
// ============================================================================

/// Collects the numbered packets of one status-config dump.
///
/// Packets may arrive out of order; the dump is complete when the terminator
/// announced `count` packets and all of them are present.
#[derive(Clone, Debug, Default)]
pub struct DeviceAssembler {
    packets: BTreeMap<u16, [u8; 8]>,
    expected: Option<u16>,
}

impl DeviceAssembler {
    /// Start an empty dump.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store packet `number` (1-based).
    pub fn add_packet(&mut self, number: u16, data: [u8; 8]) {
        if number == 0 {
            tracing::debug!("ignoring config packet number 0");
            return;
        }
        self.packets.insert(number, data);
    }

    /// Record the terminator's packet count.
    pub fn finish(&mut self, count: u16) {
        self.expected = Some(count);
    }

    /// True once the terminator arrived and no packet is missing.
    pub fn is_complete(&self) -> bool {
        match self.expected {
            Some(count) => (1..=count).all(|n| self.packets.contains_key(&n)),
            None => false,
        }
    }

    /// Number of packets received so far.
    pub fn received(&self) -> usize {
        self.packets.len()
    }

    /// Concatenated payload in packet order.
    pub fn bytes(&self) -> Vec<u8> {
        self.packets.values().flat_map(|p| p.iter().copied()).collect()
    }
}

// ============================================================================
// Measurements
// ============================================================================

/// Description and linear scaling of one measurement channel.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeasurementChannel {
    /// Channel number.
    pub number: u8,
    /// Channel name, e.g. `MAIN`.
    pub name: String,
    /// Display unit.
    pub unit: String,
    /// Display value at the zero point.
    pub start: f64,
    /// Display value at full scale.
    pub end: f64,
    /// Raw value that maps to `start`.
    pub zero_point: u16,
    /// Raw value that maps to `end`.
    pub range_max: u16,
    /// Last validity flag reported by the station, if any.
    pub valid: Option<bool>,
}

impl MeasurementChannel {
    /// Create a channel with explicit scaling.
    pub fn new(
        number: u8,
        name: &str,
        unit: &str,
        start: f64,
        end: f64,
        zero_point: u16,
        range_max: u16,
    ) -> Self {
        Self {
            number,
            name: name.to_string(),
            unit: unit.to_string(),
            start,
            end,
            zero_point,
            range_max,
            valid: None,
        }
    }

    /// Linear scaling of a raw reading into display units.
    ///
    /// ```
    /// use rs_trainz_bridge::device::MeasurementChannel;
    ///
    /// let main = MeasurementChannel::new(1, "MAIN", "A", 0.0, 5.0, 0, 1000);
    /// assert!((main.scale(500) - 2.5).abs() < 1e-9);
    /// ```
    pub fn scale(&self, raw: u16) -> f64 {
        let span = f64::from(self.range_max.saturating_sub(self.zero_point));
        if span == 0.0 {
            return self.start;
        }
        let offset = f64::from(raw.saturating_sub(self.zero_point));
        self.start + (self.end - self.start) * offset / span
    }

    /// Parse a reassembled channel description dump (status-config index n).
    ///
    /// Layout: index, exponent, four colour bytes, zero point, four ranges
    /// (all u16 big endian), then NUL-separated name, start, end and unit.
    pub fn from_description(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let number = bytes[0];
        let zero_point = u16::from_be_bytes([bytes[6], bytes[7]]);
        let range_max = (0..4)
            .map(|i| u16::from_be_bytes([bytes[8 + i * 2], bytes[9 + i * 2]]))
            .max()
            .unwrap_or(0);
        let mut strings = bytes[16..]
            .split(|&b| b == 0)
            .map(|s| String::from_utf8_lossy(s).trim().to_string());
        let name = strings.next().unwrap_or_default();
        let start = strings.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let end = strings.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let unit = strings.next().unwrap_or_default();
        Some(Self {
            number,
            name,
            unit,
            start,
            end,
            zero_point,
            range_max,
            valid: None,
        })
    }

    /// Scale a raw reading into a [`Measurement`].
    pub fn measure(&self, raw: u16) -> Measurement {
        Measurement {
            channel: self.number,
            raw,
            value: self.scale(raw),
            unit: self.unit.clone(),
            valid: self.valid.unwrap_or(true),
        }
    }
}

/// Built-in channel table used until the station describes its own.
pub fn default_channels() -> Vec<MeasurementChannel> {
    vec![
        MeasurementChannel::new(1, "MAIN", "A", 0.0, 5.0, 0, 4095),
        MeasurementChannel::new(2, "PROG", "A", 0.0, 2.5, 0, 4095),
        MeasurementChannel::new(3, "VOLT", "V", 10.0, 27.0, 0, 4095),
        MeasurementChannel::new(4, "TEMP", "C", 0.0, 80.0, 0, 4095),
    ]
}

/// A decoded analog reading.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Measurement {
    /// Channel number.
    pub channel: u8,
    /// Raw reading.
    pub raw: u16,
    /// Scaled display value.
    pub value: f64,
    /// Display unit.
    pub unit: String,
    /// Validity as last reported for this channel.
    pub valid: bool,
}
