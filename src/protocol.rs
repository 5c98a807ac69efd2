use serde::Serialize;
use std::fmt;

/// Field separator of the sensor's text frames
pub const FIELD_SEPARATOR: char = ':';

/// Frame tags emitted by the sensor firmware, in matching priority order
pub const TAG_ALERT_WET: &str = "ALERTA:HUMEDO";
/// Dry status frame tag
pub const TAG_STATUS_DRY: &str = "ESTADO:SECO";
/// Periodic status frame tag
pub const TAG_STATUS: &str = "STATUS:";
/// Baseline recalibration frame tag
pub const TAG_BASELINE_UPDATE: &str = "BASELINE_UPDATE";
/// Sensor boot frame tag
pub const TAG_STARTED: &str = "INICIO:";
/// Connection acknowledgement frame tag
pub const TAG_CONNECTED: &str = "CONECTADO:";

const VALUE_MARKER: &str = "VAL=";
const BASELINE_MARKER: &str = "BASE=";

/// A numeric field as reported by the sensor
///
/// Firmware glitches occasionally produce non-numeric values; those are kept
/// verbatim instead of rejecting the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    /// Field parsed as an integer
    Value(i64),
    /// Field that did not parse, passed through untouched
    Opaque(String),
}

impl Reading {
    fn parse(field: &str) -> Self {
        field
            .parse::<i64>()
            .map_or_else(|_| Self::Opaque(field.to_string()), Self::Value)
    }

    /// Integer value, if the field was numeric
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Value(value) => Some(*value),
            Self::Opaque(_) => None,
        }
    }
}

impl From<i64> for Reading {
    fn from(value: i64) -> Self {
        Self::Value(value)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{value}"),
            Self::Opaque(raw) => f.write_str(raw),
        }
    }
}

/// A decoded sensor notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Moisture crossed the wet threshold
    AlertWet {
        /// Raw sensor reading
        raw_value: Reading,
    },
    /// Sensor reports a dry state
    StatusDry {
        /// Raw sensor reading
        raw_value: Reading,
    },
    /// Periodic status report
    StatusPeriodic {
        /// State label reported by the firmware
        state: String,
        /// Raw sensor reading
        raw_value: Reading,
        /// Calibration baseline, when the frame carries one
        baseline: Option<Reading>,
    },
    /// The sensor recalibrated its baseline
    BaselineUpdate {
        /// New baseline
        baseline: Reading,
    },
    /// The sensor booted
    Started {
        /// Free-form detail (firmware version and similar)
        detail: String,
    },
    /// The sensor acknowledged the connection
    Connected {
        /// Free-form detail
        detail: String,
    },
    /// Frame that matches no known layout
    Unrecognized {
        /// Frame text as received
        raw: String,
    },
}

impl TelemetryEvent {
    /// Whether this event must raise the external alert
    #[must_use]
    pub const fn is_alert(&self) -> bool {
        matches!(self, Self::AlertWet { .. })
    }
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlertWet { raw_value } => {
                write!(f, "🚨 ALERT: wet diaper detected (value: {raw_value})")
            }
            Self::StatusDry { raw_value } => write!(f, "✓ Status: dry (value: {raw_value})"),
            Self::StatusPeriodic {
                state,
                raw_value,
                baseline,
            } => {
                write!(f, "📊 State: {state} | Value: {raw_value} | Baseline: ")?;
                match baseline {
                    Some(baseline) => write!(f, "{baseline}"),
                    None => f.write_str("N/A"),
                }
            }
            Self::BaselineUpdate { baseline } => write!(f, "🔧 Baseline updated: {baseline}"),
            Self::Started { detail } => write!(f, "🚀 Sensor started: {detail}"),
            Self::Connected { detail } => write!(f, "🔗 Connection established: {detail}"),
            Self::Unrecognized { raw } => write!(f, "📱 {raw}"),
        }
    }
}

/// Decode a sensor text frame
///
/// Tags are matched in a fixed priority order and the first matching prefix
/// wins. A frame that carries a known tag but too few fields falls through to
/// [`TelemetryEvent::Unrecognized`]; decoding never fails.
#[must_use]
pub fn decode(raw: &str) -> TelemetryEvent {
    let fields: Vec<&str> = raw.split(FIELD_SEPARATOR).collect();

    if raw.starts_with(TAG_ALERT_WET) {
        if fields.len() >= 3 {
            return TelemetryEvent::AlertWet {
                raw_value: value_field(fields[2]),
            };
        }
    } else if raw.starts_with(TAG_STATUS_DRY) {
        if fields.len() >= 3 {
            return TelemetryEvent::StatusDry {
                raw_value: value_field(fields[2]),
            };
        }
    } else if raw.starts_with(TAG_STATUS) {
        if fields.len() >= 4 {
            // Substring check only; anything else in the fourth field means no baseline
            let baseline = fields[3]
                .contains(BASELINE_MARKER)
                .then(|| Reading::parse(&fields[3].replace(BASELINE_MARKER, "")));
            return TelemetryEvent::StatusPeriodic {
                state: fields[1].to_string(),
                raw_value: value_field(fields[2]),
                baseline,
            };
        }
    } else if raw.starts_with(TAG_BASELINE_UPDATE) {
        if fields.len() >= 2 {
            return TelemetryEvent::BaselineUpdate {
                baseline: Reading::parse(fields[1]),
            };
        }
    } else if let Some(detail) = raw.strip_prefix(TAG_STARTED) {
        return TelemetryEvent::Started {
            detail: detail.to_string(),
        };
    } else if let Some(detail) = raw.strip_prefix(TAG_CONNECTED) {
        return TelemetryEvent::Connected {
            detail: detail.to_string(),
        };
    }

    TelemetryEvent::Unrecognized {
        raw: raw.to_string(),
    }
}

/// Decode a raw notification payload
///
/// Invalid UTF-8 sequences are replaced rather than rejected so that every
/// payload yields an event.
#[must_use]
pub fn decode_bytes(payload: &[u8]) -> TelemetryEvent {
    decode(&String::from_utf8_lossy(payload))
}

fn value_field(field: &str) -> Reading {
    Reading::parse(&field.replace(VALUE_MARKER, ""))
}
