//! Local transport to the sensor-acquisition daemon.
//!
//! Frames are newline-delimited JSON over a unix socket. Inbound frames
//! carry sensor readings (ACQ), sensor-config confirmations (CFG) and
//! accept/reject answers (ACK/NACK) for configuration commands the gateway
//! queued. Outbound frames carry those configuration commands.

pub mod client;
pub mod commands;

use crate::store::{Sample, SampleValue};
use serde::{Deserialize, Serialize};

/// Frame discriminator shared with the acquisition daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Ident {
    /// Queued configuration command accepted.
    Ack = 0x01,
    /// Queued configuration command rejected.
    Nack = 0x02,
    /// Sensor acquisition data.
    Acq = 0x03,
    /// Sensor acquisition period was (re)configured.
    Cfg = 0x04,
}

impl TryFrom<u8> for Ident {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0x01 => Ok(Ident::Ack),
            0x02 => Ok(Ident::Nack),
            0x03 => Ok(Ident::Acq),
            0x04 => Ok(Ident::Cfg),
            other => Err(format!("unknown transport ident {other:#04x}")),
        }
    }
}

impl From<Ident> for u8 {
    fn from(ident: Ident) -> Self {
        ident as u8
    }
}

/// One line on the acquisition socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub ident: Ident,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SampleValue>,
    /// Acquisition period in seconds (CFG frames).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    /// Sample timestamp in unix seconds (ACQ frames).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("malformed transport frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("incomplete {ident:?} frame: missing {field}")]
    MissingField { ident: Ident, field: &'static str },
}

impl Frame {
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Outbound acquisition-period command for one sensor.
    pub fn configure(sensor: &str, period: u64) -> Self {
        Self {
            ident: Ident::Cfg,
            name: Some(sensor.to_string()),
            value: None,
            time: Some(period),
            ts: None,
        }
    }

    /// Interprets an ACQ frame as a sample.
    pub fn into_sample(self) -> Result<Sample, TransportError> {
        let ident = self.ident;
        let missing = |field| TransportError::MissingField { ident, field };
        Ok(Sample {
            sensor: self.name.ok_or(missing("name"))?,
            value: self.value.ok_or(missing("value"))?,
            ts: self.ts.ok_or(missing("ts"))?,
        })
    }
}

/// What the transport client reports into the service loop.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Frame(Frame),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_acq_frame() {
        let frame = Frame::parse(r#"{"ident":3,"name":"DI1","value":12.5,"ts":1700000000}"#)
            .unwrap();
        assert_eq!(frame.ident, Ident::Acq);

        let sample = frame.into_sample().unwrap();
        assert_eq!(sample.sensor, "DI1");
        assert_eq!(sample.value, SampleValue::Number(12.5));
        assert_eq!(sample.ts, 1700000000);
    }

    #[test]
    fn parses_text_valued_acq_frame() {
        let frame =
            Frame::parse(r#"{"ident":3,"name":"DI2","value":"open","ts":42}"#).unwrap();
        let sample = frame.into_sample().unwrap();
        assert_eq!(sample.value, SampleValue::Text("open".to_string()));
    }

    #[test]
    fn rejects_unknown_ident() {
        assert!(Frame::parse(r#"{"ident":9,"name":"DI1"}"#).is_err());
    }

    #[test]
    fn acq_frame_requires_timestamp() {
        let frame = Frame::parse(r#"{"ident":3,"name":"DI1","value":1}"#).unwrap();
        assert!(matches!(
            frame.into_sample(),
            Err(TransportError::MissingField { field: "ts", .. })
        ));
    }

    #[test]
    fn configure_command_serializes_with_numeric_ident() {
        let line = serde_json::to_string(&Frame::configure("DI1", 5)).unwrap();
        assert_eq!(line, r#"{"ident":4,"name":"DI1","time":5}"#);
    }
}
