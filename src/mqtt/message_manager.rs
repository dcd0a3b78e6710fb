use chrono::{DateTime, Local};
use rumqttc::{Publish, QoS};
use std::fmt;
use std::io::{self, Write};
use tracing::warn;

use super::error::PayloadError;

const SEPARATOR_WIDTH: usize = 40;

/// How a payload is shown. Falling back to raw text is an expected outcome,
/// not an error.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    Json(serde_json::Value),
    Text(&'a str),
}

impl<'a> Payload<'a> {
    pub fn classify(bytes: &'a [u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(bytes)?;
        Ok(match serde_json::from_str(text) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(text),
        })
    }
}

/// One received publish. Created per message and dropped after printing.
#[derive(Clone)]
pub struct MQTTMessage {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
    timestamp: DateTime<Local>,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {} ({} bytes)",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload.len()
        )
    }
}

impl fmt::Debug for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MQTTMessage")
            .field("topic", &self.topic)
            .field("payload", &self.raw_bytes().to_string())
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl From<Publish> for MQTTMessage {
    fn from(publish: Publish) -> Self {
        MQTTMessage {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            qos: publish.qos,
            retain: publish.retain,
            timestamp: Local::now(),
        }
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        MQTTMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            timestamp: Local::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Writes the message block: separator, topic, payload, separator.
    ///
    /// Payload problems are reported inside the block and never returned; the
    /// only error is a failing writer.
    pub fn render<W: Write>(&self, out: &mut W, verbose: bool) -> io::Result<()> {
        let separator = "-".repeat(SEPARATOR_WIDTH);
        writeln!(out, "{separator}")?;
        writeln!(out, "Received message on topic: {}", self.topic)?;
        if verbose {
            writeln!(
                out,
                "Received at: {} (QoS {}, retain {})",
                self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                self.qos as u8,
                self.retain
            )?;
        }

        match self.payload_block() {
            Ok(block) => writeln!(out, "{block}")?,
            Err(err) => {
                warn!(topic = %self.topic, "Could not process payload: {}", err);
                writeln!(out, "Error processing message payload: {err}")?;
                writeln!(out, "Raw payload bytes: {}", self.raw_bytes())?;
            }
        }

        writeln!(out, "{separator}")
    }

    fn payload_block(&self) -> Result<String, PayloadError> {
        match Payload::classify(&self.payload)? {
            Payload::Json(value) => Ok(format!(
                "Payload (JSON):\n{}",
                serde_json::to_string_pretty(&value)?
            )),
            Payload::Text(text) => Ok(format!("Payload (Raw):\n{text}")),
        }
    }

    fn raw_bytes(&self) -> impl fmt::Display + '_ {
        RawBytes(&self.payload)
    }
}

struct RawBytes<'a>(&'a [u8]);

impl fmt::Display for RawBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b\"{}\"", self.0.escape_ascii())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn rendered(message: &MQTTMessage, verbose: bool) -> String {
        let mut out = Vec::new();
        message.render(&mut out, verbose).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn json_section(output: &str) -> &str {
        let start = output.find("Payload (JSON):\n").unwrap() + "Payload (JSON):\n".len();
        let end = output.rfind("\n----").unwrap();
        &output[start..end]
    }

    #[test]
    fn gateway_reading_is_pretty_printed() {
        let message = MQTTMessage::from_topic("akita/smartcity/gateway1/temp", r#"{"value": 21.5}"#);
        let expected = "\
----------------------------------------
Received message on topic: akita/smartcity/gateway1/temp
Payload (JSON):
{
  \"value\": 21.5
}
----------------------------------------
";
        assert_eq!(rendered(&message, false), expected);
    }

    #[test]
    fn pretty_printed_json_parses_back_to_the_same_value() {
        let payloads = [
            r#"{"node":"gw-7","readings":[{"t":21.5},{"h":40}],"ok":true,"err":null}"#,
            "[1, 2, [3, [4]]]",
            "42",
            r#""just a string""#,
            r#"{"nested":{"deeper":{"deepest":"ünïcödé"}}}"#,
        ];
        for payload in payloads {
            let message = MQTTMessage::from_topic("akita/smartcity/x", payload);
            let output = rendered(&message, false);
            let original: Value = serde_json::from_str(payload).unwrap();
            let reparsed: Value = serde_json::from_str(json_section(&output)).unwrap();
            assert_eq!(reparsed, original, "{payload}");
        }
    }

    #[test]
    fn json_keys_keep_their_order() {
        let message = MQTTMessage::from_topic("t", r#"{"zeta":1,"alpha":2,"mid":3}"#);
        let output = rendered(&message, false);
        let zeta = output.find("\"zeta\"").unwrap();
        let alpha = output.find("\"alpha\"").unwrap();
        let mid = output.find("\"mid\"").unwrap();
        assert!(zeta < alpha && alpha < mid);
    }

    #[test]
    fn numbers_keep_their_exact_digits() {
        let message = MQTTMessage::from_topic(
            "akita/smartcity/counter",
            r#"{"id": 123456789012345678901234567890, "ratio": 0.10000000000000000001}"#,
        );
        let output = rendered(&message, false);
        assert!(output.contains("\"id\": 123456789012345678901234567890"), "{output}");
        assert!(output.contains("\"ratio\": 0.10000000000000000001"), "{output}");
    }

    #[test]
    fn nested_json_uses_two_space_indent() {
        let message = MQTTMessage::from_topic("t", json!({"a": {"b": [1]}}).to_string());
        let output = rendered(&message, false);
        assert!(output.contains("{\n  \"a\": {\n    \"b\": [\n      1\n    ]\n  }\n}"));
    }

    #[test]
    fn plain_text_is_printed_verbatim() {
        let message = MQTTMessage::from_topic("akita/smartcity/status", "hello world");
        let output = rendered(&message, false);
        assert!(output.contains("Payload (Raw):\nhello world\n"));
        assert!(!output.contains("Payload (JSON)"));
    }

    #[test]
    fn empty_payload_is_raw() {
        let message = MQTTMessage::from_topic("t", Vec::<u8>::new());
        let output = rendered(&message, false);
        assert!(output.contains("Payload (Raw):\n\n----"));
    }

    #[test]
    fn invalid_utf8_prints_raw_bytes_and_notice() {
        let message = MQTTMessage::from_topic("akita/smartcity/bin", vec![0xff, 0xfe, b'a']);
        let output = rendered(&message, false);
        assert!(output.contains("Error processing message payload: invalid utf-8"));
        assert!(output.contains("Raw payload bytes: b\"\\xff\\xfea\""));
        assert!(output.ends_with(&format!("{}\n", "-".repeat(40))));
        assert!(!output.contains("Payload ("));
    }

    #[test]
    fn every_block_is_framed_by_separators() {
        for payload in [b"{}".to_vec(), b"raw".to_vec(), vec![0x80]] {
            let output = rendered(&MQTTMessage::from_topic("t", payload), false);
            let lines: Vec<&str> = output.lines().collect();
            assert_eq!(lines.first().copied(), Some("-".repeat(40).as_str()));
            assert_eq!(lines.last().copied(), Some("-".repeat(40).as_str()));
            assert_eq!(lines[1], "Received message on topic: t");
        }
    }

    #[test]
    fn verbose_adds_delivery_metadata() {
        let output = rendered(&MQTTMessage::from_topic("t", "x"), true);
        assert!(output.contains("Received at: "));
        assert!(output.contains("(QoS 0, retain false)"));
        assert!(!rendered(&MQTTMessage::from_topic("t", "x"), false).contains("Received at: "));
    }

    #[test]
    fn classify_separates_the_three_outcomes() {
        assert_eq!(
            Payload::classify(br#"{"a":1}"#).unwrap(),
            Payload::Json(json!({"a": 1}))
        );
        assert_eq!(Payload::classify(b"21.5 C").unwrap(), Payload::Text("21.5 C"));
        assert!(matches!(
            Payload::classify(&[0xc3, 0x28]),
            Err(PayloadError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn publish_fields_are_carried_over() {
        let mut publish = Publish::new("akita/smartcity/a", QoS::AtLeastOnce, "1");
        publish.retain = true;
        let message = MQTTMessage::from(publish);
        assert_eq!(message.topic(), "akita/smartcity/a");
        assert_eq!(message.payload(), b"1");
        assert!(rendered(&message, true).contains("(QoS 1, retain true)"));
    }
}
