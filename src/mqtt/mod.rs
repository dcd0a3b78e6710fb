//! # MQTT Subscriber Module
//!
//! Everything between the command line and the broker: a validated connection
//! configuration, the network loop driving rumqttc, the session reacting to
//! connection events, and the message printer.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - ConnectionConfig, ReconnectPolicy, rumqttc options
//! ├── error.rs            - SessionError, PayloadError
//! ├── message_manager.rs  - MQTTMessage and payload rendering
//! └── mqtt_handler.rs     - Network loop, connection state machine, Session
//! ```
//!
//! ## Lifecycle
//!
//! 1. The network task polls the rumqttc event loop and turns each result into
//!    a `SessionEvent` (connect failure, CONNACK, SUBACK, publish, disconnect).
//! 2. The session prints a line per lifecycle event and subscribes once to
//!    `{base_topic}/#` on every accepted CONNACK.
//! 3. Each publish is printed as JSON when it parses, as text otherwise, and as
//!    escaped bytes when it is not UTF-8. A bad payload never ends the session.
//! 4. Failures before a usable subscription exists are fatal; failures after
//!    that are reported and the session keeps running.
//!
//! Reconnection is rumqttc's own: the event loop reconnects when polled again
//! after an error. Whether the network task keeps polling is decided by the
//! configured `ReconnectPolicy`.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
