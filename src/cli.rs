use clap::Parser;
use std::path::PathBuf;

use crate::config::Overrides;

/// Subscribes to an ASCS topic tree and prints every message it receives.
///
/// Useful for checking that gateway nodes publish correctly. JSON payloads are
/// pretty-printed, anything else is shown as-is.
#[derive(Parser, Debug)]
#[command(name = "mqtt-test-subscriber", version)]
#[command(about = "ASCS MQTT test subscriber")]
pub struct Args {
    /// MQTT broker address [default: localhost]
    #[arg(short, long)]
    pub broker: Option<String>,

    /// MQTT broker port [default: 1883]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Base topic; subscribes to <TOPIC>/# [default: akita/smartcity]
    #[arg(short, long)]
    pub topic: Option<String>,

    /// MQTT username
    #[arg(short, long)]
    pub username: Option<String>,

    /// MQTT password
    #[arg(short = 'P', long)]
    pub password: Option<String>,

    /// Print delivery metadata and debug logs
    #[arg(short, long)]
    pub verbose: bool,

    /// Config file (TOML); command line values take precedence
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Subscription QoS (0, 1 or 2) [default: 0]
    #[arg(short, long)]
    pub qos: Option<u8>,

    /// MQTT client id [default: ascs-sub-<pid>]
    #[arg(short = 'i', long)]
    pub client_id: Option<String>,

    /// Do not reconnect after the connection is lost
    #[arg(long)]
    pub no_reconnect: bool,

    /// Seconds to wait between reconnect attempts [default: 1]
    #[arg(long, value_name = "SECS")]
    pub reconnect_delay: Option<u64>,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            broker: self.broker.clone(),
            port: self.port,
            topic: self.topic.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            client_id: self.client_id.clone(),
            qos: self.qos,
            verbose: self.verbose,
            no_reconnect: self.no_reconnect,
            reconnect_delay_secs: self.reconnect_delay,
        }
    }
}
