//! Relay metadata using NIP-11
use crate::config::Settings;
/// Relay Info
use const_format::formatcp;
use serde::{Deserialize, Serialize};

pub const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Software identification string sent in HTTP responses.
pub const SERVER: &str = formatcp!("quadrelay/{}", CARGO_PKG_VERSION);

#[derive(Debug, Serialize, Deserialize)]
#[allow(unused)]
pub struct RelayInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_nips: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limitation: Option<Limitation>,
}

#[derive(Debug, Serialize, Deserialize)]
#[allow(unused)]
pub struct Limitation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<usize>,
}

/// Convert the relay configuration into public relay info
impl From<&Settings> for RelayInfo {
    fn from(c: &Settings) -> Self {
        let limitation = Limitation {
            max_message_length: c.limits.max_ws_message_bytes,
            max_subscriptions: Some(c.limits.max_subs_per_connection),
            max_subid_length: Some(64),
        };
        RelayInfo {
            id: c.info.relay_url.clone(),
            name: c.info.name.clone(),
            description: c.info.description.clone(),
            pubkey: c.info.pubkey.clone(),
            contact: c.info.contact.clone(),
            supported_nips: Some(vec![1, 2, 9, 11, 77]),
            software: Some("https://github.com/quadrelay/quadrelay".to_owned()),
            version: Some(CARGO_PKG_VERSION.to_owned()),
            limitation: Some(limitation),
        }
    }
}
