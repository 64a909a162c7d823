//! Event parsing and validation
use crate::error::Error::{
    CommandUnknownError, EventInvalidSignature, EventMalformedId,
};
use crate::error::Result;
use crate::utils::unix_time;
use bitcoin_hashes::{sha256, Hash};
use lazy_static::lazy_static;
use secp256k1::{schnorr, Secp256k1, VerifyOnly, XOnlyPublicKey};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::Value;
use serde_json::Number;
use std::str::FromStr;
use tracing::{debug, info};

lazy_static! {
    /// Secp256k1 verification instance.
    pub static ref SECP: Secp256k1<VerifyOnly> = Secp256k1::verification_only();
}

/// Event command in network format.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct EventCmd {
    cmd: String, // expecting static "EVENT"
    event: Event,
}

impl EventCmd {
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event.id
    }
}

/// Parsed nostr event.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    #[serde(deserialize_with = "tag_from_string")]
    // NOTE: array-of-arrays may need to be more general than a string container
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Deserializer that ensures we always have a [`Vec<Vec<String>>`]
fn tag_from_string<'de, D>(deserializer: D) -> Result<Vec<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Kinds {0, 3, 10000–19999} keep a single event per (pubkey, kind).
#[must_use]
pub fn is_replaceable_kind(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
}

/// Kinds {30000–39999} keep a single event per (pubkey, kind, d-tag).
#[must_use]
pub fn is_param_replaceable_kind(kind: u16) -> bool {
    (30_000..40_000).contains(&kind)
}

/// Kinds {20000–29999} are delivered but never durably stored.
#[must_use]
pub fn is_ephemeral_kind(kind: u16) -> bool {
    (20_000..30_000).contains(&kind)
}

/// Convert network event to parsed/validated event.
impl From<EventCmd> for Result<Event> {
    fn from(ec: EventCmd) -> Result<Event> {
        // ensure command is correct
        if ec.cmd == "EVENT" {
            Ok(ec.event)
        } else {
            Err(CommandUnknownError)
        }
    }
}

impl Event {
    /// Check if this event is a delete request (kind 5).
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.kind == 5
    }

    /// Should this event be replayed to subscribers but never stored?
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        is_ephemeral_kind(self.kind)
    }

    /// Is this event replaceable, keyed on (pubkey, kind)?
    #[must_use]
    pub fn is_replaceable(&self) -> bool {
        is_replaceable_kind(self.kind)
    }

    /// Is this event parameterized replaceable, keyed on (pubkey, kind, d-tag)?
    #[must_use]
    pub fn is_param_replaceable(&self) -> bool {
        is_param_replaceable_kind(self.kind)
    }

    /// The distinguishing parameter for a parameterized-replaceable
    /// event: the first value of the first `d` tag, or the empty
    /// string when no such tag exists.
    #[must_use]
    pub fn distinct_param(&self) -> Option<String> {
        if self.is_param_replaceable() {
            Some(
                self.tags
                    .iter()
                    .filter(|t| !t.is_empty() && t[0] == "d")
                    .map(|t| t.get(1).map_or("", |v| v.as_str()).to_string())
                    .next()
                    .unwrap_or_default(),
            )
        } else {
            None
        }
    }

    /// Pull a list of tag values with a specific tag name from the event.
    #[must_use]
    pub fn tag_values_by_name(&self, tag_name: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter(|x| x.len() > 1)
            .filter(|x| x.get(0).unwrap() == tag_name)
            .map(|x| x.get(1).unwrap().clone())
            .collect()
    }

    /// Determine if the event has a given tag name, with a value
    /// contained in the checked set.
    #[must_use]
    pub fn generic_tag_val_intersect(
        &self,
        tagname: char,
        check: &std::collections::HashSet<String>,
    ) -> bool {
        self.tags
            .iter()
            .filter(|t| t.len() > 1)
            .filter(|t| t[0].len() == 1 && t[0].chars().next() == Some(tagname))
            .any(|t| check.contains(&t[1]))
    }

    /// Tags eligible for indexing: the name is a single ASCII
    /// alphanumeric character and a value exists.
    pub fn index_tags(&self) -> impl Iterator<Item = (u8, &str)> {
        self.tags
            .iter()
            .filter(|t| t.len() > 1)
            .filter(|t| t[0].len() == 1 && t[0].chars().next().unwrap().is_ascii_alphanumeric())
            .map(|t| (t[0].as_bytes()[0], t[1].as_str()))
    }

    /// Check that the event `created_at` lies within the accepted
    /// window around the current time.
    #[must_use]
    pub fn is_valid_timestamp(&self, reject_older: Option<u64>, reject_newer: Option<u64>) -> bool {
        let now = unix_time() as i64;
        if let Some(newer) = reject_newer {
            if self.created_at > now + newer as i64 {
                return false;
            }
        }
        if let Some(older) = reject_older {
            if self.created_at < now - older as i64 {
                return false;
            }
        }
        true
    }

    /// The decoded 32-byte event id.
    pub fn id_bytes(&self) -> Result<[u8; 32]> {
        let v = hex::decode(&self.id)?;
        v.try_into().map_err(|_| EventMalformedId)
    }

    /// The decoded 32-byte author pubkey.
    pub fn pubkey_bytes(&self) -> Result<[u8; 32]> {
        let v = hex::decode(&self.pubkey)?;
        v.try_into().map_err(|_| EventMalformedId)
    }

    /// Check if the event id matches the canonical hash and the
    /// signature is valid for the author key.
    pub fn validate(&self) -> Result<()> {
        let c_opt = self.to_canonical();
        if c_opt.is_none() {
            debug!("could not canonicalize");
            return Err(EventMalformedId);
        }
        let c = c_opt.unwrap();
        // * compute the sha256sum.
        let digest: sha256::Hash = sha256::Hash::hash(c.as_bytes());
        let hex_digest = format!("{digest:x}");
        // * ensure the id matches the computed sha256sum.
        if self.id != hex_digest {
            debug!("event id does not match digest");
            return Err(EventMalformedId);
        }
        // * validate the message digest (sig) using the pubkey & computed sha256 message hash.
        let sig = schnorr::Signature::from_str(&self.sig).map_err(|_| EventInvalidSignature)?;
        if let Ok(msg) = secp256k1::Message::from_slice(digest.as_ref()) {
            if let Ok(pubkey) = XOnlyPublicKey::from_str(&self.pubkey) {
                SECP.verify_schnorr(&sig, &msg, &pubkey)
                    .map_err(|_| EventInvalidSignature)
            } else {
                debug!("client sent malformed pubkey");
                Err(EventMalformedId)
            }
        } else {
            info!("error converting digest to secp256k1 message");
            Err(EventInvalidSignature)
        }
    }

    /// Convert event to canonical representation for signing.
    #[must_use]
    pub fn to_canonical(&self) -> Option<String> {
        // create a JsonValue for each event element
        let mut c: Vec<Value> = vec![];
        // id must be set to 0
        let id = Number::from(0_u64);
        c.push(serde_json::Value::Number(id));
        // public key
        c.push(Value::String(self.pubkey.clone()));
        // creation time
        let created_at = Number::from(self.created_at);
        c.push(serde_json::Value::Number(created_at));
        // kind
        let kind = Number::from(self.kind);
        c.push(serde_json::Value::Number(kind));
        // tags
        c.push(self.tags_to_canonical());
        // content
        c.push(Value::String(self.content.clone()));
        serde_json::to_string(&Value::Array(c)).ok()
    }

    /// Convert tags to a canonical form for signing.
    fn tags_to_canonical(&self) -> Value {
        let mut tags = Vec::<Value>::new();
        // iterate over self tags,
        for t in &self.tags {
            // each tag is a vec of strings
            let mut a = Vec::<Value>::new();
            for v in t.iter() {
                a.push(serde_json::Value::String(v.clone()));
            }
            tags.push(serde_json::Value::Array(a));
        }
        serde_json::Value::Array(tags)
    }

    /// Get a short event identifier, suitable for logging.
    #[must_use]
    pub fn get_event_id_prefix(&self) -> String {
        self.id.chars().take(8).collect()
    }
}
