//! Shared types and constants for the labshare federation.
//!
//! This crate holds the small value types every other crate passes around:
//! user identities (`token@node`), request ids, node directory records, and
//! availability snapshots. It has no I/O of its own.

use chrono::{NaiveDateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of the random token in a newly issued user identity.
pub const IDENTITY_TOKEN_LEN: usize = 64;

/// Length of the random suffix of a request id.
pub const REQUEST_ID_RANDOM_LEN: usize = 32;

/// Default lifetime of a user identity, in days.
pub const DEFAULT_IDENTITY_TTL_DAYS: i64 = 30;

const REQUEST_ID_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const REQUEST_ID_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Errors produced when parsing shared value types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    /// The identity string is not of the form `token@node`.
    #[error("malformed identity: {0}")]
    MalformedIdentity(String),
    /// The request id is not of the form `timestamp=random`.
    #[error("malformed request id: {0}")]
    MalformedRequestId(String),
}

/// Returns a random alphanumeric string of the given length.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A user credential scoped to its home node, written `token@node`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    token: String,
    node: String,
}

impl Identity {
    /// Issues a fresh identity for a user of `node`.
    pub fn generate(node: &str) -> Self {
        Self {
            token: random_token(IDENTITY_TOKEN_LEN),
            node: node.to_string(),
        }
    }

    /// Builds an identity from its parts, validating both.
    pub fn new(token: &str, node: &str) -> Result<Self, TypesError> {
        let valid_token = !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid_token || !is_valid_node_name(node) {
            return Err(TypesError::MalformedIdentity(format!("{token}@{node}")));
        }
        Ok(Self {
            token: token.to_string(),
            node: node.to_string(),
        })
    }

    /// The random token part.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The name of the node that issued this identity.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Whether this identity was issued by `node_name`.
    pub fn is_home(&self, node_name: &str) -> bool {
        self.node == node_name
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.token, self.node)
    }
}

impl FromStr for Identity {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, node) = s
            .split_once('@')
            .ok_or_else(|| TypesError::MalformedIdentity(s.to_string()))?;
        Self::new(token, node).map_err(|_| TypesError::MalformedIdentity(s.to_string()))
    }
}

impl Serialize for Identity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Node names end up in file names, so they are restricted to a safe alphabet.
pub fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.')
}

/// A request id: `<UTC timestamp>=<random alphanumerics>`.
///
/// The timestamp lets a receiver reject requests that are too old to be
/// anything but a replay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a new request id stamped with the current UTC time.
    pub fn generate() -> Self {
        Self::generate_at(Utc::now().naive_utc())
    }

    /// Generates a request id stamped with `at`.
    pub fn generate_at(at: NaiveDateTime) -> Self {
        Self(format!(
            "{}={}",
            at.format(REQUEST_ID_TIME_FORMAT),
            random_token(REQUEST_ID_RANDOM_LEN)
        ))
    }

    /// Wraps an id received from a peer without validating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the creation time embedded in the id.
    pub fn issued_at(&self) -> Result<NaiveDateTime, TypesError> {
        let (stamp, random) = self
            .0
            .split_once('=')
            .ok_or_else(|| TypesError::MalformedRequestId(self.0.clone()))?;
        if random.is_empty() {
            return Err(TypesError::MalformedRequestId(self.0.clone()));
        }
        NaiveDateTime::parse_from_str(stamp, REQUEST_ID_PARSE_FORMAT)
            .map_err(|_| TypesError::MalformedRequestId(self.0.clone()))
    }

    /// Whether the id was issued no more than `max_age_seconds` before `now`.
    ///
    /// Ids from the future are accepted within the same window to tolerate
    /// clock skew between nodes.
    pub fn is_fresh(&self, now: NaiveDateTime, max_age_seconds: i64) -> bool {
        match self.issued_at() {
            Ok(issued) => (now - issued).num_seconds().abs() <= max_age_seconds,
            Err(_) => false,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer node as stored in `nodes/<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(rename = "laboratory-name")]
    pub laboratory_name: String,
    /// Base URL of the node, e.g. `http://10.0.0.2:8080`.
    pub address: String,
}

impl NodeRecord {
    /// Joins `endpoint` onto the node's base address.
    pub fn endpoint(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.address.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

/// One variant record as returned by a query: the raw fields of a line.
pub type VariantRow = Vec<String>;

/// Result of the most recent health probe for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAvailability {
    #[serde(rename = "laboratory-name")]
    pub laboratory_name: String,
    pub address: String,
    #[serde(rename = "availability")]
    pub reachable: bool,
    pub checked_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn identity_round_trips_through_display() {
        let id = Identity::generate("LabA");
        let parsed: Identity = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.node(), "LabA");
        assert_eq!(parsed.token().len(), IDENTITY_TOKEN_LEN);
    }

    #[test]
    fn identity_rejects_malformed_strings() {
        assert!("no-at-sign".parse::<Identity>().is_err());
        assert!("@LabA".parse::<Identity>().is_err());
        assert!("abc@".parse::<Identity>().is_err());
        assert!("abc@Lab/../etc".parse::<Identity>().is_err());
        assert!("abc@x@y".parse::<Identity>().is_err());
        assert!("abc123@LabA".parse::<Identity>().is_ok());
    }

    #[test]
    fn identity_serializes_as_plain_string() {
        let id: Identity = "abc123@LabA".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc123@LabA\"");
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn request_id_embeds_its_timestamp() {
        let at = NaiveDateTime::parse_from_str("2024-03-01T10:20:30.000000", "%Y-%m-%dT%H:%M:%S%.f")
            .unwrap();
        let id = RequestId::generate_at(at);
        assert_eq!(id.issued_at().unwrap(), at);
        assert!(id.is_fresh(at + Duration::seconds(30), 60));
        assert!(!id.is_fresh(at + Duration::seconds(61), 60));
    }

    #[test]
    fn request_id_accepts_timestamps_without_fraction() {
        let id = RequestId::from_raw("2024-03-01T10:20:30=abc");
        assert!(id.issued_at().is_ok());
        assert!(RequestId::from_raw("garbage").issued_at().is_err());
        assert!(RequestId::from_raw("2024-03-01T10:20:30=").issued_at().is_err());
    }

    #[test]
    fn node_endpoint_joins_without_double_slash() {
        let node = NodeRecord {
            laboratory_name: "LabB".to_string(),
            address: "http://lab-b:8080/".to_string(),
        };
        assert_eq!(node.endpoint("/check-user"), "http://lab-b:8080/check-user");
    }
}
