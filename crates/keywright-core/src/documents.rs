//! On-disk shapes of the persisted documents.
//!
//! Field names here are the wire format; the rest of the crate only sees
//! these typed records through [`crate::store::Store`].

use chrono::{DateTime, Utc};
use keywright_keychain::KeyAlgorithm;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_EXPIRY_DAYS: u32 = 90;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub test_command: String,
    pub success_message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationRecord {
    pub days: u32,
    #[serde(with = "timestamp")]
    pub set_date: DateTime<Utc>,
}

impl ExpirationRecord {
    /// Whole days remaining at `now`; zero or negative once expired.
    pub fn days_left(&self, now: DateTime<Utc>) -> i64 {
        i64::from(self.days) - (now - self.set_date).num_days()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(with = "timestamp")]
    pub created: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
}

pub type UsageDocument = BTreeMap<String, UsageRecord>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default = "default_key_type")]
    pub default_key_type: KeyAlgorithm,
    #[serde(default)]
    pub default_key_comment: String,
    #[serde(default = "default_expiry_days")]
    pub key_expiry_days: u32,
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub key_expiration: BTreeMap<String, ExpirationRecord>,
    #[serde(default)]
    pub repo_links: BTreeMap<String, String>,
    /// Keys this version does not know about, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            default_key_type: default_key_type(),
            default_key_comment: String::new(),
            key_expiry_days: default_expiry_days(),
            providers: default_providers(),
            key_expiration: BTreeMap::new(),
            repo_links: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RepoLink {
    pub url: String,
    pub key: String,
}

fn default_key_type() -> KeyAlgorithm {
    KeyAlgorithm::Ed25519
}

fn default_expiry_days() -> u32 {
    DEFAULT_EXPIRY_DAYS
}

fn default_providers() -> BTreeMap<String, ProviderConfig> {
    [
        ("github.com", "successfully authenticated"),
        ("gitlab.com", "Welcome to GitLab"),
        ("bitbucket.org", "logged in as"),
    ]
    .into_iter()
    .map(|(host, marker)| {
        (
            host.to_string(),
            ProviderConfig {
                test_command: format!("ssh -T git@{}", host),
                success_message: marker.to_string(),
            },
        )
    })
    .collect()
}

/// RFC 3339 on write; also accepts naive ISO-8601 (read as local time) so
/// documents written by older tools still load.
pub(crate) mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn default_document_shape() {
        let doc = ConfigDocument::default();
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["default_key_type"], "ed25519");
        assert_eq!(value["key_expiry_days"], 90);
        assert_eq!(
            value["providers"]["gitlab.com"]["success_message"],
            "Welcome to GitLab"
        );
        assert_eq!(
            value["providers"]["github.com"]["test_command"],
            "ssh -T git@github.com"
        );
    }

    #[test]
    fn unknown_keys_survive_roundtrip() {
        let raw = r#"{"default_key_type":"rsa","ui_theme":"dark","key_expiration":{}}"#;
        let doc: ConfigDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.default_key_type, KeyAlgorithm::Rsa);
        assert_eq!(doc.providers.len(), 3);
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["ui_theme"], "dark");
    }

    #[test]
    fn naive_timestamps_are_accepted() {
        let raw = r#"{"created":"2024-03-01T10:15:30.123456","last_used":"2024-03-02T08:00:00+00:00","use_count":4}"#;
        let usage: UsageRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(usage.use_count, 4);
        assert_eq!(
            usage.last_used,
            Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap()
        );
        assert!(timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn days_left_counts_whole_days() {
        let set = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let rec = ExpirationRecord {
            days: 10,
            set_date: set,
        };
        assert_eq!(rec.days_left(set), 10);
        assert_eq!(rec.days_left(set + Duration::hours(23)), 10);
        assert_eq!(rec.days_left(set + Duration::days(3)), 7);
        assert_eq!(rec.days_left(set + Duration::days(12)), -2);
    }
}
