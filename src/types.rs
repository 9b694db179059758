use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::RegistrationError;

/// Content type every registration must declare.
pub const CONTENT_TYPE_JSON: &str = "json";

/// Device-id pattern applied when a registration leaves the matcher empty.
pub const MATCH_ALL_DEVICES: &str = ".*";

/// Delivery settings of a webhook. `url` is the registry key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub url: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(default, rename = "alt_urls", skip_serializing_if = "Vec::is_empty")]
    pub alternative_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(default)]
    pub device_id: Vec<String>,
}

/// A single webhook subscription.
///
/// `duration` travels as integer nanoseconds and `until` as an RFC 3339
/// timestamp. `until` from a client is never trusted: the registry recomputes
/// it on every upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub config: DeliveryConfig,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub matcher: Matcher,
    #[serde(default, with = "duration_nanos")]
    pub duration: Duration,
    #[serde(default)]
    pub until: DateTime<Utc>,
    #[serde(default, rename = "registered_from_address")]
    pub address: String,
}

impl Webhook {
    /// Registry key.
    pub fn id(&self) -> &str {
        &self.config.url
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.until <= now
    }

    /// Decode, normalize and validate a registration body.
    ///
    /// `remote` is the peer address of the registering request; only its IP
    /// is kept. The requested duration is clamped to `max_duration` and
    /// `until` is derived from it.
    pub fn from_registration(
        body: &[u8],
        remote: Option<SocketAddr>,
        max_duration: Duration,
    ) -> Result<Self, RegistrationError> {
        let mut hook = decode_hook(body).map_err(|e| RegistrationError::InvalidPayload(e.to_string()))?;

        if hook.matcher.device_id.is_empty() {
            hook.matcher.device_id = vec![MATCH_ALL_DEVICES.to_string()];
        }
        hook.validate()?;

        hook.duration = clamp_duration(hook.duration, max_duration);
        hook.until = expiry_from(Utc::now(), hook.duration);
        hook.address = remote.map(|addr| addr.ip().to_string()).unwrap_or_default();

        Ok(hook)
    }

    /// Check the fields a registration must carry.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.config.url.is_empty() {
            return Err(RegistrationError::InvalidUrl("url is required".into()));
        }
        reqwest::Url::parse(&self.config.url)
            .map_err(|e| RegistrationError::InvalidUrl(format!("{}: {e}", self.config.url)))?;

        if self.config.content_type != CONTENT_TYPE_JSON {
            return Err(RegistrationError::InvalidContentType(self.config.content_type.clone()));
        }

        if self.events.is_empty() {
            return Err(RegistrationError::MissingEvents);
        }
        for pattern in self.events.iter().chain(self.matcher.device_id.iter()) {
            Regex::new(pattern).map_err(|e| RegistrationError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}

/// Clamp a requested lifetime into `(0, max]`; anything outside becomes `max`.
pub fn clamp_duration(requested: Duration, max: Duration) -> Duration {
    if requested.is_zero() || requested > max {
        max
    } else {
        requested
    }
}

pub fn expiry_from(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ─── Legacy wire shape ───────────────────────────────────────────────────────

/// Shape written by older deployments: `duration` in whole seconds and
/// `until` as unix seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyWebhook {
    pub config: DeliveryConfig,
    #[serde(default)]
    pub failure_url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub matcher: Matcher,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub until: i64,
    #[serde(default, rename = "registered_from_address")]
    pub address: String,
}

impl From<LegacyWebhook> for Webhook {
    fn from(old: LegacyWebhook) -> Self {
        Self {
            config: old.config,
            failure_url: old.failure_url,
            events: old.events,
            matcher: old.matcher,
            duration: Duration::from_secs(old.duration.max(0) as u64),
            until: DateTime::from_timestamp(old.until, 0).unwrap_or_default(),
            address: old.address,
        }
    }
}

/// Decode one hook, falling back to the legacy shape when the current shape
/// fails on a field type.
pub fn decode_hook(body: &[u8]) -> Result<Webhook, serde_json::Error> {
    match serde_json::from_slice::<Webhook>(body) {
        Ok(hook) => Ok(hook),
        Err(e) if e.classify() == Category::Data => serde_json::from_slice::<LegacyWebhook>(body)
            .map(Webhook::from)
            .map_err(|_| e),
        Err(e) => Err(e),
    }
}

/// Decode a hook list with the same legacy fallback as [`decode_hook`].
pub fn decode_hooks(body: &[u8]) -> Result<Vec<Webhook>, serde_json::Error> {
    match serde_json::from_slice::<Vec<Webhook>>(body) {
        Ok(hooks) => Ok(hooks),
        Err(e) if e.classify() == Category::Data => {
            serde_json::from_slice::<Vec<LegacyWebhook>>(body)
                .map(|old| old.into_iter().map(Webhook::from).collect())
                .map_err(|_| e)
        }
        Err(e) => Err(e),
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        // Negative durations are treated as absent and clamped later.
        let nanos = i64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(300);

    fn registration(extra: serde_json::Value) -> Vec<u8> {
        let mut body = serde_json::json!({
            "config": { "url": "http://consumer.example.com/events", "content_type": "json" },
            "events": ["device-status.*"],
        });
        if let (Some(obj), Some(more)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in more {
                obj.insert(k.clone(), v.clone());
            }
        }
        serde_json::to_vec(&body).unwrap()
    }

    #[test]
    fn registration_defaults_device_matcher_and_strips_port() {
        let addr: SocketAddr = "10.1.2.3:51234".parse().unwrap();
        let hook = Webhook::from_registration(&registration(serde_json::json!({})), Some(addr), MAX)
            .unwrap();

        assert_eq!(hook.matcher.device_id, vec![".*".to_string()]);
        assert_eq!(hook.address, "10.1.2.3");
        assert_eq!(hook.duration, MAX);
    }

    #[test]
    fn registration_keeps_duration_in_range() {
        let body = registration(serde_json::json!({ "duration": 120_000_000_000u64 }));
        let hook = Webhook::from_registration(&body, None, MAX).unwrap();
        assert_eq!(hook.duration, Duration::from_secs(120));
    }

    #[test]
    fn registration_rejects_wrong_content_type() {
        let body = serde_json::to_vec(&serde_json::json!({
            "config": { "url": "http://consumer.example.com", "content_type": "msgpack" },
            "events": [".*"],
        }))
        .unwrap();
        let err = Webhook::from_registration(&body, None, MAX).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidContentType(_)));
    }

    #[test]
    fn registration_rejects_missing_events_and_bad_patterns() {
        let body = registration(serde_json::json!({ "events": [] }));
        assert!(matches!(
            Webhook::from_registration(&body, None, MAX),
            Err(RegistrationError::MissingEvents)
        ));

        let body = registration(serde_json::json!({ "events": ["(unclosed"] }));
        assert!(matches!(
            Webhook::from_registration(&body, None, MAX),
            Err(RegistrationError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn registration_rejects_empty_url() {
        let body = serde_json::to_vec(&serde_json::json!({
            "config": { "url": "", "content_type": "json" },
            "events": [".*"],
        }))
        .unwrap();
        assert!(matches!(
            Webhook::from_registration(&body, None, MAX),
            Err(RegistrationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn clamp_replaces_zero_and_oversized_durations() {
        assert_eq!(clamp_duration(Duration::ZERO, MAX), MAX);
        assert_eq!(clamp_duration(Duration::from_secs(301), MAX), MAX);
        assert_eq!(clamp_duration(Duration::from_secs(1), MAX), Duration::from_secs(1));
        assert_eq!(clamp_duration(MAX, MAX), MAX);
    }

    #[test]
    fn legacy_hook_list_is_converted() {
        let body = br#"[{
            "config": {"url": "http://old.example.com", "content_type": "json"},
            "events": ["iot"],
            "matcher": {"device_id": ["mac:.*"]},
            "duration": 300,
            "until": 1700000000,
            "registered_from_address": "10.0.0.9"
        }]"#;

        let hooks = decode_hooks(body).unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].duration, Duration::from_secs(300));
        assert_eq!(hooks[0].until.timestamp(), 1_700_000_000);
        assert_eq!(hooks[0].address, "10.0.0.9");
    }

    #[test]
    fn current_shape_keeps_nanosecond_duration() {
        let body = br#"{
            "config": {"url": "http://new.example.com", "content_type": "json"},
            "events": ["iot"],
            "duration": 60000000000,
            "until": "2030-01-01T00:00:00Z"
        }"#;

        let hook = decode_hook(body).unwrap();
        assert_eq!(hook.duration, Duration::from_secs(60));
        assert_eq!(hook.until.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn syntax_errors_do_not_fall_back() {
        let err = decode_hook(b"{not json").unwrap_err();
        assert_eq!(err.classify(), Category::Syntax);
    }
}
