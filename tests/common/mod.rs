//! Shared fixtures: an in-memory SNS, a throwaway signing certificate served
//! over wiremock, and builders for signed SNS callbacks.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine as _;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::x509::{X509Builder, X509NameBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xmidt_webhook::config::{AwsConfig, SnsConfig};
use xmidt_webhook::error::NotifierError;
use xmidt_webhook::sns::client::{SnsApi, SubscriptionPage};
use xmidt_webhook::sns::message::{
    MessageAttribute, SnsMessage, ENV_ATTRIBUTE, TYPE_NOTIFICATION, TYPE_SUBSCRIPTION_CONFIRMATION,
};
use xmidt_webhook::verification::string_to_sign;

pub const TOPIC_ARN: &str = "arn:aws:sns:us-east-1:000000000000:webhooks";
pub const ENV: &str = "test";
pub const SELF_BASE: &str = "https://scytale.example.com";
pub const URL_PATH: &str = "/api/v2/aws/sns";
pub const CONFIRMED_ARN: &str = "arn:aws:sns:us-east-1:000000000000:webhooks:0f9a";
pub const CERT_PATH: &str = "/SimpleNotificationService-test.pem";

pub fn aws_config() -> AwsConfig {
    AwsConfig {
        env: ENV.to_string(),
        sns: SnsConfig {
            region: "us-east-1".to_string(),
            protocol: "https".to_string(),
            topic_arn: TOPIC_ARN.to_string(),
            url_path: URL_PATH.to_string(),
        },
        publish_timeout_secs: 1,
        subscribe_retry_secs: 0,
        max_subscribe_attempts: Some(3),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// MockSns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic_arn: String,
    pub message: String,
    pub attributes: HashMap<String, String>,
}

/// In-memory SNS that records every call.
#[derive(Default)]
pub struct MockSns {
    pub subscribe_failures: AtomicU32,
    pub subscribe_calls: AtomicU32,
    pub subscribed_endpoints: Mutex<Vec<String>>,
    pub confirmed_tokens: Mutex<Vec<String>>,
    pub published: Mutex<Vec<Published>>,
    pub pages: Mutex<Vec<SubscriptionPage>>,
    pub unsubscribed: Mutex<Vec<String>>,
}

impl MockSns {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: u32) -> Arc<Self> {
        let mock = Self::default();
        mock.subscribe_failures.store(times, Ordering::SeqCst);
        Arc::new(mock)
    }

    pub fn with_pages(pages: Vec<SubscriptionPage>) -> Arc<Self> {
        let mock = Self::default();
        *mock.pages.lock().unwrap() = pages;
        Arc::new(mock)
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnsApi for MockSns {
    async fn subscribe(
        &self,
        _topic_arn: &str,
        _protocol: &str,
        endpoint: &str,
    ) -> Result<String, NotifierError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.subscribe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.subscribe_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(NotifierError::aws("Subscribe", "throttled"));
        }
        self.subscribed_endpoints
            .lock()
            .unwrap()
            .push(endpoint.to_string());
        Ok("pending confirmation".to_string())
    }

    async fn confirm_subscription(
        &self,
        _topic_arn: &str,
        token: &str,
    ) -> Result<String, NotifierError> {
        self.confirmed_tokens.lock().unwrap().push(token.to_string());
        Ok(CONFIRMED_ARN.to_string())
    }

    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &[(&str, &str)],
    ) -> Result<String, NotifierError> {
        let mut published = self.published.lock().unwrap();
        published.push(Published {
            topic_arn: topic_arn.to_string(),
            message: message.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        Ok(format!("msg-{}", published.len()))
    }

    async fn list_subscriptions_by_topic(
        &self,
        _topic_arn: &str,
        next_token: Option<String>,
    ) -> Result<SubscriptionPage, NotifierError> {
        let index: usize = next_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_default())
    }

    async fn unsubscribe(&self, subscription_arn: &str) -> Result<(), NotifierError> {
        self.unsubscribed
            .lock()
            .unwrap()
            .push(subscription_arn.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Self-signed RSA certificate standing in for the SNS signing cert.
pub struct SigningKey {
    key: PKey<Private>,
    pub cert_pem: Vec<u8>,
}

impl SigningKey {
    pub fn generate() -> Self {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "sns.amazonaws.test").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        let cert_pem = builder.build().to_pem().unwrap();
        Self { key, cert_pem }
    }

    /// Fill in `signature` the way SNS does for the message's version.
    pub fn sign(&self, msg: &mut SnsMessage) {
        let digest = match msg.signature_version.as_deref() {
            Some("2") => MessageDigest::sha256(),
            _ => MessageDigest::sha1(),
        };
        let payload = string_to_sign(msg).unwrap();
        let mut signer = Signer::new(digest, &self.key).unwrap();
        signer.update(payload.as_bytes()).unwrap();
        msg.signature =
            base64::engine::general_purpose::STANDARD.encode(signer.sign_to_vec().unwrap());
    }
}

/// Serve the signing certificate; returns the server and the cert URL.
pub async fn cert_server(key: &SigningKey) -> (MockServer, String) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CERT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(key.cert_pem.clone()))
        .mount(&server)
        .await;
    let url = format!("{}{}", server.uri(), CERT_PATH);
    (server, url)
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

pub fn confirmation(cert_url: &str, topic_arn: &str, key: &SigningKey) -> SnsMessage {
    let mut msg = SnsMessage {
        message_type: TYPE_SUBSCRIPTION_CONFIRMATION.to_string(),
        message_id: "c0ffee00-0000-4000-8000-000000000001".to_string(),
        token: Some("2336412f37fb687f5d51e6e2425".to_string()),
        topic_arn: topic_arn.to_string(),
        message: format!("You have chosen to subscribe to the topic {topic_arn}."),
        timestamp: "2024-05-01T12:00:00.000Z".to_string(),
        signature_version: Some("1".to_string()),
        signing_cert_url: cert_url.to_string(),
        subscribe_url: Some("https://sns.us-east-1.amazonaws.com/?Action=ConfirmSubscription".to_string()),
        ..Default::default()
    };
    key.sign(&mut msg);
    msg
}

pub fn notification(
    cert_url: &str,
    topic_arn: &str,
    env: &str,
    payload: &str,
    key: &SigningKey,
) -> SnsMessage {
    let mut attributes = HashMap::new();
    attributes.insert(
        ENV_ATTRIBUTE.to_string(),
        MessageAttribute {
            data_type: "String".to_string(),
            value: env.to_string(),
        },
    );
    let mut msg = SnsMessage {
        message_type: TYPE_NOTIFICATION.to_string(),
        message_id: "da41e39f-ea4d-435a-b922-c6aae3915ebe".to_string(),
        topic_arn: topic_arn.to_string(),
        subject: Some("webhook".to_string()),
        message: payload.to_string(),
        timestamp: "2024-05-01T12:00:05.000Z".to_string(),
        signature_version: Some("1".to_string()),
        signing_cert_url: cert_url.to_string(),
        message_attributes: attributes,
        ..Default::default()
    };
    key.sign(&mut msg);
    msg
}

pub fn hook_json(url: &str) -> String {
    serde_json::json!({
        "config": { "url": url, "content_type": "json", "secret": "s3cr3t" },
        "events": ["device-status/.*"],
        "matcher": { "device_id": ["mac:112233445566"] },
        "duration": 120_000_000_000u64,
        "until": "2024-05-01T12:02:00Z"
    })
    .to_string()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
