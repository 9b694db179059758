use crate::error::SignatureError;
use crate::sns::message::{
    SnsMessage, TYPE_NOTIFICATION, TYPE_SUBSCRIPTION_CONFIRMATION, TYPE_UNSUBSCRIBE_CONFIRMATION,
};
use base64::Engine as _;
use openssl::hash::MessageDigest;
use openssl::sign::Verifier;
use openssl::x509::X509;
use std::collections::HashMap;
use std::sync::Mutex;

/// Default bound on cached signing certificates.
pub const DEFAULT_MAX_CACHED_CERTS: usize = 16;

/// Checks SNS messages against the certificate named in `SigningCertURL`.
///
/// Certificates are fetched on first use and cached by URL, at most
/// `max_certs` at a time. There is no pinning of the certificate host.
pub struct SignatureValidator {
    client: reqwest::Client,
    certs: Mutex<HashMap<String, X509>>,
    max_certs: usize,
}

impl SignatureValidator {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_cache_limit(client, DEFAULT_MAX_CACHED_CERTS)
    }

    pub fn with_cache_limit(client: reqwest::Client, max_certs: usize) -> Self {
        Self {
            client,
            certs: Mutex::new(HashMap::new()),
            max_certs: max_certs.max(1),
        }
    }

    /// Number of certificates currently cached.
    pub fn cached_certificates(&self) -> usize {
        self.certs.lock().map(|certs| certs.len()).unwrap_or_default()
    }

    /// `Ok(false)` means the signature did not verify; `Err` means the check
    /// could not be carried out.
    pub async fn validate(&self, msg: &SnsMessage) -> Result<bool, SignatureError> {
        let signature = base64::engine::general_purpose::STANDARD.decode(msg.signature.trim())?;
        let digest = digest_for(msg.signature_version.as_deref())?;
        let payload = string_to_sign(msg)?;
        let cert = self.certificate(&msg.signing_cert_url).await?;

        let public_key = cert.public_key().map_err(SignatureError::Certificate)?;
        let mut verifier =
            Verifier::new(digest, &public_key).map_err(SignatureError::Verification)?;
        verifier
            .update(payload.as_bytes())
            .map_err(SignatureError::Verification)?;

        verifier
            .verify(&signature)
            .map_err(SignatureError::Verification)
    }

    async fn certificate(&self, url: &str) -> Result<X509, SignatureError> {
        if let Some(cert) = self.cached(url) {
            return Ok(cert);
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| SignatureError::CertificateFetch {
                url: url.to_string(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(SignatureError::CertificateStatus {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        let pem = resp
            .bytes()
            .await
            .map_err(|source| SignatureError::CertificateFetch {
                url: url.to_string(),
                source,
            })?;

        let cert = X509::from_pem(&pem).map_err(SignatureError::Certificate)?;
        if let Ok(mut certs) = self.certs.lock() {
            if certs.len() >= self.max_certs && !certs.contains_key(url) {
                // Full: evict an arbitrary entry.
                if let Some(evicted) = certs.keys().next().cloned() {
                    certs.remove(&evicted);
                }
            }
            certs.insert(url.to_string(), cert.clone());
        }
        Ok(cert)
    }

    fn cached(&self, url: &str) -> Option<X509> {
        self.certs.lock().ok()?.get(url).cloned()
    }
}

fn digest_for(version: Option<&str>) -> Result<MessageDigest, SignatureError> {
    match version.unwrap_or("1") {
        "1" => Ok(MessageDigest::sha1()),
        "2" => Ok(MessageDigest::sha256()),
        other => Err(SignatureError::UnsupportedVersion(other.to_string())),
    }
}

/// Rebuild the exact byte string AWS signed for `msg`.
pub fn string_to_sign(msg: &SnsMessage) -> Result<String, SignatureError> {
    let mut fields: Vec<(&str, &str)> = Vec::with_capacity(7);

    match msg.message_type.as_str() {
        TYPE_NOTIFICATION => {
            fields.push(("Message", msg.message.as_str()));
            fields.push(("MessageId", msg.message_id.as_str()));
            if let Some(subject) = msg.subject.as_deref().filter(|s| !s.is_empty()) {
                fields.push(("Subject", subject));
            }
            fields.push(("Timestamp", msg.timestamp.as_str()));
            fields.push(("TopicArn", msg.topic_arn.as_str()));
            fields.push(("Type", msg.message_type.as_str()));
        }
        TYPE_SUBSCRIPTION_CONFIRMATION | TYPE_UNSUBSCRIBE_CONFIRMATION => {
            fields.push(("Message", msg.message.as_str()));
            fields.push(("MessageId", msg.message_id.as_str()));
            fields.push(("SubscribeURL", msg.subscribe_url.as_deref().unwrap_or("")));
            fields.push(("Timestamp", msg.timestamp.as_str()));
            fields.push(("Token", msg.token.as_deref().unwrap_or("")));
            fields.push(("TopicArn", msg.topic_arn.as_str()));
            fields.push(("Type", msg.message_type.as_str()));
        }
        other => return Err(SignatureError::UnknownMessageType(other.to_string())),
    }

    let mut out = String::new();
    for (name, value) in fields {
        out.push_str(name);
        out.push('\n');
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> SnsMessage {
        SnsMessage {
            message_type: TYPE_NOTIFICATION.to_string(),
            message_id: "id-1".to_string(),
            topic_arn: "arn:aws:sns:us-east-1:1:hooks".to_string(),
            subject: Some("hello".to_string()),
            message: "{}".to_string(),
            timestamp: "2024-01-01T00:00:00.000Z".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn notification_with_subject() {
        assert_eq!(
            string_to_sign(&notification()).unwrap(),
            "Message\n{}\nMessageId\nid-1\nSubject\nhello\nTimestamp\n2024-01-01T00:00:00.000Z\n\
             TopicArn\narn:aws:sns:us-east-1:1:hooks\nType\nNotification\n"
        );
    }

    #[test]
    fn notification_without_subject_omits_it() {
        let mut msg = notification();
        msg.subject = None;
        let s = string_to_sign(&msg).unwrap();
        assert!(!s.contains("Subject"));
        assert!(s.starts_with("Message\n{}\nMessageId\nid-1\nTimestamp\n"));
    }

    #[test]
    fn confirmation_includes_token_and_subscribe_url() {
        let mut msg = notification();
        msg.message_type = TYPE_SUBSCRIPTION_CONFIRMATION.to_string();
        msg.subject = None;
        msg.token = Some("tok".to_string());
        msg.subscribe_url = Some("https://sns.example.com/confirm".to_string());
        assert_eq!(
            string_to_sign(&msg).unwrap(),
            "Message\n{}\nMessageId\nid-1\nSubscribeURL\nhttps://sns.example.com/confirm\n\
             Timestamp\n2024-01-01T00:00:00.000Z\nToken\ntok\nTopicArn\narn:aws:sns:us-east-1:1:hooks\n\
             Type\nSubscriptionConfirmation\n"
        );
    }

    #[test]
    fn unknown_type_is_an_error() {
        let mut msg = notification();
        msg.message_type = "Bogus".to_string();
        assert!(matches!(
            string_to_sign(&msg),
            Err(SignatureError::UnknownMessageType(t)) if t == "Bogus"
        ));
    }

    #[test]
    fn signature_version_selects_digest() {
        assert!(digest_for(None).is_ok());
        assert!(digest_for(Some("2")).is_ok());
        assert!(matches!(
            digest_for(Some("3")),
            Err(SignatureError::UnsupportedVersion(_))
        ));
    }
}
