use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header AWS uses to announce the message type of a callback.
pub const MESSAGE_TYPE_HEADER: &str = "x-amz-sns-message-type";
/// Header carrying the subscription a notification was delivered for.
pub const SUBSCRIPTION_ARN_HEADER: &str = "x-amz-sns-subscription-arn";

pub const TYPE_NOTIFICATION: &str = "Notification";
pub const TYPE_SUBSCRIPTION_CONFIRMATION: &str = "SubscriptionConfirmation";
pub const TYPE_UNSUBSCRIBE_CONFIRMATION: &str = "UnsubscribeConfirmation";

/// Message attribute tagging every publish with the sender's environment.
pub const ENV_ATTRIBUTE: &str = "scytale.env";

/// Subscription ARN AWS reports until the endpoint confirms.
pub const PENDING_CONFIRMATION: &str = "pending confirmation";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageAttribute {
    #[serde(rename = "Type", default)]
    pub data_type: String,
    #[serde(rename = "Value", default)]
    pub value: String,
}

/// JSON body of an SNS HTTP(S) callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnsMessage {
    #[serde(rename = "Type")]
    pub message_type: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub topic_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_version: Option<String>,
    pub signature: String,
    #[serde(rename = "SigningCertURL")]
    pub signing_cert_url: String,
    #[serde(rename = "SubscribeURL", default, skip_serializing_if = "Option::is_none")]
    pub subscribe_url: Option<String>,
    #[serde(rename = "UnsubscribeURL", default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub message_attributes: HashMap<String, MessageAttribute>,
}

impl SnsMessage {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.message_attributes.get(name).map(|a| a.value.as_str())
    }
}
