use crate::config::AwsConfig;
use crate::error::NotifierError;
use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::types::MessageAttributeValue;

/// One entry of a `ListSubscriptionsByTopic` page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub subscription_arn: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionPage {
    pub subscriptions: Vec<TopicSubscription>,
    pub next_token: Option<String>,
}

/// The subset of the SNS API the notifier drives.
#[async_trait]
pub trait SnsApi: Send + Sync {
    /// Returns the subscription ARN, normally `"pending confirmation"`.
    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, NotifierError>;

    /// Returns the confirmed subscription ARN.
    async fn confirm_subscription(
        &self,
        topic_arn: &str,
        token: &str,
    ) -> Result<String, NotifierError>;

    /// Returns the published message id.
    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &[(&str, &str)],
    ) -> Result<String, NotifierError>;

    async fn list_subscriptions_by_topic(
        &self,
        topic_arn: &str,
        next_token: Option<String>,
    ) -> Result<SubscriptionPage, NotifierError>;

    async fn unsubscribe(&self, subscription_arn: &str) -> Result<(), NotifierError>;
}

/// [`SnsApi`] backed by the AWS SDK.
pub struct AwsSns {
    client: aws_sdk_sns::Client,
}

impl AwsSns {
    pub fn new(client: aws_sdk_sns::Client) -> Self {
        Self { client }
    }

    /// Build a client for the configured region. Static keys are used when
    /// present; otherwise the default credential chain applies.
    pub async fn from_config(config: &AwsConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.sns.region.clone()));
        if !config.access_key.is_empty() {
            let credentials = aws_sdk_sns::config::Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "xmidt-webhook-config",
            );
            loader = loader.credentials_provider(credentials);
        }
        let sdk_config = loader.load().await;
        tracing::info!(region = %config.sns.region, "SNS client initialised");
        Self::new(aws_sdk_sns::Client::new(&sdk_config))
    }
}

#[async_trait]
impl SnsApi for AwsSns {
    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, NotifierError> {
        let resp = self
            .client
            .subscribe()
            .topic_arn(topic_arn)
            .protocol(protocol)
            .endpoint(endpoint)
            .send()
            .await
            .map_err(|e| NotifierError::aws("Subscribe", DisplayErrorContext(&e)))?;
        Ok(resp.subscription_arn().unwrap_or_default().to_string())
    }

    async fn confirm_subscription(
        &self,
        topic_arn: &str,
        token: &str,
    ) -> Result<String, NotifierError> {
        let resp = self
            .client
            .confirm_subscription()
            .topic_arn(topic_arn)
            .token(token)
            .send()
            .await
            .map_err(|e| NotifierError::aws("ConfirmSubscription", DisplayErrorContext(&e)))?;
        Ok(resp.subscription_arn().unwrap_or_default().to_string())
    }

    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &[(&str, &str)],
    ) -> Result<String, NotifierError> {
        let mut req = self.client.publish().topic_arn(topic_arn).message(message);
        for (name, value) in attributes {
            let attr = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(*value)
                .build()
                .map_err(|e| NotifierError::aws("Publish", e))?;
            req = req.message_attributes(*name, attr);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| NotifierError::aws("Publish", DisplayErrorContext(&e)))?;
        Ok(resp.message_id().unwrap_or_default().to_string())
    }

    async fn list_subscriptions_by_topic(
        &self,
        topic_arn: &str,
        next_token: Option<String>,
    ) -> Result<SubscriptionPage, NotifierError> {
        let resp = self
            .client
            .list_subscriptions_by_topic()
            .topic_arn(topic_arn)
            .set_next_token(next_token)
            .send()
            .await
            .map_err(|e| NotifierError::aws("ListSubscriptionsByTopic", DisplayErrorContext(&e)))?;

        let subscriptions = resp
            .subscriptions()
            .iter()
            .map(|s| TopicSubscription {
                subscription_arn: s.subscription_arn().unwrap_or_default().to_string(),
                endpoint: s.endpoint().unwrap_or_default().to_string(),
            })
            .collect();

        Ok(SubscriptionPage {
            subscriptions,
            next_token: resp.next_token().map(str::to_string),
        })
    }

    async fn unsubscribe(&self, subscription_arn: &str) -> Result<(), NotifierError> {
        self.client
            .unsubscribe()
            .subscription_arn(subscription_arn)
            .send()
            .await
            .map_err(|e| NotifierError::aws("Unsubscribe", DisplayErrorContext(&e)))?;
        Ok(())
    }
}
