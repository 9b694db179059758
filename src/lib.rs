//! Webhook registry for the XMiDT fleet, kept consistent across instances
//! through a shared AWS SNS topic.
//!
//! Registrations are never applied locally on receipt. They are published to
//! the topic, and every subscribed instance (this one included) upserts them
//! when the signed notification comes back.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod http_server;
pub mod monitor;
pub mod sns;
pub mod store;
pub mod types;
pub mod verification;

pub use error::{BootstrapError, HandlerError, NotifierError, RegistrationError, SignatureError};
pub use monitor::Monitor;
pub use sns::{Notifier, SnsServer, SubscriptionState};
pub use store::Registry;
pub use types::Webhook;
