//! Configuration Module
//!
//! Configuration loading for the stream consumer.

mod settings;

pub use settings::{
    ConfigError, ConsumerConfig, DEFAULT_STREAM_URL, DEFAULT_TOKEN_URL, LoginSettings,
    RenewalSettings, RetrySettings, SubscriptionSettings,
};
