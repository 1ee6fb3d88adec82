#![allow(dead_code)]

pub mod plugin;

use kms_core::{EncryptionConfig, HealthConfig, ProviderConfig, ResourceBinding, RetryPolicy};
use std::time::Duration;

/// Config with quick retries and health probes so failures surface fast.
pub fn config(providers: Vec<ProviderConfig>, resources: &[&str]) -> EncryptionConfig {
    let resources = match providers.first() {
        Some(first) if !resources.is_empty() => vec![ResourceBinding {
            resources: resources.iter().map(|r| r.to_string()).collect(),
            provider: first.name.clone(),
        }],
        _ => Vec::new(),
    };
    EncryptionConfig {
        providers,
        resources,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        health: HealthConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(500),
        },
    }
}
