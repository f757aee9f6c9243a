//! Shared, explicitly constructed engine context.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::notification::NotificationSink;
use crate::pending::Resolver;
use crate::protocol::{DocumentCodec, WirePolicy};
use crate::retry::RetryConfig;
use crate::store::Store;

/// Retry, timeout and batching policy applied to every account.
#[derive(Debug, Clone, PartialEq)]
pub struct EnginePolicy {
    pub wire: WirePolicy,
    pub default_defers: u32,
    pub move_batch: usize,
    pub ping_slack: Duration,
    pub heartbeat_min_secs: u32,
    pub heartbeat_max_secs: u32,
    pub wait_interval: Duration,
    pub protocol_version: String,
}

impl EnginePolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            wire: WirePolicy {
                retry: RetryConfig::new(
                    config.max_tries,
                    Duration::from_millis(config.retry_initial_delay_ms),
                    Duration::from_secs(config.retry_max_delay_secs),
                ),
                timeout: Duration::from_secs(config.command_timeout_secs),
                timeout_expander: config.timeout_expander,
                max_retry_after: Duration::from_secs(config.max_retry_after_secs),
            },
            default_defers: config.default_defers,
            move_batch: config.move_batch.max(1),
            ping_slack: Duration::from_secs(config.ping_slack_secs),
            heartbeat_min_secs: config.heartbeat_min_secs,
            heartbeat_max_secs: config.heartbeat_max_secs.max(config.heartbeat_min_secs),
            wait_interval: Duration::from_secs(config.wait_interval_secs.max(1)),
            protocol_version: config.protocol_version.clone(),
        }
    }

    pub fn clamp_heartbeat(&self, secs: u32) -> u32 {
        secs.clamp(self.heartbeat_min_secs, self.heartbeat_max_secs)
    }
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Everything a controller and its commands need, passed explicitly.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<Store>,
    pub codec: Arc<dyn DocumentCodec>,
    pub sink: Arc<dyn NotificationSink>,
    pub policy: Arc<EnginePolicy>,
}

impl EngineContext {
    pub fn new(
        store: Arc<Store>,
        codec: Arc<dyn DocumentCodec>,
        sink: Arc<dyn NotificationSink>,
        policy: EnginePolicy,
    ) -> Self {
        Self {
            store,
            codec,
            sink,
            policy: Arc::new(policy),
        }
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(Arc::clone(&self.store), Arc::clone(&self.sink))
    }
}
