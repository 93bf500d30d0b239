use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde_json::json;
use tracing::debug;

use graphflow_core::context::{ContextUpdate, ExecutionContext};
use graphflow_core::error::{FlowError, Result};
use graphflow_core::graph::{DelayMode, NodeConfig, NodeDef, NodeKind};
use graphflow_core::validation::ConfigError;

use crate::executor::{wrong_kind, NodeEnv, NodeExecutor};

/// Suspends the execution path. The wait is a timer, cancelled with the run.
pub struct DelayExecutor;

impl NodeExecutor for DelayExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Delay
    }

    fn execute<'a>(
        &'a self,
        node: &'a NodeDef,
        ctx: &'a ExecutionContext,
        env: &'a NodeEnv,
    ) -> BoxFuture<'a, Result<ContextUpdate>> {
        Box::pin(async move {
            let NodeConfig::Delay(cfg) = &node.config else {
                return Err(wrong_kind(node, NodeKind::Delay));
            };
            let wait = delay_for(&cfg.mode, ctx.visit_count(&node.id));
            debug!(node_id = %node.id, wait_ms = wait.as_millis() as u64, "Delaying");

            tokio::select! {
                _ = env.cancel.cancelled() => return Err(FlowError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            Ok(ContextUpdate::new().with_output(json!({"waited_ms": wait.as_millis() as u64})))
        })
    }

    fn validate_config(&self, node: &NodeDef) -> Vec<ConfigError> {
        let NodeConfig::Delay(cfg) = &node.config else {
            return vec![ConfigError::new("kind", "expected delay config")];
        };
        match cfg.mode {
            DelayMode::Fixed { .. } => Vec::new(),
            DelayMode::Random { min_ms, max_ms } if min_ms > max_ms => {
                vec![ConfigError::new("min_ms", "must not exceed max_ms")]
            }
            DelayMode::Random { .. } => Vec::new(),
            DelayMode::Exponential { base_ms, factor, max_ms } => {
                let mut errors = Vec::new();
                if !(factor >= 1.0 && factor.is_finite()) {
                    errors.push(ConfigError::new("factor", "must be a finite number >= 1"));
                }
                if base_ms > max_ms {
                    errors.push(ConfigError::new("base_ms", "must not exceed max_ms"));
                }
                errors
            }
            DelayMode::RateLimit { requests_per_second } => {
                if requests_per_second > 0.0 && requests_per_second.is_finite() {
                    Vec::new()
                } else {
                    vec![ConfigError::new("requests_per_second", "must be greater than 0")]
                }
            }
        }
    }
}

/// Wait for the `visits`-th visit of a delay node (1-based; 0 is treated as 1).
pub fn delay_for(mode: &DelayMode, visits: u32) -> Duration {
    let ms = match *mode {
        DelayMode::Fixed { ms } => ms,
        DelayMode::Random { min_ms, max_ms } => {
            if min_ms >= max_ms {
                min_ms
            } else {
                rand::thread_rng().gen_range(min_ms..=max_ms)
            }
        }
        DelayMode::Exponential { base_ms, factor, max_ms } => {
            let exponent = visits.saturating_sub(1).min(63) as i32;
            let scaled = base_ms as f64 * factor.powi(exponent);
            if scaled.is_finite() {
                (scaled as u64).min(max_ms)
            } else {
                max_ms
            }
        }
        DelayMode::RateLimit { requests_per_second } => {
            if requests_per_second > 0.0 {
                (1000.0 / requests_per_second).ceil() as u64
            } else {
                0
            }
        }
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::test_support::context;
    use graphflow_core::graph::DelayConfig;
    use tokio_util::sync::CancellationToken;

    fn node(mode: DelayMode) -> NodeDef {
        NodeDef::new("d", NodeConfig::Delay(DelayConfig { mode }))
    }

    #[test]
    fn test_delay_for_modes() {
        assert_eq!(delay_for(&DelayMode::Fixed { ms: 250 }, 1), Duration::from_millis(250));
        let exp = DelayMode::Exponential { base_ms: 100, factor: 2.0, max_ms: 500 };
        assert_eq!(delay_for(&exp, 1), Duration::from_millis(100));
        assert_eq!(delay_for(&exp, 3), Duration::from_millis(400));
        assert_eq!(delay_for(&exp, 10), Duration::from_millis(500));
        assert_eq!(
            delay_for(&DelayMode::RateLimit { requests_per_second: 4.0 }, 1),
            Duration::from_millis(250)
        );
        for _ in 0..20 {
            let d = delay_for(&DelayMode::Random { min_ms: 10, max_ms: 20 }, 1);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_without_blocking() {
        let started = tokio::time::Instant::now();
        DelayExecutor
            .execute(&node(DelayMode::Fixed { ms: 1_000 }), &context(json!({})), &NodeEnv::offline())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let env = NodeEnv::offline().with_cancel(cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = DelayExecutor
            .execute(&node(DelayMode::Fixed { ms: 60_000 }), &context(json!({})), &env)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
    }

    #[test]
    fn test_validate_config() {
        assert!(DelayExecutor.validate_config(&node(DelayMode::Fixed { ms: 0 })).is_empty());
        assert_eq!(
            DelayExecutor
                .validate_config(&node(DelayMode::RateLimit { requests_per_second: 0.0 }))
                .len(),
            1
        );
        assert_eq!(
            DelayExecutor
                .validate_config(&node(DelayMode::Random { min_ms: 5, max_ms: 1 }))
                .len(),
            1
        );
    }
}
