//! Fair-usage policy evaluation
//!
//! Usage is the sum of input and output octets over the subscriber's
//! session records, measured over two rolling windows ending now.

use crate::model::{PackageId, UserId};
use crate::store::{FupConfigStore, SessionStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FupError {
    #[error("No FUP policy for package {0}")]
    NoPolicy(PackageId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rate applied once a subscriber crosses a limit, in Kbps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottledSpeeds {
    pub down_kbps: u32,
    pub up_kbps: u32,
}

/// Consumption against the governing limit. A zero limit means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub usage: u64,
    pub limit: u64,
}

pub fn daily_window() -> Duration {
    Duration::hours(24)
}

pub fn monthly_window() -> Duration {
    Duration::days(30)
}

pub struct FupEvaluator {
    configs: Arc<dyn FupConfigStore>,
    sessions: Arc<dyn SessionStore>,
}

impl FupEvaluator {
    pub fn new(configs: Arc<dyn FupConfigStore>, sessions: Arc<dyn SessionStore>) -> Self {
        FupEvaluator { configs, sessions }
    }

    /// True when the user has reached the daily or monthly limit of the package policy
    pub async fn check_fup_status(
        &self,
        user_id: UserId,
        package_id: PackageId,
    ) -> Result<bool, FupError> {
        self.check_fup_status_at(user_id, package_id, Utc::now()).await
    }

    pub async fn check_fup_status_at(
        &self,
        user_id: UserId,
        package_id: PackageId,
        now: DateTime<Utc>,
    ) -> Result<bool, FupError> {
        let Some(config) = self.configs.find_fup_config(package_id).await? else {
            return Ok(false);
        };

        if config.daily_limit > 0 {
            let daily = self.sessions.usage_since(user_id, now - daily_window()).await?;
            if daily >= config.daily_limit {
                debug!(user_id, package_id, usage = daily, limit = config.daily_limit, "Daily FUP limit reached");
                return Ok(true);
            }
        }

        if config.monthly_limit > 0 {
            let monthly = self.sessions.usage_since(user_id, now - monthly_window()).await?;
            if monthly >= config.monthly_limit {
                debug!(user_id, package_id, usage = monthly, limit = config.monthly_limit, "Monthly FUP limit reached");
                return Ok(true);
            }
        }

        Ok(false)
    }

    pub async fn get_throttled_speeds(
        &self,
        package_id: PackageId,
    ) -> Result<ThrottledSpeeds, FupError> {
        let config = self
            .configs
            .find_fup_config(package_id)
            .await?
            .ok_or(FupError::NoPolicy(package_id))?;
        Ok(ThrottledSpeeds {
            down_kbps: config.throttled_down,
            up_kbps: config.throttled_up,
        })
    }

    /// Usage against the daily limit if one is set, else the monthly limit
    pub async fn get_usage_stats(
        &self,
        user_id: UserId,
        package_id: PackageId,
    ) -> Result<UsageStats, FupError> {
        let Some(config) = self.configs.find_fup_config(package_id).await? else {
            return Ok(UsageStats { usage: 0, limit: 0 });
        };

        let (window, limit) = if config.daily_limit > 0 {
            (daily_window(), config.daily_limit)
        } else if config.monthly_limit > 0 {
            (monthly_window(), config.monthly_limit)
        } else {
            return Ok(UsageStats { usage: 0, limit: 0 });
        };
        let now = Utc::now();
        let usage = self.sessions.usage_since(user_id, now - window).await?;
        Ok(UsageStats { usage, limit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FupConfig, NewSession};
    use crate::store::MemoryStore;

    async fn store_with_usage(user_id: UserId, octets: u64, age: Duration) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut session = store
            .create_session(NewSession {
                user_id: Some(user_id),
                username: "alice".to_string(),
                nas_ip: "10.0.0.1".to_string(),
                framed_ip: None,
                session_id: "S1".to_string(),
                start_time: Utc::now() - age,
            })
            .await
            .unwrap();
        session.input_octets = octets / 2;
        session.output_octets = octets - octets / 2;
        store.update_session(&session).await.unwrap();
        store
    }

    fn policy(daily: u64, monthly: u64) -> FupConfig {
        FupConfig {
            package_id: 3,
            daily_limit: daily,
            monthly_limit: monthly,
            throttled_down: 512,
            throttled_up: 256,
        }
    }

    fn evaluator(store: &Arc<MemoryStore>) -> FupEvaluator {
        FupEvaluator::new(store.clone(), store.clone())
    }

    #[tokio::test]
    async fn test_daily_threshold_is_inclusive() {
        let store = store_with_usage(1, 999_999, Duration::minutes(5)).await;
        store.upsert_fup_config(policy(1_000_000, 0)).await;
        let fup = evaluator(&store);
        assert!(!fup.check_fup_status(1, 3).await.unwrap());

        let store = store_with_usage(1, 1_000_000, Duration::minutes(5)).await;
        store.upsert_fup_config(policy(1_000_000, 0)).await;
        let fup = evaluator(&store);
        assert!(fup.check_fup_status(1, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_monthly_window_counts_older_sessions() {
        // Two days old: outside the daily window, inside the monthly one
        let store = store_with_usage(1, 5_000, Duration::days(2)).await;
        store.upsert_fup_config(policy(1_000, 4_000)).await;
        let fup = evaluator(&store);
        assert!(fup.check_fup_status(1, 3).await.unwrap());

        store.upsert_fup_config(policy(1_000, 0)).await;
        assert!(!fup.check_fup_status(1, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_sessions_outside_monthly_window_ignored() {
        let store = store_with_usage(1, 5_000, Duration::days(31)).await;
        store.upsert_fup_config(policy(0, 1_000)).await;
        assert!(!evaluator(&store).check_fup_status(1, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_policy_means_unthrottled() {
        let store = store_with_usage(1, u64::MAX / 2, Duration::minutes(1)).await;
        let fup = evaluator(&store);
        assert!(!fup.check_fup_status(1, 3).await.unwrap());
        assert_eq!(
            fup.get_usage_stats(1, 3).await.unwrap(),
            UsageStats { usage: 0, limit: 0 }
        );
        assert_eq!(fup.get_throttled_speeds(3).await, Err(FupError::NoPolicy(3)));
    }

    #[tokio::test]
    async fn test_usage_stats_prefers_daily_limit() {
        let store = store_with_usage(1, 700, Duration::minutes(1)).await;
        store.upsert_fup_config(policy(1_000, 50_000)).await;
        let fup = evaluator(&store);
        assert_eq!(
            fup.get_usage_stats(1, 3).await.unwrap(),
            UsageStats { usage: 700, limit: 1_000 }
        );

        store.upsert_fup_config(policy(0, 50_000)).await;
        assert_eq!(
            fup.get_usage_stats(1, 3).await.unwrap(),
            UsageStats { usage: 700, limit: 50_000 }
        );
    }

    #[tokio::test]
    async fn test_usage_stats_without_limits() {
        let store = store_with_usage(1, 700, Duration::minutes(1)).await;
        store.upsert_fup_config(policy(0, 0)).await;
        assert_eq!(
            evaluator(&store).get_usage_stats(1, 3).await.unwrap(),
            UsageStats { usage: 0, limit: 0 }
        );
    }

    #[tokio::test]
    async fn test_throttled_speeds() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_fup_config(policy(1, 0)).await;
        assert_eq!(
            evaluator(&store).get_throttled_speeds(3).await.unwrap(),
            ThrottledSpeeds { down_kbps: 512, up_kbps: 256 }
        );
    }
}
