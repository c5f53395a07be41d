// Rate-limit cooldown manager (§4.2): detects repeated RATE_LIMITED
// agent failures and pauses scheduling until the cooldown expires,
// so the scheduler doesn't burn retries against an exhausted quota.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::logger::Logger;

const DEFAULT_COOLDOWN_MINUTES: u32 = 60;
const DEFAULT_CONSECUTIVE_THRESHOLD: usize = 3;
const DEFAULT_FAILURE_WINDOW_SECONDS: u64 = 300;

type AsyncCallback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct CooldownConfig {
    pub enabled: bool,
    pub cooldown_minutes: u32,
    pub consecutive_threshold: usize,
    pub failure_window_seconds: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
            consecutive_threshold: DEFAULT_CONSECUTIVE_THRESHOLD,
            failure_window_seconds: DEFAULT_FAILURE_WINDOW_SECONDS,
        }
    }
}

/// Snapshot of cooldown status, for the `autonomous status` surface.
#[derive(Debug, Clone)]
pub struct CooldownState {
    pub active: bool,
    pub remaining_minutes: i64,
    pub user_message: String,
}

struct Inner {
    config: CooldownConfig,
    active: bool,
    expires_at: Option<Instant>,
    failures: Vec<Instant>,
    resume_task: Option<JoinHandle<()>>,
    on_activate: Vec<AsyncCallback>,
    on_deactivate: Vec<AsyncCallback>,
}

/// Shared, clonable handle onto cooldown state. The scheduler checks
/// `is_active()` before pulling the next task off the queue.
#[derive(Clone)]
pub struct CooldownManager {
    inner: Arc<Mutex<Inner>>,
    logger: Arc<Logger>,
}

impl CooldownManager {
    pub fn new(config: CooldownConfig, logger: Arc<Logger>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                active: false,
                expires_at: None,
                failures: Vec::new(),
                resume_task: None,
                on_activate: Vec::new(),
                on_deactivate: Vec::new(),
            })),
            logger,
        }
    }

    pub async fn on_activate<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        inner.on_activate.push(Arc::new(move || Box::pin(callback())));
    }

    pub async fn on_deactivate<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        inner.on_deactivate.push(Arc::new(move || Box::pin(callback())));
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.active
    }

    pub async fn state(&self) -> CooldownState {
        let inner = self.inner.lock().await;
        if !inner.active {
            return CooldownState {
                active: false,
                remaining_minutes: 0,
                user_message: String::new(),
            };
        }

        let remaining = inner
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs() / 60)
            .unwrap_or(0) as i64;

        CooldownState {
            active: true,
            remaining_minutes: remaining,
            user_message: format!(
                "Claude is in cooldown mode (~{remaining} min remaining). \
                 The account has hit its rate limit. Tasks will auto-resume \
                 when the cooldown expires."
            ),
        }
    }

    /// Record a RATE_LIMITED failure; activates cooldown once
    /// `consecutive_threshold` failures land within `failure_window_seconds`.
    pub async fn record_rate_limit_failure(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.config.enabled {
            return;
        }

        let now = Instant::now();
        inner.failures.push(now);
        let window = Duration::from_secs(inner.config.failure_window_seconds);
        inner.failures.retain(|t| now.duration_since(*t) <= window);

        if inner.failures.len() >= inner.config.consecutive_threshold && !inner.active {
            let _ = self
                .logger
                .warning(
                    "cooldown",
                    &format!(
                        "rate-limit threshold reached ({} failures in {}s)",
                        inner.failures.len(),
                        inner.config.failure_window_seconds
                    ),
                    None,
                    None,
                )
                .await;
            let minutes = inner.config.cooldown_minutes;
            drop(inner);
            self.do_activate(minutes).await;
        }
    }

    /// Explicit activation (a single RATE_LIMITED classification, or
    /// a manual override), bypassing the consecutive-failure counter.
    pub async fn activate(&self, cooldown_minutes: Option<u32>) {
        let enabled = self.inner.lock().await.config.enabled;
        if !enabled {
            return;
        }
        let minutes = cooldown_minutes.unwrap_or(self.inner.lock().await.config.cooldown_minutes);
        self.do_activate(minutes).await;
    }

    async fn do_activate(&self, minutes: u32) {
        let mut inner = self.inner.lock().await;
        inner.active = true;
        inner.expires_at = Some(Instant::now() + Duration::from_secs(minutes as u64 * 60));
        inner.failures.clear();
        let callbacks = inner.on_activate.clone();

        if let Some(handle) = inner.resume_task.take() {
            handle.abort();
        }
        let this = self.clone();
        inner.resume_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(minutes as u64 * 60)).await;
            this.deactivate().await;
        }));
        drop(inner);

        let _ = self
            .logger
            .warning("cooldown", &format!("activated for {minutes} minutes"), None, None)
            .await;
        for cb in callbacks {
            let cb = cb.clone();
            let logger = self.logger.clone();
            tokio::spawn(async move {
                cb().await;
                let _ = &logger;
            });
        }
    }

    /// Deactivate and resume scheduling; idempotent.
    pub async fn deactivate(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.active {
            return;
        }
        inner.active = false;
        inner.expires_at = None;
        inner.failures.clear();
        if let Some(handle) = inner.resume_task.take() {
            handle.abort();
        }
        let callbacks = inner.on_deactivate.clone();
        drop(inner);

        let _ = self.logger.info("cooldown", "deactivated", None, None).await;
        for cb in callbacks {
            tokio::spawn(async move { cb().await });
        }
    }

    /// Cancel the pending auto-resume timer, for orderly shutdown.
    pub async fn cancel_timer(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.resume_task.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Arc<Logger> {
        Arc::new(Logger::new(std::path::PathBuf::from(":memory:")).expect("in-memory logger"))
    }

    #[tokio::test]
    async fn inactive_by_default() {
        let manager = CooldownManager::new(CooldownConfig::default(), test_logger());
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn threshold_activates_cooldown() {
        let config = CooldownConfig {
            consecutive_threshold: 2,
            cooldown_minutes: 1,
            ..Default::default()
        };
        let manager = CooldownManager::new(config, test_logger());

        manager.record_rate_limit_failure().await;
        assert!(!manager.is_active().await);
        manager.record_rate_limit_failure().await;
        assert!(manager.is_active().await);
    }

    #[tokio::test]
    async fn explicit_activate_and_deactivate() {
        let manager = CooldownManager::new(CooldownConfig::default(), test_logger());
        manager.activate(Some(30)).await;
        assert!(manager.is_active().await);

        let state = manager.state().await;
        assert!(state.remaining_minutes <= 30);

        manager.deactivate().await;
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn disabled_manager_never_activates() {
        let config = CooldownConfig {
            enabled: false,
            consecutive_threshold: 1,
            ..Default::default()
        };
        let manager = CooldownManager::new(config, test_logger());
        manager.record_rate_limit_failure().await;
        assert!(!manager.is_active().await);
    }
}
