//! Permission reload coordination.
//!
//! Every gateway instance subscribes to the sync channel; the authorization owner publishes
//! `REFRESH` after it rewrites `perm:api:roles`. Signals are coalesced:
//!
//! - a compare-and-set `reloading` flag admits one reload task at a time
//! - the task waits one debounce window before fetching, absorbing further signals
//! - a signal that lands while a fetch is in flight sets `dirty`, which buys exactly one
//!   more debounced fetch once the current one finishes
//!
//! Requests keep reading the installed snapshot throughout; a failed or timed-out fetch
//! leaves it in place.
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::repos::api_rule_repo::RuleSource;
use crate::repos::error::RepoError;
use crate::services::cache::ValkeyClient;
use crate::services::permission::table::PermissionTable;

pub const REFRESH_SIGNAL: &str = "REFRESH";

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("rule fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("rule source error: {0}")]
    Source(#[from] RepoError),
}

pub struct PermissionReloader {
    table: Arc<PermissionTable>,
    source: Arc<dyn RuleSource>,
    reloading: AtomicBool,
    dirty: AtomicBool,
    debounce: Duration,
    fetch_timeout: Duration,
    fetches: AtomicU64,
}

impl std::fmt::Debug for PermissionReloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionReloader")
            .field("reloading", &self.reloading.load(Ordering::Relaxed))
            .field("debounce", &self.debounce)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl PermissionReloader {
    pub fn new(
        table: Arc<PermissionTable>,
        source: Arc<dyn RuleSource>,
        debounce: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            table,
            source,
            reloading: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            debounce,
            fetch_timeout,
            fetches: AtomicU64::new(0),
        }
    }

    pub fn table(&self) -> &Arc<PermissionTable> {
        &self.table
    }

    /// Number of fetch attempts made so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Acquire)
    }

    /// Request a reload. Never blocks; the fetch runs on a background task.
    pub fn signal(self: &Arc<Self>) {
        self.dirty.store(true, Ordering::Release);
        if !self.try_acquire() {
            debug!("permission reload already pending, signal coalesced");
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_pending().await });
    }

    /// Fetch and install the current rules right now, bypassing the debounce.
    pub async fn load_now(&self) -> Result<usize, ReloadError> {
        self.fetches.fetch_add(1, Ordering::AcqRel);

        let rules = tokio::time::timeout(self.fetch_timeout, self.source.load_rules())
            .await
            .map_err(|_| ReloadError::Timeout(self.fetch_timeout))??;

        Ok(self.table.reload(rules))
    }

    fn try_acquire(&self) -> bool {
        self.reloading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn run_pending(&self) {
        loop {
            tokio::time::sleep(self.debounce).await;
            self.dirty.store(false, Ordering::Release);

            match self.load_now().await {
                Ok(count) => debug!(rules = count, "debounced permission reload finished"),
                Err(e) => error!(error = %e, "permission reload failed, keeping previous rules"),
            }

            if self.dirty.load(Ordering::Acquire) {
                continue;
            }

            self.reloading.store(false, Ordering::Release);
            // A signal that arrived between the check above and the release saw the flag
            // still held and returned; pick it up here.
            if self.dirty.load(Ordering::Acquire) && self.try_acquire() {
                continue;
            }
            break;
        }
    }
}

pub fn is_refresh_payload(payload: &str) -> bool {
    let payload = payload.trim();
    let payload = payload
        .strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(payload);
    payload == REFRESH_SIGNAL
}

/// Subscribe to the sync channel and forward refresh signals to the reloader.
///
/// Reconnects with exponential backoff and signals once after every (re)subscription,
/// since messages published while disconnected are lost.
pub fn spawn_sync_listener(
    client: ValkeyClient,
    channel: String,
    reloader: Arc<PermissionReloader>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        loop {
            match client.subscribe(&channel).await {
                Ok(mut pubsub) => {
                    info!(channel = %channel, "subscribed to permission sync channel");
                    backoff = RECONNECT_BACKOFF_INITIAL;
                    reloader.signal();

                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, "unreadable permission sync message");
                                continue;
                            }
                        };
                        if is_refresh_payload(&payload) {
                            reloader.signal();
                        } else {
                            debug!(payload = %payload, "ignoring permission sync message");
                        }
                    }
                    warn!(channel = %channel, "permission sync subscription closed");
                }
                Err(e) => {
                    warn!(
                        channel = %channel,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "permission sync subscribe failed"
                    );
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
    })
}

/// Signal a reload every `interval` as a safety net for missed messages.
pub fn spawn_periodic_resync(
    reloader: Arc<PermissionReloader>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial load already happened.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("periodic permission resync");
            reloader.signal();
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::api_rule_repo::ApiRule;
    use crate::repos::error::RepoResult;
    use crate::services::cache::CacheError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    /// Rule source that counts fetches and can be told to stall or fail.
    struct ScriptedSource {
        fetches: AtomicU64,
        fetch_delay: Duration,
        rules: Mutex<Result<Vec<ApiRule>, String>>,
        stall: AtomicBool,
    }

    impl ScriptedSource {
        fn new(fetch_delay: Duration, rules: Vec<ApiRule>) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicU64::new(0),
                fetch_delay,
                rules: Mutex::new(Ok(rules)),
                stall: AtomicBool::new(false),
            })
        }

        fn fetches(&self) -> u64 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RuleSource for ScriptedSource {
        async fn load_rules(&self) -> RepoResult<Vec<ApiRule>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.fetch_delay).await;
            self.rules
                .lock()
                .clone()
                .map_err(|e| RepoError::Store(CacheError::BackendCommand(e)))
        }
    }

    fn rule(field: &str, roles: &str) -> ApiRule {
        ApiRule::parse(field, roles).unwrap()
    }

    fn reloader(source: Arc<ScriptedSource>) -> Arc<PermissionReloader> {
        let table = Arc::new(PermissionTable::new("ADMIN", 100, Duration::from_secs(60)));
        Arc::new(PermissionReloader::new(
            table,
            source,
            Duration::from_millis(500),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_signals_triggers_one_fetch() {
        let source = ScriptedSource::new(Duration::ZERO, vec![rule("GET:/a", "USER")]);
        let reloader = reloader(source.clone());

        for _ in 0..10 {
            reloader.signal();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(source.fetches(), 1);
        assert_eq!(reloader.table().rule_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_during_fetch_buys_exactly_one_more() {
        let source = ScriptedSource::new(Duration::from_secs(1), vec![]);
        let reloader = reloader(source.clone());

        reloader.signal();
        // Debounce elapses at 500ms; the fetch runs until 1500ms.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(source.fetches(), 1);
        for _ in 0..5 {
            reloader.signal();
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_signal_after_quiet_period_reloads_again() {
        let source = ScriptedSource::new(Duration::ZERO, vec![]);
        let reloader = reloader(source.clone());

        reloader.signal();
        tokio::time::sleep(Duration::from_secs(2)).await;
        reloader.signal();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reload_keeps_previous_rules() {
        let source = ScriptedSource::new(Duration::ZERO, vec![rule("GET:/a", "USER")]);
        let reloader = reloader(source.clone());
        assert_eq!(reloader.load_now().await.unwrap(), 1);

        *source.rules.lock() = Err("connection reset".to_string());
        assert!(matches!(
            reloader.load_now().await,
            Err(ReloadError::Source(_))
        ));

        let user: BTreeSet<String> = ["USER".to_string()].into();
        assert!(reloader.table().is_allowed(&user, "GET", "/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_fetch_times_out_and_next_signal_retries() {
        let source = ScriptedSource::new(Duration::ZERO, vec![rule("GET:/a", "USER")]);
        source.stall.store(true, Ordering::SeqCst);
        let reloader = reloader(source.clone());

        assert!(matches!(
            reloader.load_now().await,
            Err(ReloadError::Timeout(_))
        ));

        source.stall.store(false, Ordering::SeqCst);
        reloader.signal();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reloader.table().rule_count(), 1);
        assert_eq!(reloader.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_resync_signals_the_reloader() {
        let source = ScriptedSource::new(Duration::ZERO, vec![]);
        let reloader = reloader(source.clone());

        assert!(spawn_periodic_resync(reloader.clone(), Duration::ZERO).is_none());
        let handle = spawn_periodic_resync(reloader.clone(), Duration::from_secs(60)).unwrap();

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(source.fetches(), 2);
        handle.abort();
    }

    #[test]
    fn test_refresh_payload_forms() {
        assert!(is_refresh_payload("REFRESH"));
        assert!(is_refresh_payload("\"REFRESH\""));
        assert!(is_refresh_payload(" REFRESH\n"));
        assert!(!is_refresh_payload("refresh-later"));
        assert!(!is_refresh_payload("\"NOOP\""));
    }
}
