//! Call pacing and abuse-window limits.
//!
//! [`RateGovernor`] spaces remote calls per [`Channel`] and applies
//! provider throttle directives. [`GuardedActions`] keeps a rolling count
//! of account additions and removals per operator.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use grouplog_store::Store;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::{GuardedActionSettings, Settings};

/// Logical remote-call category with its own spacing budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// History pages, counts and resolution.
    Primary,
    Reactions,
    /// Attachment and thumbnail downloads.
    Media,
}

#[derive(Debug, Default)]
struct ChannelState {
    last_call: Option<Instant>,
    /// Set after a provider throttle wait; the next call goes out immediately.
    skip_delay: bool,
}

/// Per-run call spacing. One governor per (conversation, account) run.
#[derive(Debug)]
pub struct RateGovernor {
    delays: HashMap<Channel, Duration>,
    state: Mutex<HashMap<Channel, ChannelState>>,
}

impl RateGovernor {
    pub fn new(settings: &Settings) -> Self {
        Self::with_delays([
            (Channel::Primary, settings.delay(Channel::Primary)),
            (Channel::Reactions, settings.delay(Channel::Reactions)),
            (Channel::Media, settings.delay(Channel::Media)),
        ])
    }

    pub fn with_delays<I>(delays: I) -> Self
    where
        I: IntoIterator<Item = (Channel, Duration)>,
    {
        Self {
            delays: delays.into_iter().collect(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn delay(&self, channel: Channel) -> Duration {
        self.delays.get(&channel).copied().unwrap_or(Duration::ZERO)
    }

    /// Wait until `channel`'s minimum spacing since its previous call has
    /// elapsed. Returns the time actually waited.
    pub async fn before_call(&self, channel: Channel) -> Duration {
        let wait = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let entry = state.entry(channel).or_default();
            let now = Instant::now();
            let wait = if std::mem::take(&mut entry.skip_delay) {
                Duration::ZERO
            } else {
                entry
                    .last_call
                    .map(|last| (last + self.delay(channel)).saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO)
            };
            entry.last_call = Some(now + wait);
            wait
        };
        if !wait.is_zero() {
            debug!(?channel, ?wait, "pacing remote call");
            sleep(wait).await;
        }
        wait
    }

    /// Block for exactly the provider-signalled duration. The next
    /// `before_call` on the channel does not add the configured delay.
    pub async fn on_provider_throttle(&self, channel: Channel, seconds: u64) {
        info!(?channel, seconds, "provider throttle, waiting");
        sleep(Duration::from_secs(seconds)).await;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(channel).or_default();
        entry.last_call = Some(Instant::now());
        entry.skip_delay = true;
    }
}

/// Outcome of a guarded-action check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// Rolling-window limit for abuse-sensitive actions, backed by the store so
/// the window survives restarts.
#[derive(Clone)]
pub struct GuardedActions {
    store: Store,
    window: chrono::Duration,
    max_actions: u32,
}

impl GuardedActions {
    pub fn new(store: Store, settings: &GuardedActionSettings) -> Self {
        Self {
            store,
            window: chrono::Duration::hours(settings.window_hours),
            max_actions: settings.max_actions,
        }
    }

    pub async fn can_perform_guarded_action(&self, actor: &str) -> Result<GuardDecision> {
        let now = Utc::now();
        let recent = self.store.guarded_actions_since(actor, now - self.window).await?;
        if (recent.len() as u64) < u64::from(self.max_actions) {
            return Ok(GuardDecision {
                allowed: true,
                reason: None,
            });
        }

        let reason = match recent.first() {
            Some(oldest) => {
                let free_at = *oldest + self.window;
                let hours = (free_at - now).num_minutes().max(0) as f64 / 60.0;
                format!(
                    "limit of {} account changes per {} hours reached; next slot in {:.1}h",
                    self.max_actions,
                    self.window.num_hours(),
                    hours
                )
            }
            None => format!("account changes are disabled (limit {})", self.max_actions),
        };
        Ok(GuardDecision {
            allowed: false,
            reason: Some(reason),
        })
    }

    /// Record a guarded action that has just succeeded.
    pub async fn record(&self, actor: &str, action: &str, target: Option<&str>) -> Result<()> {
        self.store
            .record_guarded_action(actor, action, target, Utc::now())
            .await
    }
}
