use crate::types::{clamp_duration, expiry_from, Webhook};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Default upper bound on a registration's lifetime.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(300);

/// Shared, copy-on-write list of registered webhooks.
///
/// Readers load an immutable snapshot and never block. Writers build a new
/// snapshot from the latest one and swap it in; a writer that lost a race
/// recomputes against the winner's snapshot, so concurrent upserts and
/// prunes never drop each other's changes.
#[derive(Clone)]
pub struct Registry {
    hooks: Arc<ArcSwap<Vec<Webhook>>>,
    max_duration: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DURATION)
    }
}

impl Registry {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            hooks: Arc::new(ArcSwap::from_pointee(Vec::new())),
            max_duration,
        }
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub fn len(&self) -> usize {
        self.hooks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.load().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Webhook> {
        self.hooks.load().get(index).cloned()
    }

    /// Current snapshot. Later writes do not affect it.
    pub fn get_all(&self) -> Arc<Vec<Webhook>> {
        self.hooks.load_full()
    }

    /// Upsert by `config.url`. Every touched entry gets a fresh `until`.
    pub fn update(&self, incoming: Vec<Webhook>) {
        if incoming.is_empty() {
            return;
        }
        let max = self.max_duration;
        self.hooks.rcu(|current| {
            let now = Utc::now();
            let mut next = Vec::clone(current);
            for hook in &incoming {
                upsert(&mut next, hook, now, max);
            }
            next
        });
    }

    /// Replace the list with `f` applied to a copy of the latest snapshot.
    ///
    /// `f` may run more than once if a concurrent writer wins the swap, so
    /// it must be a pure transform.
    pub fn filter<F>(&self, mut f: F)
    where
        F: FnMut(Vec<Webhook>) -> Vec<Webhook>,
    {
        self.hooks.rcu(|current| f(Vec::clone(current)));
    }
}

fn upsert(list: &mut Vec<Webhook>, hook: &Webhook, now: DateTime<Utc>, max: Duration) {
    let duration = clamp_duration(hook.duration, max);
    let until = expiry_from(now, duration);

    match list.iter_mut().find(|existing| existing.id() == hook.id()) {
        Some(existing) => {
            existing.matcher = hook.matcher.clone();
            existing.events = hook.events.clone();
            existing.config.content_type = hook.config.content_type.clone();
            existing.config.secret = hook.config.secret.clone();
            existing.config.alternative_urls = hook.config.alternative_urls.clone();
            existing.failure_url = hook.failure_url.clone();
            existing.duration = duration;
            existing.until = until;
        }
        None => {
            let mut fresh = hook.clone();
            fresh.duration = duration;
            fresh.until = until;
            list.push(fresh);
        }
    }
}

/// Undertaker transform: keep only hooks still live at `now`.
pub fn prune_expired(now: DateTime<Utc>) -> impl FnMut(Vec<Webhook>) -> Vec<Webhook> {
    move |hooks| hooks.into_iter().filter(|h| !h.is_expired(now)).collect()
}
