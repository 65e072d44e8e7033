use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::backend::{AppEvent, WatchToken, WindowRegistry};
use crate::capture::error::Result;
use crate::capture::types::{CaptureFilter, DisplayHandle, WindowHandle, WindowInfo};

/// Logical description of what to keep off the capture surface.
///
/// Immutable once built; callers construct a new value when any input
/// changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionConfig {
    /// The application's own windows (preview, PiP, HUD).
    pub own_window_handles: BTreeSet<WindowHandle>,
    /// Matched case-insensitively as substrings of the owning app's name.
    pub excluded_app_name_patterns: Vec<String>,
    pub self_hiding_enabled: bool,
}

/// Resolve `config` against a window list into a concrete filter.
///
/// Own windows are excluded whenever self-hiding is on, even if the registry
/// has not reported them yet. A third-party window is excluded on the first
/// pattern its owner's name contains; blank patterns match nothing.
pub fn resolve(display: DisplayHandle, config: &ExclusionConfig, windows: &[WindowInfo]) -> CaptureFilter {
    let mut excluded = BTreeSet::new();

    if config.self_hiding_enabled {
        excluded.extend(config.own_window_handles.iter().copied());
    }

    let patterns: Vec<String> = config
        .excluded_app_name_patterns
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();

    if !patterns.is_empty() {
        for window in windows {
            let owner = window.owner_app_name.to_lowercase();
            if patterns.iter().any(|p| owner.contains(p.as_str())) {
                excluded.insert(window.handle);
            }
        }
    }

    CaptureFilter { display, excluded }
}

/// What the resolver builds against until torn down.
#[derive(Clone)]
struct Target {
    display: DisplayHandle,
    config: Arc<ExclusionConfig>,
    generation: u64,
}

/// A filter together with the target generation it was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub generation: u64,
    pub filter: CaptureFilter,
}

/// Live-refresh subscription state.
struct LiveRefresh {
    token: WatchToken,
    cancel: CancellationToken,
}

/// Turns an [`ExclusionConfig`] into a [`CaptureFilter`] against the live
/// window list, and keeps it fresh as applications launch or come forward.
///
/// Every retarget and teardown starts a new generation. A [`Resolved`]
/// filter is only worth applying while [`ExclusionResolver::is_current`]
/// holds for its generation.
pub struct ExclusionResolver {
    registry: Arc<dyn WindowRegistry>,
    debounce: Duration,
    target: Mutex<Option<Target>>,
    generation: AtomicU64,
    live: Mutex<Option<LiveRefresh>>,
}

impl ExclusionResolver {
    pub fn new(registry: Arc<dyn WindowRegistry>, debounce: Duration) -> Self {
        Self {
            registry,
            debounce,
            target: Mutex::new(None),
            generation: AtomicU64::new(0),
            live: Mutex::new(None),
        }
    }

    /// Make `display` and `config` the target of later rebuilds and return
    /// the new generation. Results of older generations become stale.
    pub fn retarget(&self, display: DisplayHandle, config: Arc<ExclusionConfig>) -> u64 {
        let mut target = self.target.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *target = Some(Target {
            display,
            config,
            generation,
        });
        generation
    }

    /// Retarget, then enumerate windows and resolve the filter.
    pub fn build(&self, display: DisplayHandle, config: Arc<ExclusionConfig>) -> Result<Resolved> {
        let generation = self.retarget(display, Arc::clone(&config));
        self.resolve_target(Target {
            display,
            config,
            generation,
        })
    }

    /// Resolve the current target again without changing it. `Ok(None)`
    /// when torn down.
    pub fn rebuild(&self) -> Result<Option<Resolved>> {
        let Some(target) = self.target.lock().clone() else {
            return Ok(None);
        };
        self.resolve_target(target).map(Some)
    }

    /// Whether `generation` is still the live target.
    pub fn is_current(&self, generation: u64) -> bool {
        self.target
            .lock()
            .as_ref()
            .is_some_and(|t| t.generation == generation)
    }

    fn resolve_target(&self, target: Target) -> Result<Resolved> {
        let windows = self.registry.list_windows()?;
        let filter = resolve(target.display, &target.config, &windows);
        tracing::debug!(
            "Resolved {} excluded window(s) on {} from {} on screen",
            filter.excluded.len(),
            target.display,
            windows.len()
        );
        Ok(Resolved {
            generation: target.generation,
            filter,
        })
    }

    pub fn is_watching(&self) -> bool {
        self.live.lock().is_some()
    }

    /// Subscribe to app lifecycle events and call `apply` with a rebuilt
    /// filter once events go quiet for the debounce period.
    ///
    /// `apply` may receive a result that a concurrent retarget has already
    /// made stale; check [`ExclusionResolver::is_current`] before using it.
    ///
    /// Bursts collapse into a single rebuild. Failed rebuilds are logged and
    /// skipped so the previous filter stays in effect. Must be called from
    /// within a Tokio runtime.
    pub fn start_live_refresh<F>(self: &Arc<Self>, apply: F) -> Result<()>
    where
        F: Fn(Resolved) + Send + Sync + 'static,
    {
        self.stop_watching();

        let (tx, rx) = mpsc::unbounded_channel::<AppEvent>();
        let token = self.registry.watch_app_events(Box::new(move |event| {
            // Receiver gone means the refresh was torn down.
            let _ = tx.send(event);
        }))?;

        let cancel = CancellationToken::new();
        *self.live.lock() = Some(LiveRefresh {
            token,
            cancel: cancel.clone(),
        });

        tokio::spawn(refresh_loop(
            Arc::downgrade(self),
            rx,
            self.debounce,
            cancel,
            apply,
        ));
        tracing::info!("Watching app lifecycle events for exclusion refresh");
        Ok(())
    }

    /// Unsubscribe, cancel any pending refresh and forget the target.
    /// Safe to call repeatedly.
    pub fn teardown(&self) {
        self.stop_watching();
        *self.target.lock() = None;
    }

    fn stop_watching(&self) {
        let live = self.live.lock().take();
        if let Some(live) = live {
            live.cancel.cancel();
            self.registry.unwatch(live.token);
            tracing::info!("Stopped exclusion refresh");
        }
    }
}

impl Drop for ExclusionResolver {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn refresh_loop<F>(
    resolver: Weak<ExclusionResolver>,
    mut events: mpsc::UnboundedReceiver<AppEvent>,
    debounce: Duration,
    cancel: CancellationToken,
    apply: F,
) where
    F: Fn(Resolved) + Send + Sync + 'static,
{
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        tracing::debug!("App event for '{}'; refresh scheduled", first.app_name());

        // Every further event restarts the quiet period.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    if event.is_none() {
                        return;
                    }
                }
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        let Some(resolver) = resolver.upgrade() else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || resolver.rebuild()).await;

        // A teardown during the rebuild discards its result.
        if cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(Ok(Some(resolved))) => apply(resolved),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::warn!("Exclusion refresh failed, keeping previous filter: {e}"),
            Err(e) => tracing::warn!("Exclusion refresh task failed: {e}"),
        }
    }
}
