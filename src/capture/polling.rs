//! Window registry built on periodic re-enumeration.
//!
//! The OS window list has no portable change notification, so each watcher
//! polls the list at a fixed interval and derives app lifecycle events from
//! the difference between two snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::capture::backend::{AppEvent, AppEventCallback, WatchToken, WindowRegistry};
use crate::capture::error::Result;
use crate::capture::types::{WindowHandle, WindowInfo};

/// Default re-enumeration interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(750);

/// One window as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceWindow {
    pub handle: WindowHandle,
    pub owner_app_name: String,
    pub minimized: bool,
    pub focused: bool,
}

/// Raw window enumeration, wrapped for unit-testability.
pub trait WindowSource: Send + Sync {
    fn enumerate(&self) -> Result<Vec<SourceWindow>>;
}

/// Per-app view of one enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AppPresence {
    shown: bool,
    focused: bool,
}

type Snapshot = BTreeMap<String, AppPresence>;

fn snapshot(windows: &[SourceWindow]) -> Snapshot {
    let mut apps = Snapshot::new();
    for window in windows.iter().filter(|w| !w.owner_app_name.is_empty()) {
        let app = apps.entry(window.owner_app_name.clone()).or_default();
        app.shown |= !window.minimized;
        app.focused |= window.focused;
    }
    apps
}

/// Lifecycle events implied by moving from `before` to `after`.
///
/// A new owner is `Launched`, an owner whose windows were all minimized and
/// now shows one is `Unhidden`, and an owner gaining focus is `Activated`.
fn app_events(before: &Snapshot, after: &Snapshot) -> Vec<AppEvent> {
    let mut events = Vec::new();
    for (app_name, now) in after {
        let app_name = app_name.clone();
        match before.get(&app_name) {
            None => events.push(AppEvent::Launched { app_name }),
            Some(was) if now.shown && !was.shown => events.push(AppEvent::Unhidden { app_name }),
            Some(was) if now.focused && !was.focused => {
                events.push(AppEvent::Activated { app_name })
            }
            Some(_) => {}
        }
    }
    events
}

struct Poller {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    fn stop(mut self) {
        drop(self.stop);
        if let Some(handle) = self.thread.take() {
            // A callback may unwatch from the polling thread itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// [`WindowRegistry`] over any [`WindowSource`]. Minimized windows are not
/// listed; each watcher gets its own polling thread.
pub struct PollingWindowRegistry<S> {
    source: Arc<S>,
    interval: Duration,
    pollers: Mutex<HashMap<WatchToken, Poller>>,
    next_token: Mutex<u64>,
}

impl<S: WindowSource + 'static> PollingWindowRegistry<S> {
    pub fn new(source: S) -> Self {
        Self::with_interval(source, DEFAULT_POLL_INTERVAL)
    }

    /// Start with a custom polling interval (useful for testing).
    pub fn with_interval(source: S, interval: Duration) -> Self {
        Self {
            source: Arc::new(source),
            interval,
            pollers: Mutex::new(HashMap::new()),
            next_token: Mutex::new(1),
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.pollers.lock().len()
    }
}

impl<S: WindowSource + 'static> WindowRegistry for PollingWindowRegistry<S> {
    fn list_windows(&self) -> Result<Vec<WindowInfo>> {
        Ok(self
            .source
            .enumerate()?
            .into_iter()
            .filter(|w| !w.minimized)
            .map(|w| WindowInfo::new(w.handle, w.owner_app_name))
            .collect())
    }

    fn watch_app_events(&self, callback: AppEventCallback) -> Result<WatchToken> {
        let initial = snapshot(&self.source.enumerate()?);
        let token = {
            let mut next = self.next_token.lock();
            let token = WatchToken(*next);
            *next += 1;
            token
        };

        let (stop, stopped) = mpsc::channel::<()>();
        let source = Arc::clone(&self.source);
        let interval = self.interval;
        let thread = std::thread::Builder::new()
            .name(format!("window-poll-{}", token.0))
            .spawn(move || {
                let mut known = initial;
                // Dropping the sender ends the wait early.
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    let current = match source.enumerate() {
                        Ok(windows) => snapshot(&windows),
                        Err(e) => {
                            tracing::debug!("Window re-enumeration failed: {e}");
                            continue;
                        }
                    };
                    for event in app_events(&known, &current) {
                        tracing::debug!("App event: {event:?}");
                        callback(event);
                    }
                    known = current;
                }
            })
            .expect("failed to spawn window poll thread");

        self.pollers.lock().insert(
            token,
            Poller {
                stop,
                thread: Some(thread),
            },
        );
        Ok(token)
    }

    fn unwatch(&self, token: WatchToken) {
        let poller = self.pollers.lock().remove(&token);
        if let Some(poller) = poller {
            poller.stop();
        }
    }
}

impl<S> Drop for PollingWindowRegistry<S> {
    fn drop(&mut self) {
        for (_, poller) in self.pollers.get_mut().drain() {
            poller.stop();
        }
    }
}
