use std::sync::Arc;

use hyper::{Body, Client, Request};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

/// "Can we reach the remote service right now?", readable synchronously,
/// with change notifications.
pub trait NetworkSignal: Send + Sync {
    fn usable(&self) -> bool;

    /// Receiver that observes every change of `usable()`.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Signal driven by whoever owns it: OS connectivity callbacks in an app,
/// tests, or a one-shot probe in the CLI.
pub struct SwitchSignal {
    tx: watch::Sender<bool>,
}

impl SwitchSignal {
    pub fn new(usable: bool) -> Self {
        let (tx, _rx) = watch::channel(usable);
        Self { tx }
    }

    /// Returns true if the value changed.
    pub fn set(&self, usable: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == usable {
                return false;
            }
            *current = usable;
            true
        })
    }
}

impl NetworkSignal for SwitchSignal {
    fn usable(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Connected,
    Disconnected,
    Reconnecting,
}

struct MonitorShared {
    state: watch::Sender<ConnectivityState>,
    usable: watch::Sender<bool>,
}

/// Polls a health URL of the remote service and publishes the result.
///
/// Only `Connected` counts as usable. The first failed probe after being
/// connected reports `Disconnected`; later failures report `Reconnecting`.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    shared: Arc<MonitorShared>,
    health_url: String,
    interval: Duration,
    timeout: Duration,
}

impl ConnectivityMonitor {
    pub fn new<T: Into<String>>(health_url: T, interval: Duration) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Disconnected);
        let (usable, _) = watch::channel(false);
        Self {
            shared: Arc::new(MonitorShared { state, usable }),
            health_url: health_url.into(),
            interval,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> ConnectivityState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.shared.state.subscribe()
    }

    pub async fn run(self) {
        let mut reconnecting = false;

        loop {
            let ok = Self::check_once(&self.health_url, self.timeout).await;

            let new_state = if ok {
                reconnecting = false;
                ConnectivityState::Connected
            } else if reconnecting {
                ConnectivityState::Reconnecting
            } else {
                reconnecting = true;
                ConnectivityState::Disconnected
            };

            self.apply(new_state);
            sleep(self.interval).await;
        }
    }

    fn apply(&self, new_state: ConnectivityState) {
        let changed = self.shared.state.send_if_modified(|current| {
            if *current == new_state {
                return false;
            }
            *current = new_state;
            true
        });
        if changed {
            log::info!("Connectivity to {} is now {:?}", self.health_url, new_state);
        }

        let usable = new_state == ConnectivityState::Connected;
        self.shared.usable.send_if_modified(|current| {
            if *current == usable {
                return false;
            }
            *current = usable;
            true
        });
    }

    /// One GET against the health URL. Any 2xx within `timeout` is healthy.
    pub async fn check_once(health_url: &str, timeout: Duration) -> bool {
        let request = match Request::get(health_url).body(Body::empty()) {
            Ok(request) => request,
            Err(_) => return false,
        };

        let client = Client::new();
        match tokio::time::timeout(timeout, client.request(request)).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }
}

impl NetworkSignal for ConnectivityMonitor {
    fn usable(&self) -> bool {
        *self.shared.usable.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.usable.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_signal_notifies_only_on_change() {
        let signal = SwitchSignal::new(false);
        let mut rx = signal.subscribe();
        assert!(!signal.usable());

        assert!(!signal.set(false));
        assert!(!rx.has_changed().unwrap());

        assert!(signal.set(true));
        assert!(signal.usable());
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
    }

    #[test]
    fn monitor_tracks_disconnect_then_reconnecting() {
        let monitor = ConnectivityMonitor::new("http://127.0.0.1:1/health", Duration::from_secs(1));
        assert_eq!(monitor.state(), ConnectivityState::Disconnected);
        assert!(!monitor.usable());

        monitor.apply(ConnectivityState::Connected);
        assert!(monitor.usable());

        monitor.apply(ConnectivityState::Reconnecting);
        assert_eq!(monitor.state(), ConnectivityState::Reconnecting);
        assert!(!monitor.usable());
    }
}
