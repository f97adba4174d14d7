//! Controller Discovery
//!
//! Keeps track of controllers seen by a scanner. Advertisements are fed in
//! through [`DiscoveryManager::device_found`]; a controller not seen again
//! within the lost-controller timeout is reported as lost by the sweep.

use crate::domain::settings::DiscoverySettings;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

pub trait DiscoveryListener: Send + Sync {
    fn on_discover_controller(&self, _address: &str) {}
    fn on_lose_controller(&self, _address: &str) {}
}

#[derive(Debug, Clone)]
struct DiscoveredController {
    address: String,
    last_seen: Instant,
}

pub struct DiscoveryManager {
    device_names: Vec<String>,
    lost_controller_timeout: Duration,
    check_interval: Duration,
    discovered: Vec<DiscoveredController>,
    listeners: Vec<Arc<dyn DiscoveryListener>>,
    discovering: bool,
}

impl DiscoveryManager {
    pub fn new(settings: &DiscoverySettings) -> Self {
        Self {
            device_names: settings.device_names.clone(),
            lost_controller_timeout: settings.lost_controller_timeout(),
            check_interval: settings.lost_controller_check_interval(),
            discovered: Vec::new(),
            listeners: Vec::new(),
            discovering: false,
        }
    }

    pub fn add_discovery_listener(&mut self, listener: Arc<dyn DiscoveryListener>) {
        self.listeners.push(listener);
    }

    pub fn remove_discovery_listener(&mut self, listener: &Arc<dyn DiscoveryListener>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        self.listeners.len() != before
    }

    /// Forget previous results and accept advertisements
    pub fn start_discovery(&mut self) {
        info!("Starting controller discovery for {:?}", self.device_names);
        self.discovered.clear();
        self.discovering = true;
    }

    pub fn stop_discovery(&mut self) {
        if self.discovering {
            info!("Stopping controller discovery");
        }
        self.discovering = false;
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    /// Addresses currently considered in range
    pub fn discovered_controllers(&self) -> Vec<String> {
        self.discovered.iter().map(|c| c.address.clone()).collect()
    }

    /// Feed a scan result. Returns `true` if this is a newly discovered controller.
    pub fn device_found(&mut self, address: &str, name: Option<&str>, now: Instant) -> bool {
        if !self.discovering {
            return false;
        }
        let Some(name) = name else {
            return false;
        };
        if !self.device_names.iter().any(|n| n == name) {
            return false;
        }

        if let Some(known) = self.discovered.iter_mut().find(|c| c.address == address) {
            known.last_seen = now;
            return false;
        }

        info!("Discovered controller {} ({})", address, name);
        self.discovered.push(DiscoveredController {
            address: address.to_string(),
            last_seen: now,
        });
        for listener in self.listeners.clone() {
            listener.on_discover_controller(address);
        }
        true
    }

    /// Drop controllers not seen for the lost-controller timeout. Returns their addresses.
    pub fn sweep_lost(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.lost_controller_timeout;
        let (lost, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.discovered)
            .into_iter()
            .partition(|c| now.saturating_duration_since(c.last_seen) >= timeout);
        self.discovered = kept;

        let listeners = self.listeners.clone();
        lost.into_iter()
            .map(|controller| {
                info!("Lost controller {}", controller.address);
                for listener in &listeners {
                    listener.on_lose_controller(&controller.address);
                }
                controller.address
            })
            .collect()
    }
}

/// Run [`DiscoveryManager::sweep_lost`] at the configured interval until discovery stops.
///
/// Listeners run with the manager locked and must not call back into it.
pub fn spawn_lost_controller_sweep(manager: Arc<Mutex<DiscoveryManager>>) -> JoinHandle<()> {
    let period = manager
        .lock()
        .map(|m| m.check_interval)
        .unwrap_or(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let mut manager = manager.lock().unwrap_or_else(|e| e.into_inner());
            if !manager.is_discovering() {
                debug!("Discovery stopped, lost controller sweep finished");
                break;
            }
            manager.sweep_lost(Instant::now());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl DiscoveryListener for Recorder {
        fn on_discover_controller(&self, address: &str) {
            self.events.lock().unwrap().push(format!("found {}", address));
        }

        fn on_lose_controller(&self, address: &str) {
            self.events.lock().unwrap().push(format!("lost {}", address));
        }
    }

    fn manager() -> (DiscoveryManager, Arc<Recorder>) {
        let mut manager = DiscoveryManager::new(&DiscoverySettings::default());
        let recorder = Arc::new(Recorder::default());
        manager.add_discovery_listener(recorder.clone());
        manager.start_discovery();
        (manager, recorder)
    }

    #[test]
    fn test_filters_by_device_name() {
        let (mut manager, recorder) = manager();
        let now = Instant::now();

        assert!(!manager.device_found("AA", Some("Headphones"), now));
        assert!(!manager.device_found("BB", None, now));
        assert!(manager.device_found("CC", Some("Nuimo"), now));
        assert!(!manager.device_found("CC", Some("Nuimo"), now));

        assert_eq!(manager.discovered_controllers(), vec!["CC".to_string()]);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["found CC".to_string()]);
    }

    #[test]
    fn test_ignores_advertisements_when_stopped() {
        let (mut manager, _) = manager();
        manager.stop_discovery();
        assert!(!manager.device_found("CC", Some("Nuimo"), Instant::now()));
    }

    #[test]
    fn test_sweep_reports_stale_controllers() {
        let (mut manager, recorder) = manager();
        let start = Instant::now();
        manager.device_found("AA", Some("Nuimo"), start);
        manager.device_found("BB", Some("Nuimo"), start);
        manager.device_found("BB", Some("Nuimo"), start + Duration::from_secs(5));

        assert!(manager.sweep_lost(start + Duration::from_secs(6)).is_empty());
        assert_eq!(
            manager.sweep_lost(start + Duration::from_secs(7)),
            vec!["AA".to_string()]
        );
        assert_eq!(manager.discovered_controllers(), vec!["BB".to_string()]);
        assert_eq!(recorder.events.lock().unwrap().last().unwrap(), "lost AA");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_runs_until_discovery_stops() {
        let (mut manager, recorder) = manager();
        manager.device_found("AA", Some("Nuimo"), Instant::now());
        let manager = Arc::new(Mutex::new(manager));
        let task = spawn_lost_controller_sweep(manager.clone());

        tokio::time::sleep(Duration::from_millis(7500)).await;
        assert!(manager.lock().unwrap().discovered_controllers().is_empty());
        assert!(recorder.events.lock().unwrap().contains(&"lost AA".to_string()));

        manager.lock().unwrap().stop_discovery();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(task.is_finished());
    }
}
