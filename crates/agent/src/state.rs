use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::api::AgentEvent;
use crate::config::AgentConfig;
use crate::credentials::CredentialCache;
use crate::gate::ReadinessGate;
use crate::gcp::Gcp;
use crate::tokens::GlobalCounters;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Process-wide state shared by the proxy path, the ops loop, and the
/// status surface.
///
/// The proxy path only reads; every write flows through the ops loop, so
/// the caches here are guarded by small rwlocks and atomics rather than one
/// big mutex.
pub struct AppState {
    pub cfg: AgentConfig,
    pub gcp: Arc<Gcp>,
    pub gate: ReadinessGate,
    pub credentials: CredentialCache,
    pub counters: GlobalCounters,
    events: broadcast::Sender<AgentEvent>,

    vm_ip: RwLock<Option<String>>,
    public_ip: RwLock<Option<String>>,
    firewall_active: AtomicBool,
    proxy_ready: AtomicBool,
    rotated_once: AtomicBool,
    last_request: RwLock<Option<DateTime<Utc>>>,
}

pub type SharedState = Arc<AppState>;

pub fn new_state(cfg: AgentConfig, gcp: Arc<Gcp>, credentials: CredentialCache) -> SharedState {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    Arc::new(AppState {
        cfg,
        gcp,
        gate: ReadinessGate::new(),
        credentials,
        counters: GlobalCounters::default(),
        events,
        vm_ip: RwLock::new(None),
        public_ip: RwLock::new(None),
        firewall_active: AtomicBool::new(false),
        proxy_ready: AtomicBool::new(false),
        rotated_once: AtomicBool::new(false),
        last_request: RwLock::new(None),
    })
}

impl AppState {
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Best-effort publish; a dashboard that isn't listening is not an error.
    pub fn publish(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    pub fn cached_vm_ip(&self) -> Option<String> {
        self.vm_ip.read().expect("state lock poisoned").clone()
    }

    pub fn set_vm_ip(&self, ip: String) {
        *self.vm_ip.write().expect("state lock poisoned") = Some(ip);
    }

    pub fn cached_public_ip(&self) -> Option<String> {
        self.public_ip.read().expect("state lock poisoned").clone()
    }

    pub fn set_public_ip(&self, ip: String) {
        *self.public_ip.write().expect("state lock poisoned") = Some(ip);
    }

    pub fn firewall_active(&self) -> bool {
        self.firewall_active.load(Ordering::Relaxed)
    }

    pub fn set_firewall_active(&self, active: bool) {
        self.firewall_active.store(active, Ordering::Relaxed);
    }

    /// True once the agent has verified the remote is serving.
    pub fn proxy_ready(&self) -> bool {
        self.proxy_ready.load(Ordering::Relaxed)
    }

    pub fn set_proxy_ready(&self, ready: bool) {
        self.proxy_ready.store(ready, Ordering::Relaxed);
    }

    /// One rotation per stopped-to-running cycle; retries of a failed setup
    /// must not mint another bundle.
    pub fn rotated_this_cycle(&self) -> bool {
        self.rotated_once.load(Ordering::Relaxed)
    }

    pub fn set_rotated_this_cycle(&self) {
        self.rotated_once.store(true, Ordering::Relaxed);
    }

    pub fn last_request_at(&self) -> Option<DateTime<Utc>> {
        *self.last_request.read().expect("state lock poisoned")
    }

    pub fn touch_last_request(&self) {
        *self.last_request.write().expect("state lock poisoned") = Some(Utc::now());
    }

    /// Clears every cached assumption about the remote so the next setup
    /// pass re-discovers it. Called only from the ops loop.
    pub async fn reset_proxy_state(&self) {
        *self.vm_ip.write().expect("state lock poisoned") = None;
        self.proxy_ready.store(false, Ordering::Relaxed);
        self.gate.close();
        self.rotated_once.store(false, Ordering::Relaxed);
        self.credentials.invalidate().await;
    }
}
