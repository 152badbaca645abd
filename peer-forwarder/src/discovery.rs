use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Receives the full peer list every time membership changes.
pub trait PeerListListener: Send + Sync {
    fn on_peer_list_change(&self, peers: &[String]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Supplies the addresses of every node in the fleet, this one included.
pub trait PeerListProvider: Send + Sync {
    fn peer_list(&self) -> Vec<String>;
    fn add_listener(&self, listener: Arc<dyn PeerListListener>) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

/// Appends `default_port` to addresses given without one.
pub fn normalize_address(address: &str, default_port: u16) -> String {
    let address = address.trim();
    let has_port = match address.rsplit_once(':') {
        // Bracketed IPv6 literal: a port only follows the closing bracket.
        Some((host, port)) if address.starts_with('[') => {
            host.ends_with(']') && port.parse::<u16>().is_ok()
        }
        Some((host, port)) => !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    };

    if has_port {
        address.to_owned()
    } else if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{default_port}")
    } else {
        format!("{address}:{default_port}")
    }
}

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    registered: Mutex<Vec<(ListenerId, Arc<dyn PeerListListener>)>>,
}

impl Listeners {
    fn add(&self, listener: Arc<dyn PeerListListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(registered, _)| *registered != id);
    }

    fn notify(&self, peers: &[String]) {
        // Listeners are called outside the lock so they may register or remove listeners.
        let listeners: Vec<Arc<dyn PeerListListener>> = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener.on_peer_list_change(peers);
        }
    }
}

/// A fleet of one: every key resolves to this node.
pub struct LocalNodeProvider {
    address: String,
    listeners: Listeners,
}

impl LocalNodeProvider {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            listeners: Listeners::default(),
        }
    }
}

impl PeerListProvider for LocalNodeProvider {
    fn peer_list(&self) -> Vec<String> {
        vec![self.address.clone()]
    }

    fn add_listener(&self, listener: Arc<dyn PeerListListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }
}

pub struct StaticPeerListProvider {
    peers: RwLock<Vec<String>>,
    listeners: Listeners,
}

impl StaticPeerListProvider {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers: RwLock::new(peers),
            listeners: Listeners::default(),
        }
    }

    /// Replaces the list and notifies listeners. Used by operators and tests to move
    /// membership without a discovery backend.
    pub fn update(&self, peers: Vec<String>) {
        *self.peers.write().unwrap_or_else(PoisonError::into_inner) = peers.clone();
        info!(?peers, "static peer list updated");
        self.listeners.notify(&peers);
    }
}

impl PeerListProvider for StaticPeerListProvider {
    fn peer_list(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn add_listener(&self, listener: Arc<dyn PeerListListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }
}

/// Resolves a domain name into the peer list, re-resolving on a fixed interval.
pub struct DnsPeerListProvider {
    domain_name: String,
    port: u16,
    refresh_interval: Duration,
    peers: RwLock<Vec<String>>,
    listeners: Listeners,
}

impl DnsPeerListProvider {
    pub fn new(domain_name: impl Into<String>, port: u16, refresh_interval: Duration) -> Self {
        Self {
            domain_name: domain_name.into(),
            port,
            refresh_interval,
            peers: RwLock::new(Vec::new()),
            listeners: Listeners::default(),
        }
    }

    async fn resolve(&self) -> std::io::Result<Vec<String>> {
        let mut peers: Vec<String> =
            tokio::net::lookup_host((self.domain_name.as_str(), self.port))
                .await?
                .map(|address| address.to_string())
                .collect();
        peers.sort();
        peers.dedup();
        Ok(peers)
    }

    /// Resolves once, notifying listeners if the address set changed. A failed or empty
    /// resolution keeps the last known list.
    pub async fn refresh(&self) {
        let peers = match self.resolve().await {
            Ok(peers) if !peers.is_empty() => peers,
            Ok(_) => {
                warn!(domain = %self.domain_name, "dns lookup returned no addresses");
                return;
            }
            Err(error) => {
                warn!(domain = %self.domain_name, %error, "dns lookup failed");
                return;
            }
        };

        {
            let mut current = self.peers.write().unwrap_or_else(PoisonError::into_inner);
            if *current == peers {
                return;
            }
            *current = peers.clone();
        }

        info!(domain = %self.domain_name, ?peers, "peer list changed");
        self.listeners.notify(&peers);
    }

    /// Refreshes every interval until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(domain = %self.domain_name, "stopping dns discovery");
                    return;
                }
                _ = interval.tick() => self.refresh().await,
            }
        }
    }
}

impl PeerListProvider for DnsPeerListProvider {
    fn peer_list(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn add_listener(&self, listener: Arc<dyn PeerListListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl PeerListListener for RecordingListener {
        fn on_peer_list_change(&self, peers: &[String]) {
            self.seen.lock().unwrap().push(peers.to_vec());
        }
    }

    #[test]
    fn normalize_appends_missing_ports() {
        assert_eq!(normalize_address("10.0.0.1", 4994), "10.0.0.1:4994");
        assert_eq!(normalize_address("10.0.0.1:21890", 4994), "10.0.0.1:21890");
        assert_eq!(normalize_address(" peer-a ", 4994), "peer-a:4994");
        assert_eq!(normalize_address("::1", 4994), "[::1]:4994");
        assert_eq!(normalize_address("[::1]:80", 4994), "[::1]:80");
    }

    #[test]
    fn local_node_lists_only_itself() {
        let provider = LocalNodeProvider::new("127.0.0.1:4994");
        assert_eq!(provider.peer_list(), vec!["127.0.0.1:4994".to_string()]);
    }

    #[test]
    fn static_provider_notifies_until_removed() {
        let provider = StaticPeerListProvider::new(vec!["a:1".to_string()]);
        let listener = Arc::new(RecordingListener::default());
        let id = provider.add_listener(listener.clone());

        provider.update(vec!["a:1".to_string(), "b:1".to_string()]);
        provider.remove_listener(id);
        provider.update(vec!["b:1".to_string()]);

        assert_eq!(
            *listener.seen.lock().unwrap(),
            vec![vec!["a:1".to_string(), "b:1".to_string()]]
        );
        assert_eq!(provider.peer_list(), vec!["b:1".to_string()]);
    }

    #[test]
    fn providers_do_not_share_listeners() {
        let first = StaticPeerListProvider::new(vec![]);
        let second = StaticPeerListProvider::new(vec![]);
        let listener = Arc::new(RecordingListener::default());
        first.add_listener(listener.clone());

        second.update(vec!["x:1".to_string()]);

        assert!(listener.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dns_refresh_resolves_and_notifies_once() {
        let provider = DnsPeerListProvider::new("localhost", 4994, Duration::from_secs(60));
        let listener = Arc::new(RecordingListener::default());
        provider.add_listener(listener.clone());

        provider.refresh().await;
        provider.refresh().await;

        let peers = provider.peer_list();
        assert!(!peers.is_empty());
        assert!(peers.iter().all(|peer| peer.ends_with(":4994")));
        assert_eq!(listener.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dns_failure_keeps_last_list() {
        let provider = DnsPeerListProvider::new("does-not-exist.invalid", 4994, Duration::from_secs(60));

        provider.refresh().await;

        assert!(provider.peer_list().is_empty());
    }

    #[tokio::test]
    async fn dns_loop_stops_on_shutdown() {
        let provider = Arc::new(DnsPeerListProvider::new(
            "localhost",
            4994,
            Duration::from_millis(10),
        ));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(provider.clone().run(shutdown.clone()));

        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("discovery loop stopped")
            .unwrap();
    }
}
