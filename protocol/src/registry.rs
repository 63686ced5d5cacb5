use crate::{
    config::Config,
    connection::Connection,
    endpoint::Endpoint,
    errors::ProtocolResult,
    socket::Services,
};
use log::debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// The set of live connections, so that a single driver can tick all of them.
///
/// The registry lock only guards the list. `update_all` works on a snapshot, so connections
/// may be constructed or destroyed from inside event callbacks.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<Endpoint>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Creates an idle connection and registers it.
    pub fn construct(&self, config: Config, services: Services) -> ProtocolResult<Endpoint> {
        let endpoint = Endpoint::new(Connection::new(config, services)?);
        self.lock().push(endpoint.clone());
        debug!("registry: constructed connection #{}", self.len());
        Ok(endpoint)
    }

    /// Unregisters the connection and releases its socket and buffers. Unacked data is lost.
    pub fn destroy(&self, endpoint: &Endpoint) -> bool {
        let removed = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|entry| !entry.ptr_eq(endpoint));
            before != entries.len()
        };
        endpoint.destroy();
        removed
    }

    /// Runs one engine step on every registered connection.
    pub fn update_all(&self) {
        for endpoint in self.endpoints() {
            endpoint.update();
        }
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Endpoint>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::Registry;
    use crate::{
        config::Config,
        connection::Phase,
        simulator::{ManualClock, SimNetwork},
    };

    #[test]
    fn construct_and_destroy() {
        let network = SimNetwork::new();
        let clock = ManualClock::new();
        let registry = Registry::new();
        let a = registry
            .construct(Config::default(), network.services(&clock))
            .unwrap();
        let b = registry
            .construct(Config::default(), network.services(&clock))
            .unwrap();
        assert_eq!(registry.len(), 2);

        a.listen("5000").unwrap();
        assert!(registry.destroy(&a));
        assert!(!registry.destroy(&a));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.phase(), Phase::Dead);
        assert!(registry.endpoints()[0].ptr_eq(&b));
        // the port was released
        b.listen("5000").unwrap();
    }

    #[test]
    fn invalid_config_is_not_registered() {
        let network = SimNetwork::new();
        let clock = ManualClock::new();
        let registry = Registry::new();
        assert!(registry
            .construct(Config::new(10, 15, 20), network.services(&clock))
            .is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn update_all_drives_the_handshake() {
        let network = SimNetwork::new();
        let clock = ManualClock::new();
        let registry = Registry::new();
        let server = registry
            .construct(Config::default(), network.services(&clock))
            .unwrap();
        let client = registry
            .construct(Config::default(), network.services(&clock))
            .unwrap();
        server.listen("5000#reg").unwrap();
        client.connect("$7f000001:5000#reg").unwrap();
        for _ in 0..3 {
            registry.update_all();
            clock.advance(10);
        }
        assert_eq!(server.phase(), Phase::Open);
        assert_eq!(client.phase(), Phase::Open);
    }
}
