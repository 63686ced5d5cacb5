use log::{debug, warn};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tether_protocol::Registry;

/// Drives every connection in a registry from a background thread.
///
/// The thread stops when the ticker is dropped.
pub struct Ticker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(registry: Arc<Registry>, period: Duration) -> io::Result<Ticker> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("tether-ticker".to_string())
            .spawn(move || {
                debug!("ticker: started, period {:?}", period);
                while flag.load(Ordering::Relaxed) {
                    registry.update_all();
                    thread::sleep(period);
                }
                debug!("ticker: stopped");
            })?;
        Ok(Ticker {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("ticker: update thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::Ticker;
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };
    use tether_protocol::{
        simulator::{ManualClock, SimNetwork},
        Config, Phase, Registry,
    };

    #[test]
    fn drives_a_handshake_in_the_background() {
        let network = SimNetwork::new();
        let clock = ManualClock::new();
        let registry = Arc::new(Registry::new());
        let server = registry
            .construct(Config::default(), network.services(&clock))
            .unwrap();
        let client = registry
            .construct(Config::default(), network.services(&clock))
            .unwrap();
        server.listen("7400#tick").unwrap();
        client.connect("127.0.0.1:7400#tick").unwrap();

        let ticker = Ticker::spawn(Arc::clone(&registry), Duration::from_millis(1)).unwrap();
        assert!(ticker.is_running());
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.phase() != Phase::Open && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(ticker);

        assert_eq!(server.phase(), Phase::Open);
        assert_eq!(client.phase(), Phase::Open);
    }
}
