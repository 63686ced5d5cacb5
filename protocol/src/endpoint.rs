use crate::{
    connection::{Connection, ControlOption, Event, Phase, Status},
    datagram::Datagram,
    errors::ProtocolResult,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError},
};

pub type Callback = Box<dyn FnMut(&Endpoint, &Event) + Send>;

struct Shared {
    connection: Mutex<Connection>,
    callback: Mutex<Option<Callback>>,
    /// A callback change waiting for the dispatch that holds `callback` to finish.
    replacement: Mutex<Option<Option<Callback>>>,
    pending: Mutex<VecDeque<Event>>,
}

/// `Endpoint` provides the interface into the protocol handling.
///
/// It is a cheap, cloneable handle to one connection. Every call locks the connection, runs,
/// and then hands the events it raised to the callback with the lock released, so the callback
/// may call back into the endpoint. Events raised by such nested calls are queued and delivered
/// by the outermost dispatch, in order. A callback installed or cleared from inside the
/// callback takes over from the next event.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    pub fn new(connection: Connection) -> Self {
        Self {
            shared: Arc::new(Shared {
                connection: Mutex::new(connection),
                callback: Mutex::new(None),
                replacement: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Installs the event callback, replacing any previous one.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&Endpoint, &Event) + Send + 'static,
    {
        self.replace_callback(Some(Box::new(callback)));
    }

    pub fn clear_callback(&self) {
        self.replace_callback(None);
    }

    fn replace_callback(&self, callback: Option<Callback>) {
        *lock(&self.shared.replacement) = Some(callback);
        self.dispatch();
    }

    pub fn phase(&self) -> Phase {
        lock(&self.shared.connection).phase()
    }

    pub fn status(&self) -> Status {
        lock(&self.shared.connection).status()
    }

    pub fn tick(&self) -> u32 {
        lock(&self.shared.connection).tick()
    }

    pub fn resolve(&self, addr: &str, divider: char) -> ProtocolResult<String> {
        lock(&self.shared.connection).resolve(addr, divider)
    }

    pub fn unresolve(&self) {
        lock(&self.shared.connection).unresolve()
    }

    pub fn listen(&self, addr: &str) -> ProtocolResult<()> {
        self.with_connection(|connection| connection.listen(addr))
    }

    pub fn unlisten(&self) -> ProtocolResult<()> {
        self.with_connection(Connection::unlisten)
    }

    pub fn connect(&self, addr: &str) -> ProtocolResult<()> {
        self.with_connection(|connection| connection.connect(addr))
    }

    pub fn unconnect(&self) -> ProtocolResult<()> {
        self.with_connection(Connection::unconnect)
    }

    pub fn control(&self, option: ControlOption) -> ProtocolResult<()> {
        self.with_connection(|connection| connection.control(option))
    }

    pub fn update(&self) {
        self.with_connection(Connection::update)
    }

    pub fn send(&self, datagram: Datagram) -> ProtocolResult<usize> {
        self.with_connection(|connection| connection.send(datagram))
    }

    pub fn peek(&self, buffer: &mut [u8]) -> ProtocolResult<usize> {
        lock(&self.shared.connection).peek(buffer)
    }

    pub fn peek_tick(&self) -> ProtocolResult<u32> {
        lock(&self.shared.connection).peek_tick()
    }

    pub fn recv(&self, buffer: &mut [u8]) -> ProtocolResult<usize> {
        self.with_connection(|connection| connection.recv(buffer))
    }

    pub(crate) fn destroy(&self) {
        self.with_connection(Connection::destroy);
        lock(&self.shared.pending).clear();
    }

    fn with_connection<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut Connection) -> T,
    {
        let (result, events) = {
            let mut connection = lock(&self.shared.connection);
            let result = f(&mut connection);
            (result, connection.take_events())
        };
        if !events.is_empty() {
            lock(&self.shared.pending).extend(events);
        }
        self.dispatch();
        result
    }

    fn dispatch(&self) {
        loop {
            let mut callback = match self.shared.callback.try_lock() {
                Ok(callback) => callback,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // a dispatch further up the stack delivers what was just queued
                Err(TryLockError::WouldBlock) => return,
            };
            loop {
                let replacement = lock(&self.shared.replacement).take();
                if let Some(replacement) = replacement {
                    *callback = replacement;
                }
                let next = lock(&self.shared.pending).pop_front();
                let event = match next {
                    Some(event) => event,
                    None => break,
                };
                if let Some(callback) = callback.as_mut() {
                    callback(self, &event);
                }
            }
            drop(callback);
            // another thread may have queued after the last check but before the unlock
            let idle = lock(&self.shared.pending).is_empty();
            if idle && lock(&self.shared.replacement).is_none() {
                return;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use super::Endpoint;
    use crate::{
        config::Config,
        connection::{CloseReason, Connection, Event, Phase},
        datagram::Datagram,
        errors::ProtocolError,
        simulator::{ManualClock, SimNetwork},
    };
    use std::sync::{Arc, Mutex};

    fn endpoint(network: &SimNetwork, clock: &ManualClock) -> Endpoint {
        let connection =
            Connection::new(Config::new(32, 32 * 8, 32 * 8), network.services(clock)).unwrap();
        Endpoint::new(connection)
    }

    fn open_pair(network: &SimNetwork, clock: &ManualClock) -> (Endpoint, Endpoint) {
        let server = endpoint(network, clock);
        let client = endpoint(network, clock);
        server.listen("9000#pair").unwrap();
        client.connect("127.0.0.1:9000#pair").unwrap();
        for _ in 0..10 {
            client.update();
            server.update();
            client.update();
            clock.advance(10);
        }
        assert_eq!(server.phase(), Phase::Open);
        assert_eq!(client.phase(), Phase::Open);
        (server, client)
    }

    #[test]
    fn callback_sees_events_in_order() {
        let network = SimNetwork::new();
        let clock = ManualClock::new();
        let server = endpoint(&network, &clock);
        let client = endpoint(&network, &clock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.set_callback(move |_, event| sink.lock().unwrap().push(*event));

        server.listen("9000#pair").unwrap();
        client.connect("127.0.0.1:9000#pair").unwrap();
        for _ in 0..5 {
            client.update();
            server.update();
            clock.advance(10);
        }
        server.send(Datagram::reliable(b"welcome")).unwrap();
        client.update();
        client.unconnect().unwrap();
        client.update();
        clock.advance(10);
        client.update();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Event::Opened,
                Event::DataReady,
                Event::Closed(CloseReason::Local)
            ]
        );
    }

    #[test]
    fn callback_may_call_back_into_the_endpoint() {
        let network = SimNetwork::new();
        let clock = ManualClock::new();
        let (server, client) = open_pair(&network, &clock);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        server.set_callback(move |endpoint, event| {
            if *event == Event::DataReady {
                let mut buffer = [0; 32];
                while let Ok(len) = endpoint.recv(&mut buffer) {
                    sink.lock().unwrap().push(buffer[..len].to_vec());
                }
                // a nested call that raises events must not deadlock
                endpoint.update();
            }
        });

        client.send(Datagram::reliable(b"one")).unwrap();
        client.send(Datagram::reliable(b"two")).unwrap();
        server.update();

        assert_eq!(
            *received.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        let mut buffer = [0; 32];
        assert_eq!(server.recv(&mut buffer).unwrap_err(), ProtocolError::Starved);
    }

    #[test]
    fn callback_may_replace_itself() {
        let network = SimNetwork::new();
        let clock = ManualClock::new();
        let server = endpoint(&network, &clock);
        let client = endpoint(&network, &clock);
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let first_sink = Arc::clone(&first);
        let second_sink = Arc::clone(&second);
        client.set_callback(move |endpoint, event| {
            first_sink.lock().unwrap().push(*event);
            let sink = Arc::clone(&second_sink);
            endpoint.set_callback(move |endpoint, event| {
                sink.lock().unwrap().push(*event);
                if let Event::Closed(_) = event {
                    endpoint.clear_callback();
                }
            });
        });

        server.listen("9000#pair").unwrap();
        client.connect("127.0.0.1:9000#pair").unwrap();
        for _ in 0..5 {
            client.update();
            server.update();
            clock.advance(10);
        }
        server.send(Datagram::reliable(b"welcome")).unwrap();
        client.update();
        client.unconnect().unwrap();
        client.update();
        clock.advance(10);
        client.update();

        assert_eq!(*first.lock().unwrap(), vec![Event::Opened]);
        assert_eq!(
            *second.lock().unwrap(),
            vec![Event::DataReady, Event::Closed(CloseReason::Local)]
        );
    }

    #[test]
    fn clones_share_the_connection() {
        let network = SimNetwork::new();
        let clock = ManualClock::new();
        let a = endpoint(&network, &clock);
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        a.listen("9100").unwrap();
        assert_eq!(b.phase(), Phase::Listening);
        assert!(!a.ptr_eq(&endpoint(&network, &clock)));
    }

    #[test]
    fn events_without_callback_are_discarded() {
        let network = SimNetwork::new();
        let clock = ManualClock::new();
        let (_server, client) = open_pair(&network, &clock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.set_callback(move |_, event| sink.lock().unwrap().push(*event));
        client.update();
        assert!(seen.lock().unwrap().is_empty());
        client.clear_callback();
    }
}
