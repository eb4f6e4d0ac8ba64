//! Endpoint lifecycle: bind, start, stop, unbind.

use mio::Poll;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::acceptor::{Acceptor, AcceptorState};
use crate::channel::Channel;
use crate::config::EndpointConfig;
use crate::error::Error;
use crate::event::{EventQueue, PollerEvent};
use crate::executor::ThreadPool;
use crate::handler::{Executor, Handler};
use crate::latch::{ConnectionLimiter, StopLatch};
use crate::pool::SyncStack;
use crate::poller::{Poller, PollerHandle, WAKE_TOKEN};
use crate::processor::SocketProcessor;
use crate::selector_pool::SelectorPool;

/// Endpoint-wide state shared by acceptors, pollers, and workers.
pub(crate) struct Shared {
    pub(crate) config: EndpointConfig,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) executor: OnceLock<Arc<dyn Executor>>,
    running: AtomicBool,
    paused: AtomicBool,
    pub(crate) limiter: ConnectionLimiter,
    pub(crate) stop_latch: StopLatch,
    pub(crate) channel_cache: SyncStack<Channel>,
    pub(crate) event_cache: SyncStack<PollerEvent>,
    pub(crate) processor_cache: SyncStack<SocketProcessor>,
    pub(crate) selectors: SelectorPool,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) rotation: AtomicUsize,
}

impl Shared {
    pub(crate) fn new(
        config: EndpointConfig,
        handler: Arc<dyn Handler>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        let socket_config = &config.socket;
        Self {
            handler,
            executor: OnceLock::new(),
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            limiter: ConnectionLimiter::new(config.max_connections),
            stop_latch: StopLatch::new(config.poller_threads),
            channel_cache: SyncStack::new(socket_config.buffer_pool),
            event_cache: SyncStack::new(socket_config.event_cache),
            processor_cache: SyncStack::new(socket_config.processor_cache),
            selectors: SelectorPool::new(socket_config.max_helper_selectors),
            tls,
            rotation: AtomicUsize::new(0),
            config,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }
}

/// A readiness-based TCP endpoint.
///
/// ```no_run
/// use std::sync::Arc;
/// use trireme::{Endpoint, EndpointConfig, Handler, SocketEvent, SocketState};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     fn process(
///         &self,
///         conn: &Arc<trireme::Connection>,
///         _event: SocketEvent,
///     ) -> SocketState {
///         let mut buf = [0u8; 4096];
///         match conn.read(&mut buf) {
///             Ok(0) => SocketState::Closed,
///             Ok(n) => {
///                 let _ = conn.write(&buf[..n]);
///                 conn.register_read_interest();
///                 SocketState::Open
///             }
///             Err(_) => SocketState::Closed,
///         }
///     }
/// }
///
/// let mut endpoint = Endpoint::new(EndpointConfig::default(), Arc::new(Echo));
/// endpoint.bind().unwrap();
/// endpoint.start().unwrap();
/// ```
pub struct Endpoint {
    config: EndpointConfig,
    handler: Arc<dyn Handler>,
    executor: Option<Arc<dyn Executor>>,
    tls: Option<Arc<rustls::ServerConfig>>,
    listener: Option<Arc<TcpListener>>,
    local_addr: Option<SocketAddr>,
    shared: Option<Arc<Shared>>,
    pollers: Vec<Arc<PollerHandle>>,
    poller_threads: Vec<JoinHandle<()>>,
    acceptor_threads: Vec<JoinHandle<()>>,
    acceptor_states: Vec<Arc<AtomicU8>>,
    running: bool,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, handler: Arc<dyn Handler>) -> Self {
        Self {
            config,
            handler,
            executor: None,
            tls: None,
            listener: None,
            local_addr: None,
            shared: None,
            pollers: Vec::new(),
            poller_threads: Vec::new(),
            acceptor_threads: Vec::new(),
            acceptor_states: Vec::new(),
            running: false,
        }
    }

    /// Supply the worker pool. Without this, `start` creates a default
    /// [`ThreadPool`] sized by `worker_threads`.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Activate the secure channel variant: every accepted connection gets a
    /// TLS session built from this configuration.
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Create (or adopt) and bind the server socket. The socket stays in
    /// blocking mode; the acceptor thread parks in `accept`.
    pub fn bind(&mut self) -> Result<(), Error> {
        self.config.validate()?;
        if self.listener.is_some() {
            return Ok(());
        }

        let listener = if self.config.use_inherited_channel {
            // adopt the socket the OS launched us with
            use std::os::fd::FromRawFd;
            unsafe { TcpListener::from_raw_fd(0) }
        } else {
            let addr = SocketAddr::new(self.config.address, self.config.port);
            let domain = match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            };
            let socket = socket2::Socket::new(
                domain,
                socket2::Type::STREAM,
                Some(socket2::Protocol::TCP),
            )?;
            socket.set_reuse_address(true)?;
            socket.bind(&addr.into())?;
            socket.listen(self.config.accept_count as i32)?;
            socket.into()
        };

        self.local_addr = listener.local_addr().ok();
        self.listener = Some(Arc::new(listener));
        Ok(())
    }

    /// The bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Allocate caches and the connection limiter, spawn poller threads,
    /// then acceptor threads.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }
        let listener = self.listener.clone().ok_or(Error::NotBound)?;

        let shared = Arc::new(Shared::new(
            self.config.clone(),
            self.handler.clone(),
            self.tls.clone(),
        ));

        let executor: Arc<dyn Executor> = match &self.executor {
            Some(executor) => executor.clone(),
            None => Arc::new(ThreadPool::new(self.config.worker_threads).map_err(Error::Io)?),
        };
        let _ = shared.executor.set(executor);

        for id in 0..self.config.poller_threads {
            let poll = Poll::new()?;
            let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
            let registry = poll.registry().try_clone()?;
            let handle = Arc::new(PollerHandle {
                id,
                queue: EventQueue::new(waker),
                registry,
                close: AtomicBool::new(false),
                key_count: AtomicUsize::new(0),
            });
            let poller = Poller::new(poll, handle.clone(), shared.clone());
            let priority = self.config.poller_thread_priority;
            let thread = std::thread::Builder::new()
                .name(format!("poller-{id}"))
                .spawn(move || {
                    if priority != 0 {
                        apply_thread_priority(priority);
                    }
                    poller.run();
                })
                .map_err(Error::Io)?;
            self.pollers.push(handle);
            self.poller_threads.push(thread);
        }

        for id in 0..self.config.acceptor_threads {
            let state = Arc::new(AtomicU8::new(AcceptorState::New as u8));
            let acceptor = Acceptor::new(
                shared.clone(),
                listener.clone(),
                self.pollers.clone(),
                state.clone(),
            );
            let thread = std::thread::Builder::new()
                .name(format!("acceptor-{id}"))
                .spawn(move || acceptor.run())
                .map_err(Error::Io)?;
            self.acceptor_states.push(state);
            self.acceptor_threads.push(thread);
        }

        self.shared = Some(shared);
        self.running = true;
        Ok(())
    }

    /// Stop accepting; established connections keep being served.
    pub fn pause(&self) {
        if let Some(shared) = &self.shared {
            shared.set_paused(true);
        }
    }

    pub fn resume(&self) {
        if let Some(shared) = &self.shared {
            shared.set_paused(false);
        }
    }

    /// Stop the endpoint: unblock the acceptor, close every poller, wait on
    /// the stop latch, then shut the worker pool down and clear the caches.
    /// Returns `false` when the pollers did not stop within the deadline.
    pub fn stop(&mut self) -> bool {
        if !self.running {
            return true;
        }
        self.running = false;

        let Some(shared) = self.shared.clone() else {
            return true;
        };

        shared.limiter.release_all();
        shared.set_paused(true);
        shared.set_running(false);
        self.unlock_accept();

        for handle in &self.pollers {
            handle.destroy();
        }

        let deadline = Duration::from_millis(self.config.selector_timeout_ms + 100);
        let clean = shared.stop_latch.wait(deadline);
        if !clean {
            tracing::warn!("timed out waiting for poller threads to stop");
        }

        if let Some(executor) = shared.executor.get() {
            executor.shutdown();
        }
        shared.event_cache.clear();
        shared.channel_cache.clear();
        shared.processor_cache.clear();

        for thread in self.acceptor_threads.drain(..) {
            let _ = thread.join();
        }
        for thread in self.poller_threads.drain(..) {
            let _ = thread.join();
        }
        self.pollers.clear();
        self.acceptor_states.clear();

        clean
    }

    /// Close the server socket and release the handler.
    pub fn unbind(&mut self) {
        if self.running {
            self.stop();
        }
        self.listener = None;
        self.local_addr = None;
        self.handler.recycle();
        self.tls = None;
        self.shared = None;
    }

    /// Unblock acceptor threads parked in `accept`: shut the listening
    /// socket down for reads, with a loopback self-connect as a fallback.
    fn unlock_accept(&self) {
        let Some(listener) = &self.listener else {
            return;
        };
        unsafe {
            libc::shutdown(listener.as_raw_fd(), libc::SHUT_RD);
        }
        if let Some(addr) = self.local_addr {
            let wake_addr = if addr.ip().is_unspecified() {
                let localhost: IpAddr = match addr {
                    SocketAddr::V4(_) => IpAddr::from([127, 0, 0, 1]),
                    SocketAddr::V6(_) => IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1]),
                };
                SocketAddr::new(localhost, addr.port())
            } else {
                addr
            };
            let _ = TcpStream::connect_timeout(&wake_addr, Duration::from_millis(100));
        }
    }

    /// Current state of each acceptor thread.
    pub fn acceptor_states(&self) -> Vec<AcceptorState> {
        self.acceptor_states
            .iter()
            .map(|state| match state.load(Ordering::Relaxed) {
                0 => AcceptorState::New,
                1 => AcceptorState::Running,
                2 => AcceptorState::Paused,
                _ => AcceptorState::Ended,
            })
            .collect()
    }

    /// Reconfigure the connection limit at runtime; -1 makes the limiter
    /// unbounded.
    pub fn set_max_connections(&self, max: i64) {
        if let Some(shared) = &self.shared {
            shared.limiter.set_max(max);
        }
    }

    /// Number of connections currently counted by the limiter.
    pub fn active_connections(&self) -> i64 {
        self.shared
            .as_ref()
            .map(|shared| shared.limiter.count())
            .unwrap_or(0)
    }

    /// Connections currently registered across all pollers (keep-alive
    /// connections waiting for their next request included).
    pub fn keep_alive_count(&self) -> usize {
        self.pollers.iter().map(|p| p.key_count()).sum()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply_thread_priority(nice: i32) {
    // on Linux this scopes to the calling thread, not the process
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS as _, 0, nice);
    }
}
