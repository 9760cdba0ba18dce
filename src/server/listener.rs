// Listener
//
// A single thread accepts data-plane connections, reads the 4-byte shard
// selector, and hands the stream to the chosen shard's worker. If the
// listen socket dies it is rebuilt with a 3-second backoff; accepted
// connections in the middle of their handshake are unaffected.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::server::proto::SHARD_SELECT_SIZE;
use crate::server::worker::WorkerHandle;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const RELISTEN_BACKOFF: Duration = Duration::from_secs(3);

/// Build a listen socket the way every plane here wants it: v6-only,
/// reusable, keepalive, zero linger, nodelay, kernel-enforced user timeout.
pub(crate) fn listen_socket(port: u16, backlog: u32, tcp_timeout: Duration) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket.set_linger(Some(Duration::ZERO))?;
    socket.set_nodelay(true)?;
    socket.set_tcp_user_timeout(Some(tcp_timeout))?;
    socket.set_nonblocking(true)?;

    let addr: SocketAddr = format!("[::]:{port}")
        .parse()
        .map_err(|e| CacheError::Configuration(format!("listen address: {e}")))?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// A connection that has not yet named its shard.
struct Handshake {
    stream: TcpStream,
    buf: [u8; SHARD_SELECT_SIZE],
    read: usize,
}

pub struct Listener {
    config: CacheConfig,
    poll: Poll,
    listener: Option<TcpListener>,
    addr: SocketAddr,
    pending: Slab<Handshake>,
    workers: Vec<WorkerHandle>,
}

impl Listener {
    pub fn bind(config: CacheConfig, workers: Vec<WorkerHandle>) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = listen_socket(
            config.port,
            config.max_conn,
            Duration::from_millis(u64::from(config.tcp_timeout_ms)),
        )?;
        let addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        info!(%addr, "data plane listening");

        Ok(Self {
            config,
            poll,
            listener: Some(listener),
            addr,
            pending: Slab::new(),
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(64);
        loop {
            if self.listener.is_none() {
                std::thread::sleep(RELISTEN_BACKOFF);
                self.relisten();
            }
            let timeout = if self.listener.is_none() {
                Some(Duration::ZERO)
            } else {
                None
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("listener poll failed: {e}");
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_pending();
                } else {
                    self.drive_handshake(event.token().0);
                }
            }
        }
    }

    fn relisten(&mut self) {
        match listen_socket(
            self.config.port,
            self.config.max_conn,
            Duration::from_millis(u64::from(self.config.tcp_timeout_ms)),
        ) {
            Ok(mut listener) => {
                if self
                    .poll
                    .registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
                    .is_ok()
                {
                    info!(port = self.config.port, "listen socket rebuilt");
                    self.listener = Some(listener);
                }
            }
            Err(e) => warn!("re-listen failed: {e}"),
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => self.adopt(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept failed, rebuilding listen socket: {e}");
                    self.listener = None;
                    return;
                }
            }
        }
    }

    fn adopt(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        {
            let sock = SockRef::from(&stream);
            let _ = sock.set_keepalive(true);
            let _ = sock.set_tcp_user_timeout(Some(Duration::from_millis(u64::from(
                self.config.tcp_timeout_ms,
            ))));
        }

        let entry = self.pending.vacant_entry();
        let token = Token(entry.key());
        if self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
            .is_err()
        {
            return;
        }
        debug!(%peer, "awaiting shard selector");
        entry.insert(Handshake {
            stream,
            buf: [0; SHARD_SELECT_SIZE],
            read: 0,
        });
    }

    fn drive_handshake(&mut self, slot: usize) {
        enum Step {
            Continue,
            Complete,
            Abort,
            Wait,
        }

        loop {
            let step = {
                let Some(pending) = self.pending.get_mut(slot) else {
                    return;
                };
                match pending.stream.read(&mut pending.buf[pending.read..]) {
                    Ok(0) => Step::Abort,
                    Ok(n) => {
                        pending.read += n;
                        if pending.read == SHARD_SELECT_SIZE {
                            Step::Complete
                        } else {
                            Step::Continue
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Wait,
                    Err(_) => Step::Abort,
                }
            };
            match step {
                Step::Continue => {}
                Step::Complete => {
                    self.finish_handshake(slot);
                    return;
                }
                Step::Abort => {
                    self.abort_handshake(slot);
                    return;
                }
                Step::Wait => return,
            }
        }
    }

    fn abort_handshake(&mut self, slot: usize) {
        let mut gone = self.pending.remove(slot);
        let _ = self.poll.registry().deregister(&mut gone.stream);
    }

    fn finish_handshake(&mut self, slot: usize) {
        let mut done = self.pending.remove(slot);
        let _ = self.poll.registry().deregister(&mut done.stream);

        let shard = u32::from_be_bytes(done.buf);
        match self.workers.get(shard as usize) {
            Some(worker) => {
                debug!(shard, "dispatching connection");
                worker.dispatch(done.stream);
            }
            None => debug!(shard, "shard selector out of range, closing"),
        }
    }
}
