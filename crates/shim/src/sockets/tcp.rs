use crate::sockets::util::{
    get_unicast_hop_limit, is_valid_address_family, is_valid_remote_address,
    is_valid_unicast_address, receive_buffer_size, send_buffer_size, set_keep_alive_count,
    set_keep_alive_idle_time, set_keep_alive_interval, set_receive_buffer_size,
    set_send_buffer_size, set_unicast_hop_limit, tcp_bind,
};
use crate::sockets::{DEFAULT_TCP_BACKLOG, ErrorCode, IpAddressFamily, SocketAddrUse, WasiSocketsCtx};
use core::fmt::Debug;
use core::future::Future;
use core::mem;
use core::net::SocketAddr;
use core::pin::Pin;
use core::task::{Context, Poll, ready};
use preview_shim_io::p3::{FutureReader, StreamReader, future, stream, stream_with_capacity};
use preview_shim_io::pipe::AsyncReadStream;
use preview_shim_io::runtime::{poll_noop, spawn, with_ambient_tokio_runtime};
use preview_shim_io::{AsyncWriteStream, DynInputStream, DynOutputStream, Subscribe};
use rustix::fd::{AsFd, BorrowedFd};
use rustix::io::Errno;
use rustix::net::{Shutdown, sockopt};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// The maximum number of bytes a P2 output stream over a TCP connection
/// accepts per `check-write` permit.
const SOCKET_WRITE_BUDGET: usize = 64 * 1024;

/// Size of the chunks read off a connection by `receive`.
const RECEIVE_CHUNK: usize = 64 * 1024;

/// How long the accept loop waits before retrying after the process ran out
/// of file descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// The state of a TCP socket.
///
/// This represents the various states a socket can be in during the
/// activities of binding, listening, accepting, and connecting. The
/// `*Started` and `ConnectReady` states only exist for the two-phase
/// Preview2 surface.
pub enum TcpState {
    /// The initial state for a newly-created socket.
    Default(tokio::net::TcpSocket),

    /// Binding started via `start_bind`.
    BindStarted(tokio::net::TcpSocket),

    /// Binding finished. The socket has an address but is not yet listening
    /// for connections.
    Bound(tokio::net::TcpSocket),

    /// Listening started via `start_listen`.
    ListenStarted(tokio::net::TcpSocket),

    /// The socket is now listening and waiting for an incoming connection.
    Listening {
        listener: Arc<TcpListener>,
        pending_accept: Option<io::Result<TcpStream>>,
    },

    /// An outgoing connection is started. The future is absent while a
    /// Preview3 `connect` is awaiting it directly.
    Connecting(Option<ConnectFuture>),

    /// A Preview2 connect attempt finished and `finish_connect` has yet to
    /// observe it.
    ConnectReady(io::Result<TcpStream>),

    /// An outgoing connection has been established.
    Connected(Arc<TcpStream>),

    /// `receive` has taken over the read half of the connection.
    Receiving(Arc<TcpStream>),

    /// Connecting failed, or the socket was shut down.
    Closed,
}

impl Debug for TcpState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Default(_) => f.debug_tuple("Default").finish(),
            Self::BindStarted(_) => f.debug_tuple("BindStarted").finish(),
            Self::Bound(_) => f.debug_tuple("Bound").finish(),
            Self::ListenStarted(_) => f.debug_tuple("ListenStarted").finish(),
            Self::Listening { pending_accept, .. } => f
                .debug_struct("Listening")
                .field("pending_accept", pending_accept)
                .finish(),
            Self::Connecting(_) => f.debug_tuple("Connecting").finish(),
            Self::ConnectReady(_) => f.debug_tuple("ConnectReady").finish(),
            Self::Connected(_) => f.debug_tuple("Connected").finish(),
            Self::Receiving(_) => f.debug_tuple("Receiving").finish(),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Holds a socket in `Connecting(None)` for the duration of a Preview3
/// `connect`. If the connect future is dropped before it settles, the
/// socket is left `Closed`.
struct ConnectGuard<'a>(&'a mut TcpState);

impl<'a> ConnectGuard<'a> {
    fn new(state: &'a mut TcpState) -> Self {
        *state = TcpState::Connecting(None);
        Self(state)
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if matches!(self.0, TcpState::Connecting(None)) {
            tracing::debug!("tcp connect cancelled, closing socket");
            *self.0 = TcpState::Closed;
        }
    }
}

/// A host TCP socket, plus associated bookkeeping.
pub struct TcpSocket {
    /// The current state in the bind/listen/accept/connect progression.
    tcp_state: TcpState,

    /// The desired listen queue size.
    listen_backlog_size: u32,

    family: IpAddressFamily,

    /// Options set on this socket that accepted connections take over.
    options: InheritedOptions,

    /// Policy this socket was created under, consulted on bind and connect.
    sockets: WasiSocketsCtx,
}

impl TcpSocket {
    /// Create a new socket in the given family.
    pub(crate) fn new(sockets: &WasiSocketsCtx, family: IpAddressFamily) -> Result<Self, ErrorCode> {
        sockets.check_allowed_tcp()?;

        let socket = with_ambient_tokio_runtime(|| match family {
            IpAddressFamily::Ipv4 => tokio::net::TcpSocket::new_v4(),
            IpAddressFamily::Ipv6 => {
                let socket = tokio::net::TcpSocket::new_v6()?;
                sockopt::set_ipv6_v6only(&socket, true)?;
                Ok(socket)
            }
        })?;

        Ok(Self::from_state(sockets, TcpState::Default(socket), family))
    }

    fn from_state(sockets: &WasiSocketsCtx, tcp_state: TcpState, family: IpAddressFamily) -> Self {
        Self {
            tcp_state,
            listen_backlog_size: DEFAULT_TCP_BACKLOG,
            family,
            options: InheritedOptions::default(),
            sockets: sockets.clone(),
        }
    }

    pub fn state(&self) -> &TcpState {
        &self.tcp_state
    }

    fn as_fd(&self) -> Result<BorrowedFd<'_>, ErrorCode> {
        match &self.tcp_state {
            TcpState::Default(socket)
            | TcpState::BindStarted(socket)
            | TcpState::Bound(socket)
            | TcpState::ListenStarted(socket) => Ok(socket.as_fd()),
            TcpState::Listening { listener, .. } => Ok(listener.as_fd()),
            TcpState::Connected(stream) | TcpState::Receiving(stream) => Ok(stream.as_fd()),
            TcpState::Connecting(..) | TcpState::ConnectReady(..) | TcpState::Closed => {
                Err(ErrorCode::InvalidState)
            }
        }
    }

    fn validate_bind(&self, addr: SocketAddr) -> Result<(), ErrorCode> {
        if !matches!(self.tcp_state, TcpState::Default(..)) {
            return Err(ErrorCode::InvalidState);
        }
        if !is_valid_unicast_address(addr.ip()) || !is_valid_address_family(addr.ip(), self.family)
        {
            return Err(ErrorCode::InvalidArgument);
        }
        Ok(())
    }

    fn validate_connect(&self, addr: SocketAddr) -> Result<(), ErrorCode> {
        if !is_valid_unicast_address(addr.ip())
            || !is_valid_remote_address(addr)
            || !is_valid_address_family(addr.ip(), self.family)
        {
            return Err(ErrorCode::InvalidArgument);
        }
        match self.tcp_state {
            TcpState::Default(..) | TcpState::Bound(..) => Ok(()),
            TcpState::Connecting(..) | TcpState::ConnectReady(..) => {
                Err(ErrorCode::ConcurrencyConflict)
            }
            _ => Err(ErrorCode::InvalidState),
        }
    }

    /// Binds the socket to `addr` once the address check allows it.
    pub async fn bind(&mut self, addr: SocketAddr) -> Result<(), ErrorCode> {
        self.validate_bind(addr)?;
        self.sockets.check(addr, SocketAddrUse::TcpBind).await?;
        self.start_bind(addr)?;
        self.finish_bind()
    }

    /// First half of a Preview2 bind. The address check has already been
    /// made by the caller.
    pub(crate) fn start_bind(&mut self, addr: SocketAddr) -> Result<(), ErrorCode> {
        self.validate_bind(addr)?;
        let TcpState::Default(socket) = mem::replace(&mut self.tcp_state, TcpState::Closed) else {
            unreachable!("validated above");
        };
        if let Err(err) = tcp_bind(&socket, addr) {
            self.tcp_state = TcpState::Default(socket);
            return Err(err);
        }
        tracing::debug!(%addr, "tcp socket bound");
        self.tcp_state = TcpState::BindStarted(socket);
        Ok(())
    }

    pub(crate) fn finish_bind(&mut self) -> Result<(), ErrorCode> {
        match mem::replace(&mut self.tcp_state, TcpState::Closed) {
            TcpState::BindStarted(socket) => {
                self.tcp_state = TcpState::Bound(socket);
                Ok(())
            }
            current_state => {
                self.tcp_state = current_state;
                Err(ErrorCode::NotInProgress)
            }
        }
    }

    /// Connects to `addr`, moving to the connected state on success and to
    /// the closed state on failure.
    pub async fn connect(&mut self, addr: SocketAddr) -> Result<(), ErrorCode> {
        self.validate_connect(addr)?;
        self.sockets.check(addr, SocketAddrUse::TcpConnect).await?;
        let socket = self.take_unconnected();
        let state = ConnectGuard::new(&mut self.tcp_state);
        match socket.connect(addr).await {
            Ok(stream) => {
                tracing::debug!(%addr, "tcp socket connected");
                *state.0 = TcpState::Connected(Arc::new(stream));
                Ok(())
            }
            Err(err) => {
                tracing::debug!(%addr, ?err, "tcp connect failed");
                *state.0 = TcpState::Closed;
                Err(err.into())
            }
        }
    }

    fn take_unconnected(&mut self) -> tokio::net::TcpSocket {
        match mem::replace(&mut self.tcp_state, TcpState::Closed) {
            TcpState::Default(socket) | TcpState::Bound(socket) => socket,
            _ => unreachable!("connect state validated by the caller"),
        }
    }

    /// First half of a Preview2 connect. The address check has already been
    /// made by the caller.
    pub(crate) fn start_connect(&mut self, addr: SocketAddr) -> Result<(), ErrorCode> {
        self.validate_connect(addr)?;
        let socket = self.take_unconnected();
        let future = socket.connect(addr);
        self.tcp_state = TcpState::Connecting(Some(Box::pin(future)));
        Ok(())
    }

    /// Second half of a Preview2 connect, returning the connection once it
    /// is established or `WouldBlock` while it is still in progress.
    pub(crate) fn finish_connect(&mut self) -> Result<Arc<TcpStream>, ErrorCode> {
        let result = match mem::replace(&mut self.tcp_state, TcpState::Closed) {
            TcpState::ConnectReady(result) => result,
            TcpState::Connecting(Some(mut future)) => {
                match with_ambient_tokio_runtime(|| poll_noop(future.as_mut())) {
                    Some(result) => result,
                    None => {
                        self.tcp_state = TcpState::Connecting(Some(future));
                        return Err(ErrorCode::WouldBlock);
                    }
                }
            }
            current_state => {
                self.tcp_state = current_state;
                return Err(ErrorCode::NotInProgress);
            }
        };

        match result {
            Ok(stream) => {
                let stream = Arc::new(stream);
                self.tcp_state = TcpState::Connected(stream.clone());
                Ok(stream)
            }
            Err(err) => {
                tracing::debug!(?err, "tcp connect failed");
                self.tcp_state = TcpState::Closed;
                Err(err.into())
            }
        }
    }

    /// Starts listening and returns the stream of accepted connections.
    ///
    /// The stream only ends when the listener fails fatally or its reader
    /// is dropped. Failures that concern a single incoming connection are
    /// logged and skipped.
    pub fn listen(&mut self) -> Result<StreamReader<TcpSocket>, ErrorCode> {
        self.start_listen()?;
        self.finish_listen()?;
        let TcpState::Listening { listener, .. } = &self.tcp_state else {
            unreachable!("finish_listen succeeded");
        };
        let listener = listener.clone();
        let sockets = self.sockets.clone();
        let family = self.family;
        let options = self.options.clone();

        let (tx, rx) = stream_with_capacity(1);
        let task = spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(err) => match AcceptFailure::classify(&err) {
                        AcceptFailure::Skip => {
                            tracing::debug!(?err, "skipping failed incoming connection");
                            continue;
                        }
                        AcceptFailure::BackOff => {
                            tracing::warn!(?err, "out of resources while accepting, backing off");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                        AcceptFailure::Fatal => {
                            tracing::warn!(?err, "tcp listener failed, ending accept stream");
                            break;
                        }
                    },
                };
                options.apply(family, &stream);
                let socket =
                    TcpSocket::from_state(&sockets, TcpState::Connected(Arc::new(stream)), family);
                if tx.write(vec![socket]).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx.with_producer(task))
    }

    pub(crate) fn start_listen(&mut self) -> Result<(), ErrorCode> {
        match mem::replace(&mut self.tcp_state, TcpState::Closed) {
            TcpState::Bound(socket) => {
                self.tcp_state = TcpState::ListenStarted(socket);
                Ok(())
            }
            TcpState::ListenStarted(socket) => {
                self.tcp_state = TcpState::ListenStarted(socket);
                Err(ErrorCode::ConcurrencyConflict)
            }
            current_state => {
                self.tcp_state = current_state;
                Err(ErrorCode::InvalidState)
            }
        }
    }

    pub(crate) fn finish_listen(&mut self) -> Result<(), ErrorCode> {
        let socket = match mem::replace(&mut self.tcp_state, TcpState::Closed) {
            TcpState::ListenStarted(socket) => socket,
            current_state => {
                self.tcp_state = current_state;
                return Err(ErrorCode::NotInProgress);
            }
        };

        match with_ambient_tokio_runtime(|| socket.listen(self.listen_backlog_size)) {
            Ok(listener) => {
                tracing::debug!(backlog = self.listen_backlog_size, "tcp socket listening");
                self.tcp_state = TcpState::Listening {
                    listener: Arc::new(listener),
                    pending_accept: None,
                };
                Ok(())
            }
            Err(err) => {
                self.tcp_state = TcpState::Closed;
                Err(match Errno::from_io_error(&err) {
                    // See `tcp_bind`.
                    Some(Errno::AFNOSUPPORT) => ErrorCode::InvalidArgument,
                    _ => err.into(),
                })
            }
        }
    }

    /// Accepts a connection without waiting, for the Preview2 surface.
    pub(crate) fn accept(&mut self) -> Result<TcpSocket, ErrorCode> {
        let TcpState::Listening {
            listener,
            pending_accept,
        } = &mut self.tcp_state
        else {
            return Err(ErrorCode::InvalidState);
        };

        let result = match pending_accept.take() {
            Some(result) => result,
            None => {
                let mut cx = Context::from_waker(futures::task::noop_waker_ref());
                match with_ambient_tokio_runtime(|| listener.poll_accept(&mut cx)) {
                    Poll::Ready(result) => result.map(|(stream, _)| stream),
                    Poll::Pending => return Err(ErrorCode::WouldBlock),
                }
            }
        };
        let stream = result?;
        self.options.apply(self.family, &stream);
        Ok(TcpSocket::from_state(
            &self.sockets,
            TcpState::Connected(Arc::new(stream)),
            self.family,
        ))
    }

    /// Sends everything read from `data` over the connection, then shuts
    /// down the write half.
    ///
    /// The state is checked before the returned future is first polled.
    pub fn send(
        &self,
        mut data: StreamReader<u8>,
    ) -> impl Future<Output = Result<(), ErrorCode>> + Send + use<> {
        let stream = match &self.tcp_state {
            TcpState::Connected(stream) | TcpState::Receiving(stream) => Ok(stream.clone()),
            _ => Err(ErrorCode::InvalidState),
        };
        async move {
            let stream = stream?;
            let mut writer = TcpStreamHalf(stream.clone());
            while let Some(chunk) = data.read(RECEIVE_CHUNK).await {
                writer.write_all(&chunk).await?;
            }
            rustix::net::shutdown(&*stream, Shutdown::Write)?;
            Ok(())
        }
    }

    /// Starts receiving: returns a stream of the bytes read off the
    /// connection and a future of how it ended.
    ///
    /// The future resolves to `Ok(())` on an orderly end of stream and
    /// resolves to `None` if the byte stream is dropped first.
    pub fn receive(
        &mut self,
    ) -> Result<(StreamReader<u8>, FutureReader<Result<(), ErrorCode>>), ErrorCode> {
        let conn = match &self.tcp_state {
            TcpState::Connected(conn) => conn.clone(),
            _ => return Err(ErrorCode::InvalidState),
        };
        self.tcp_state = TcpState::Receiving(conn.clone());

        let (tx, rx) = stream();
        let (mut result_tx, result_rx) = future();
        let task = spawn(async move {
            let mut reader = TcpStreamHalf(conn.clone());
            let mut buf = Vec::with_capacity(RECEIVE_CHUNK);
            let result = loop {
                buf.clear();
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break Ok(()),
                    Ok(_) => {
                        if tx.write(buf.clone()).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(err) => break Err(ErrorCode::from(err)),
                }
            };
            _ = rustix::net::shutdown(&*conn, Shutdown::Read);
            result_tx.write(result);
        });
        Ok((rx.with_producer(task), result_rx))
    }

    /// Builds the Preview2 stream pair over an established connection.
    pub(crate) fn p2_streams(stream: &Arc<TcpStream>) -> (DynInputStream, DynOutputStream) {
        with_ambient_tokio_runtime(|| {
            let input = AsyncReadStream::new(TcpStreamHalf(stream.clone()));
            let output = AsyncWriteStream::new(SOCKET_WRITE_BUDGET, TcpStreamHalf(stream.clone()));
            (
                Box::new(input) as DynInputStream,
                Box::new(output) as DynOutputStream,
            )
        })
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<(), ErrorCode> {
        let stream = match &self.tcp_state {
            TcpState::Connected(stream) | TcpState::Receiving(stream) => stream,
            _ => return Err(ErrorCode::InvalidState),
        };
        rustix::net::shutdown(&**stream, how)?;
        Ok(())
    }

    pub fn local_address(&self) -> Result<SocketAddr, ErrorCode> {
        match &self.tcp_state {
            TcpState::Bound(socket) => Ok(socket.local_addr()?),
            TcpState::Connected(stream) | TcpState::Receiving(stream) => Ok(stream.local_addr()?),
            TcpState::Listening { listener, .. } => Ok(listener.local_addr()?),
            _ => Err(ErrorCode::InvalidState),
        }
    }

    pub fn remote_address(&self) -> Result<SocketAddr, ErrorCode> {
        match &self.tcp_state {
            TcpState::Connected(stream) | TcpState::Receiving(stream) => Ok(stream.peer_addr()?),
            _ => Err(ErrorCode::InvalidState),
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.tcp_state, TcpState::Listening { .. })
    }

    pub fn address_family(&self) -> IpAddressFamily {
        self.family
    }

    /// Sets the queue size used by the upcoming `listen`.
    ///
    /// Zero is rejected and any other value is clamped to what the OS
    /// accepts. The size can no longer change once the socket listens.
    pub fn set_listen_backlog_size(&mut self, value: u64) -> Result<(), ErrorCode> {
        const MIN_BACKLOG: u32 = 1;
        const MAX_BACKLOG: u32 = i32::MAX as u32;

        if value == 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        let value = value
            .try_into()
            .unwrap_or(MAX_BACKLOG)
            .clamp(MIN_BACKLOG, MAX_BACKLOG);
        match &self.tcp_state {
            TcpState::Default(..) | TcpState::BindStarted(..) | TcpState::Bound(..) => {
                self.listen_backlog_size = value;
                Ok(())
            }
            _ => Err(ErrorCode::InvalidState),
        }
    }

    pub fn keep_alive_enabled(&self) -> Result<bool, ErrorCode> {
        Ok(sockopt::socket_keepalive(self.as_fd()?)?)
    }

    pub fn set_keep_alive_enabled(&self, value: bool) -> Result<(), ErrorCode> {
        sockopt::set_socket_keepalive(self.as_fd()?, value)?;
        Ok(())
    }

    /// Idle time in nanoseconds.
    pub fn keep_alive_idle_time(&self) -> Result<u64, ErrorCode> {
        let v = sockopt::tcp_keepidle(self.as_fd()?)?;
        Ok(v.as_nanos().try_into().unwrap_or(u64::MAX))
    }

    pub fn set_keep_alive_idle_time(&self, value: u64) -> Result<(), ErrorCode> {
        let applied = set_keep_alive_idle_time(self.as_fd()?, value)?;
        self.options.0.keep_alive_idle_time.store(applied, Relaxed);
        Ok(())
    }

    pub fn keep_alive_interval(&self) -> Result<u64, ErrorCode> {
        let v = sockopt::tcp_keepintvl(self.as_fd()?)?;
        Ok(v.as_nanos().try_into().unwrap_or(u64::MAX))
    }

    pub fn set_keep_alive_interval(&self, value: u64) -> Result<(), ErrorCode> {
        set_keep_alive_interval(self.as_fd()?, value)
    }

    pub fn keep_alive_count(&self) -> Result<u32, ErrorCode> {
        Ok(sockopt::tcp_keepcnt(self.as_fd()?)?)
    }

    pub fn set_keep_alive_count(&self, value: u32) -> Result<(), ErrorCode> {
        set_keep_alive_count(self.as_fd()?, value)
    }

    pub fn hop_limit(&self) -> Result<u8, ErrorCode> {
        get_unicast_hop_limit(self.as_fd()?, self.family)
    }

    pub fn set_hop_limit(&self, value: u8) -> Result<(), ErrorCode> {
        set_unicast_hop_limit(self.as_fd()?, self.family, value)?;
        self.options.0.hop_limit.store(value, Relaxed);
        Ok(())
    }

    pub fn receive_buffer_size(&self) -> Result<u64, ErrorCode> {
        receive_buffer_size(self.as_fd()?)
    }

    pub fn set_receive_buffer_size(&self, value: u64) -> Result<(), ErrorCode> {
        let applied = set_receive_buffer_size(self.as_fd()?, value)?;
        self.options.0.receive_buffer_size.store(applied, Relaxed);
        Ok(())
    }

    pub fn send_buffer_size(&self) -> Result<u64, ErrorCode> {
        send_buffer_size(self.as_fd()?)
    }

    pub fn set_send_buffer_size(&self, value: u64) -> Result<(), ErrorCode> {
        let applied = set_send_buffer_size(self.as_fd()?, value)?;
        self.options.0.send_buffer_size.store(applied, Relaxed);
        Ok(())
    }
}

/// What the accept loop does about a failed `accept`.
#[derive(Debug, PartialEq, Eq)]
enum AcceptFailure {
    /// The failure concerns one incoming connection only.
    Skip,
    /// The process is out of descriptors or memory. Retrying right away
    /// would spin.
    BackOff,
    /// The listener itself is broken.
    Fatal,
}

impl AcceptFailure {
    fn classify(err: &io::Error) -> AcceptFailure {
        match ErrorCode::from(err) {
            ErrorCode::ConnectionAborted
            | ErrorCode::ConnectionReset
            | ErrorCode::ConnectionRefused
            | ErrorCode::Timeout
            | ErrorCode::WouldBlock => AcceptFailure::Skip,
            ErrorCode::NewSocketLimit | ErrorCode::OutOfMemory => AcceptFailure::BackOff,
            _ => AcceptFailure::Fatal,
        }
    }
}

/// Options explicitly set on a listening socket. Not every platform copies
/// them onto accepted connections, so they are applied by hand. Zero means
/// "never set".
#[derive(Default, Clone)]
struct InheritedOptions(Arc<InheritedOptionsInner>);

#[derive(Default)]
struct InheritedOptionsInner {
    receive_buffer_size: AtomicUsize,
    send_buffer_size: AtomicUsize,
    hop_limit: AtomicU8,
    keep_alive_idle_time: AtomicU64,
}

impl InheritedOptions {
    fn apply(&self, family: IpAddressFamily, stream: &TcpStream) {
        // Failures are ignored: the connection is usable with the defaults.
        let receive_buffer_size = self.0.receive_buffer_size.load(Relaxed);
        if receive_buffer_size > 0 {
            _ = sockopt::set_socket_recv_buffer_size(stream, receive_buffer_size);
        }
        let send_buffer_size = self.0.send_buffer_size.load(Relaxed);
        if send_buffer_size > 0 {
            _ = sockopt::set_socket_send_buffer_size(stream, send_buffer_size);
        }
        let hop_limit = self.0.hop_limit.load(Relaxed);
        if hop_limit > 0 {
            _ = set_unicast_hop_limit(stream, family, hop_limit);
        }
        let keep_alive_idle_time = self.0.keep_alive_idle_time.load(Relaxed);
        if keep_alive_idle_time > 0 {
            _ = sockopt::set_tcp_keepidle(stream, Duration::from_nanos(keep_alive_idle_time));
        }
    }
}

#[async_trait::async_trait]
impl Subscribe for TcpSocket {
    async fn ready(&mut self) {
        match &mut self.tcp_state {
            TcpState::Connecting(Some(future)) => {
                let result = future.as_mut().await;
                self.tcp_state = TcpState::ConnectReady(result);
            }
            TcpState::Listening {
                listener,
                pending_accept,
            } => {
                if pending_accept.is_none() {
                    let result = listener.accept().await.map(|(stream, _)| stream);
                    *pending_accept = Some(result);
                }
            }
            _ => {}
        }
    }
}

/// One side of a shared connection, driven through the readiness API of
/// [`TcpStream`] so that reads and writes can proceed independently.
struct TcpStreamHalf(Arc<TcpStream>);

impl AsyncRead for TcpStreamHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            ready!(self.0.poll_read_ready(cx))?;
            match self.0.try_read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl AsyncWrite for TcpStreamHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            ready!(self.0.poll_write_ready(cx))?;
            match self.0.try_write(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(rustix::net::shutdown(&*self.0, Shutdown::Write).map_err(io::Error::from))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn socket(family: IpAddressFamily) -> TcpSocket {
        TcpSocket::new(&WasiSocketsCtx::default(), family).unwrap()
    }

    fn permissive_socket() -> TcpSocket {
        let mut sockets = WasiSocketsCtx::default();
        sockets.socket_addr_check =
            crate::sockets::SocketAddrCheck::new(|_, _| Box::pin(async { true }));
        TcpSocket::new(&sockets, IpAddressFamily::Ipv4).unwrap()
    }

    async fn listening() -> (TcpSocket, StreamReader<TcpSocket>, SocketAddr) {
        let mut listener = permissive_socket();
        listener.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let accepted = listener.listen().unwrap();
        let addr = listener.local_address().unwrap();
        (listener, accepted, addr)
    }

    #[test_log::test(tokio::test)]
    async fn cancelled_connect_closes_the_socket() {
        let mut s = permissive_socket();
        // A non-routable address keeps the connect pending, or fails it
        // outright on hosts without a route. Either way it settles `Closed`.
        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            s.connect("10.255.255.1:80".parse().unwrap()),
        )
        .await;
        if let Ok(result) = attempt {
            assert!(result.is_err());
        }
        assert!(matches!(s.state(), TcpState::Closed));
        assert_eq!(
            s.connect("127.0.0.1:80".parse().unwrap()).await,
            Err(ErrorCode::InvalidState)
        );
        assert_eq!(s.local_address(), Err(ErrorCode::InvalidState));
    }

    #[test_log::test(tokio::test)]
    async fn listen_stream_keeps_accepting() {
        let (_listener, mut accepted, addr) = listening().await;
        for _ in 0..2 {
            let client = TcpStream::connect(addr).await.unwrap();
            let socket = accepted.read(1).await.unwrap().pop().unwrap();
            assert_eq!(
                socket.remote_address().unwrap(),
                client.local_addr().unwrap()
            );
        }
    }

    #[test]
    fn accept_failures() {
        let classify = |errno: Errno| AcceptFailure::classify(&io::Error::from(errno));
        assert_eq!(classify(Errno::CONNABORTED), AcceptFailure::Skip);
        assert_eq!(classify(Errno::CONNRESET), AcceptFailure::Skip);
        assert_eq!(classify(Errno::INTR), AcceptFailure::Skip);
        assert_eq!(classify(Errno::MFILE), AcceptFailure::BackOff);
        assert_eq!(classify(Errno::NFILE), AcceptFailure::BackOff);
        assert_eq!(classify(Errno::NOBUFS), AcceptFailure::BackOff);
        assert_eq!(classify(Errno::BADF), AcceptFailure::Fatal);
        assert_eq!(classify(Errno::INVAL), AcceptFailure::Fatal);
    }

    #[test_log::test(tokio::test)]
    async fn accepted_sockets_take_listener_options() {
        let mut listener = permissive_socket();
        listener.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        listener.set_hop_limit(42).unwrap();
        listener.set_keep_alive_idle_time(7_000_000_000).unwrap();
        let mut accepted = listener.listen().unwrap();
        let addr = listener.local_address().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let socket = accepted.read(1).await.unwrap().pop().unwrap();
        assert_eq!(socket.hop_limit().unwrap(), 42);
        assert_eq!(socket.keep_alive_idle_time().unwrap(), 7_000_000_000);
    }

    #[test_log::test(tokio::test)]
    async fn backlog_size_rules() {
        let mut s = socket(IpAddressFamily::Ipv4);
        assert_eq!(s.set_listen_backlog_size(0), Err(ErrorCode::InvalidArgument));
        s.set_listen_backlog_size(u64::MAX).unwrap();
        assert_eq!(s.listen_backlog_size, i32::MAX as u32);
        s.set_listen_backlog_size(16).unwrap();

        s.start_bind("127.0.0.1:0".parse().unwrap()).unwrap();
        s.finish_bind().unwrap();
        let _accepted = s.listen().unwrap();
        assert!(s.is_listening());
        assert_eq!(s.set_listen_backlog_size(32), Err(ErrorCode::InvalidState));
    }

    #[test_log::test(tokio::test)]
    async fn two_phase_bind() {
        let mut s = socket(IpAddressFamily::Ipv4);
        assert_eq!(s.finish_bind(), Err(ErrorCode::NotInProgress));
        assert_eq!(s.local_address(), Err(ErrorCode::InvalidState));
        s.start_bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(
            s.start_bind("127.0.0.1:0".parse().unwrap()),
            Err(ErrorCode::InvalidState)
        );
        s.finish_bind().unwrap();
        assert_ne!(s.local_address().unwrap().port(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn invalid_addresses() {
        let mut s = socket(IpAddressFamily::Ipv4);
        assert_eq!(
            s.start_bind("224.0.0.1:0".parse().unwrap()),
            Err(ErrorCode::InvalidArgument)
        );
        assert_eq!(
            s.start_connect("127.0.0.1:0".parse().unwrap()),
            Err(ErrorCode::InvalidArgument)
        );
        assert_eq!(
            s.start_connect("[::1]:80".parse().unwrap()),
            Err(ErrorCode::InvalidArgument)
        );
        assert!(matches!(s.state(), TcpState::Default(_)));
    }

    #[test_log::test(tokio::test)]
    async fn options_on_an_unconnected_socket() {
        let s = socket(IpAddressFamily::Ipv4);
        s.set_keep_alive_enabled(true).unwrap();
        assert!(s.keep_alive_enabled().unwrap());
        assert_eq!(s.set_hop_limit(0), Err(ErrorCode::InvalidArgument));
        s.set_hop_limit(42).unwrap();
        assert_eq!(s.hop_limit().unwrap(), 42);
        assert_eq!(s.set_receive_buffer_size(0), Err(ErrorCode::InvalidArgument));
        s.set_receive_buffer_size(8192).unwrap();
        assert!(s.receive_buffer_size().unwrap() > 0);
        assert_eq!(s.set_keep_alive_count(0), Err(ErrorCode::InvalidArgument));
    }

    #[test_log::test(tokio::test)]
    async fn tcp_disallowed() {
        let mut sockets = WasiSocketsCtx::default();
        sockets.allowed_network_uses.tcp = false;
        assert!(matches!(
            TcpSocket::new(&sockets, IpAddressFamily::Ipv4),
            Err(ErrorCode::AccessDenied)
        ));
    }
}
