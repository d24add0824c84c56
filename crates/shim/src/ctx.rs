use crate::cli::{StdinStream, StdoutStream};
use crate::clocks::{HostMonotonicClock, HostWallClock, MonotonicClock, WallClock};
use crate::sockets::{
    AllowedNetworkUses, ErrorCode, IpAddressFamily, SocketAddrCheck, SocketAddrUse, TcpSocket,
    UdpSocket, WasiSocketsCtx,
};
use preview_shim_io::pipe::{ClosedInputStream, SinkOutputStream};
use preview_shim_io::runtime::AbortOnDropJoinHandle;
use preview_shim_io::{IoView, ResourceTable};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

/// Configuration for a [`WasiCtx`], consumed by [`build`](Self::build).
///
/// Out of the box stdin is closed, stdout and stderr discard everything,
/// the clocks are the host's, and sockets may be created but every address
/// is refused.
///
/// ```
/// use preview_shim::WasiCtxBuilder;
///
/// let ctx = WasiCtxBuilder::new()
///     .arg("server")
///     .env("PORT", "8080")
///     .inherit_network()
///     .build();
/// assert_eq!(ctx.arguments(), ["server"]);
/// ```
pub struct WasiCtxBuilder {
    ctx: WasiCtx,
}

impl WasiCtxBuilder {
    pub fn new() -> Self {
        WasiCtxBuilder {
            ctx: WasiCtx {
                stdin: Box::new(ClosedInputStream),
                stdout: Box::new(SinkOutputStream),
                stderr: Box::new(SinkOutputStream),
                env: Vec::new(),
                args: Vec::new(),
                initial_cwd: None,
                sockets: WasiSocketsCtx::default(),
                wall_clock: Box::new(WallClock),
                monotonic_clock: Box::new(MonotonicClock::new()),
                stdout_pump: None,
                stderr_pump: None,
            },
        }
    }

    pub fn stdin(mut self, stdin: impl StdinStream + 'static) -> Self {
        self.ctx.stdin = Box::new(stdin);
        self
    }

    pub fn stdout(mut self, stdout: impl StdoutStream + 'static) -> Self {
        self.ctx.stdout = Box::new(stdout);
        self
    }

    pub fn stderr(mut self, stderr: impl StdoutStream + 'static) -> Self {
        self.ctx.stderr = Box::new(stderr);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.push((key.into(), value.into()));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.ctx.args.push(arg.into());
        self
    }

    pub fn initial_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.ctx.initial_cwd = Some(cwd.into());
        self
    }

    pub fn wall_clock(mut self, clock: impl HostWallClock + 'static) -> Self {
        self.ctx.wall_clock = Box::new(clock);
        self
    }

    /// Replaces the clock behind `wasi:clocks/monotonic-clock`, including
    /// the deadlines of its pollables.
    pub fn monotonic_clock(mut self, clock: impl HostMonotonicClock + 'static) -> Self {
        self.ctx.monotonic_clock = Box::new(clock);
        self
    }

    /// Decides, per address and use, whether a socket may touch it.
    pub fn socket_addr_check<F>(mut self, check: F) -> Self
    where
        F: Fn(SocketAddr, SocketAddrUse) -> Pin<Box<dyn Future<Output = bool> + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.ctx.sockets.socket_addr_check = SocketAddrCheck::new(check);
        self
    }

    /// Permits every socket address.
    pub fn inherit_network(self) -> Self {
        self.socket_addr_check(|_, _| Box::pin(async { true }))
    }

    pub fn allow_tcp(mut self, enable: bool) -> Self {
        self.ctx.sockets.allowed_network_uses.tcp = enable;
        self
    }

    pub fn allow_udp(mut self, enable: bool) -> Self {
        self.ctx.sockets.allowed_network_uses.udp = enable;
        self
    }

    pub fn build(self) -> WasiCtx {
        let AllowedNetworkUses { tcp, udp } = self.ctx.sockets.allowed_network_uses;
        tracing::debug!(
            args = self.ctx.args.len(),
            env = self.ctx.env.len(),
            tcp,
            udp,
            "built context"
        );
        self.ctx
    }
}

impl Default for WasiCtxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-instance state behind the CLI, clock and socket interfaces.
pub struct WasiCtx {
    pub(crate) stdin: Box<dyn StdinStream>,
    pub(crate) stdout: Box<dyn StdoutStream>,
    pub(crate) stderr: Box<dyn StdoutStream>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) args: Vec<String>,
    pub(crate) initial_cwd: Option<String>,
    pub(crate) sockets: WasiSocketsCtx,
    pub(crate) wall_clock: Box<dyn HostWallClock>,
    pub(crate) monotonic_clock: Box<dyn HostMonotonicClock>,
    pub(crate) stdout_pump: Option<AbortOnDropJoinHandle<()>>,
    pub(crate) stderr_pump: Option<AbortOnDropJoinHandle<()>>,
}

impl WasiCtx {
    pub fn create_tcp_socket(&self, family: IpAddressFamily) -> Result<TcpSocket, ErrorCode> {
        TcpSocket::new(&self.sockets, family)
    }

    pub fn create_udp_socket(&self, family: IpAddressFamily) -> Result<UdpSocket, ErrorCode> {
        UdpSocket::new(&self.sockets, family)
    }
}

/// A context and the table holding its resources, borrowed together.
///
/// The host traits in [`crate::bindings`] are implemented for this type.
pub struct WasiCtxView<'a> {
    pub ctx: &'a mut WasiCtx,
    pub table: &'a mut ResourceTable,
}

impl IoView for WasiCtxView<'_> {
    fn table(&mut self) -> &mut ResourceTable {
        self.table
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bindings::wasi::clocks::{monotonic_clock, wall_clock};
    use std::time::Duration;

    struct Frozen;

    impl HostMonotonicClock for Frozen {
        fn resolution(&self) -> u64 {
            1_000
        }
        fn now(&self) -> u64 {
            42
        }
    }

    impl HostWallClock for Frozen {
        fn resolution(&self) -> Duration {
            Duration::from_secs(1)
        }
        fn now(&self) -> Duration {
            Duration::new(1_700_000_000, 5)
        }
    }

    #[test]
    fn builder_collects_configuration() {
        let ctx = WasiCtxBuilder::new()
            .arg("prog")
            .arg("-v")
            .env("A", "1")
            .env("B", "2")
            .initial_cwd("/work")
            .build();
        assert_eq!(ctx.arguments(), ["prog", "-v"]);
        assert_eq!(
            ctx.environment(),
            [("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
        );
        assert_eq!(ctx.initial_cwd(), Some("/work"));
    }

    #[test]
    fn configured_clocks_back_the_host_calls() {
        let mut ctx = WasiCtxBuilder::new()
            .monotonic_clock(Frozen)
            .wall_clock(Frozen)
            .build();
        let mut table = ResourceTable::new();
        let mut view = WasiCtxView {
            ctx: &mut ctx,
            table: &mut table,
        };
        assert_eq!(monotonic_clock::Host::now(&mut view).unwrap(), 42);
        assert_eq!(monotonic_clock::Host::resolution(&mut view).unwrap(), 1_000);
        let wall = wall_clock::Host::now(&mut view).unwrap();
        assert_eq!((wall.seconds, wall.nanoseconds), (1_700_000_000, 5));
    }

    #[test_log::test(tokio::test)]
    async fn network_policy() {
        let ctx = WasiCtxBuilder::new().allow_udp(false).build();
        assert!(ctx.create_tcp_socket(IpAddressFamily::Ipv4).is_ok());
        assert_eq!(
            ctx.create_udp_socket(IpAddressFamily::Ipv4).err(),
            Some(ErrorCode::AccessDenied)
        );
    }
}
