use preview_shim::bindings::wasi::io::streams::{HostInputStream, HostOutputStream};
use preview_shim::bindings::wasi::sockets::instance_network::Host as _;
use preview_shim::bindings::wasi::sockets::tcp::HostTcpSocket;
use preview_shim::bindings::wasi::sockets::tcp_create_socket::Host as _;
use preview_shim::sockets::{ErrorCode, IpAddressFamily, IpSocketAddress, SocketError};
use preview_shim::{IoImpl, ResourceTable, WasiCtx, WasiCtxBuilder, WasiCtxView};
use preview_shim_io::p3::stream;
use preview_shim_io::poll;
use std::net::SocketAddr;

fn networked() -> WasiCtx {
    WasiCtxBuilder::new().inherit_network().build()
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn code<T>(result: Result<T, SocketError>) -> ErrorCode {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(err) => err.downcast().expect("expected an error code, not a trap"),
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn tcp_send_and_receive() {
    let ctx = networked();

    let mut listener = ctx.create_tcp_socket(IpAddressFamily::Ipv4).unwrap();
    listener.bind(localhost()).await.unwrap();
    let mut incoming = listener.listen().unwrap();
    assert!(listener.is_listening());
    let addr = listener.local_address().unwrap();
    assert_ne!(addr.port(), 0);

    let mut client = ctx.create_tcp_socket(IpAddressFamily::Ipv4).unwrap();
    client.connect(addr).await.unwrap();
    assert_eq!(client.remote_address().unwrap(), addr);

    let mut server = incoming.read(1).await.unwrap().pop().unwrap();
    assert_eq!(server.local_address().unwrap(), addr);

    let (tx, rx) = stream();
    let sending = tokio::spawn(client.send(rx));
    tx.write(b"hello, ".to_vec()).await.unwrap();
    tx.write(b"world".to_vec()).await.unwrap();
    drop(tx);
    sending.await.unwrap().unwrap();

    let (mut data, done) = server.receive().unwrap();
    assert_eq!(data.read_all().await, b"hello, world");
    assert_eq!(done.read().await, Some(Ok(())));

    // Only one receive per connection.
    assert_eq!(server.receive().err(), Some(ErrorCode::InvalidState));
}

#[test_log::test(tokio::test)]
async fn tcp_state_errors() {
    let ctx = networked();

    let socket = ctx.create_tcp_socket(IpAddressFamily::Ipv4).unwrap();
    let (_tx, rx) = stream();
    assert_eq!(socket.send(rx).await, Err(ErrorCode::InvalidState));

    let mut socket = ctx.create_tcp_socket(IpAddressFamily::Ipv4).unwrap();
    assert_eq!(
        socket.bind("[::1]:0".parse().unwrap()).await,
        Err(ErrorCode::InvalidArgument)
    );
    assert_eq!(
        socket.set_listen_backlog_size(0),
        Err(ErrorCode::InvalidArgument)
    );
    assert_eq!(socket.listen().err(), Some(ErrorCode::InvalidState));

    socket.bind(localhost()).await.unwrap();
    assert_eq!(
        socket.bind(localhost()).await,
        Err(ErrorCode::InvalidState)
    );
    let _incoming = socket.listen().unwrap();
    assert_eq!(
        socket.set_listen_backlog_size(10),
        Err(ErrorCode::InvalidState)
    );
}

#[test_log::test(tokio::test)]
async fn tcp_connect_refused_closes_the_socket() {
    let ctx = networked();

    // Grab a free port, then release it so nothing listens there.
    let addr = {
        let mut scratch = ctx.create_tcp_socket(IpAddressFamily::Ipv4).unwrap();
        scratch.bind(localhost()).await.unwrap();
        scratch.local_address().unwrap()
    };

    let mut client = ctx.create_tcp_socket(IpAddressFamily::Ipv4).unwrap();
    assert_eq!(
        client.connect(addr).await,
        Err(ErrorCode::ConnectionRefused)
    );
    assert_eq!(client.connect(addr).await, Err(ErrorCode::InvalidState));
}

#[test_log::test(tokio::test)]
async fn udp_peers() {
    let ctx = networked();

    let mut a = ctx.create_udp_socket(IpAddressFamily::Ipv4).unwrap();
    let mut b = ctx.create_udp_socket(IpAddressFamily::Ipv4).unwrap();
    let mut c = ctx.create_udp_socket(IpAddressFamily::Ipv4).unwrap();
    a.bind(localhost()).await.unwrap();
    b.bind(localhost()).await.unwrap();
    c.bind(localhost()).await.unwrap();
    let a_addr = a.local_address().unwrap();
    let b_addr = b.local_address().unwrap();
    let c_addr = c.local_address().unwrap();

    a.connect(b_addr).await.unwrap();
    assert_eq!(
        a.send(b"x".to_vec(), Some(c_addr)).await,
        Err(ErrorCode::InvalidArgument)
    );
    a.send(b"ping".to_vec(), None).await.unwrap();
    assert_eq!(b.receive().await.unwrap(), (b"ping".to_vec(), a_addr));

    b.send(b"pong".to_vec(), Some(a_addr)).await.unwrap();
    assert_eq!(a.receive().await.unwrap(), (b"pong".to_vec(), b_addr));

    a.disconnect().unwrap();
    assert_eq!(
        a.send(b"x".to_vec(), None).await,
        Err(ErrorCode::InvalidArgument)
    );
    assert_eq!(a.disconnect(), Err(ErrorCode::InvalidState));
}

#[test_log::test(tokio::test)]
async fn denied_network() {
    let ctx = WasiCtxBuilder::new().build();
    let mut socket = ctx.create_tcp_socket(IpAddressFamily::Ipv4).unwrap();
    assert_eq!(
        socket.bind(localhost()).await,
        Err(ErrorCode::AccessDenied)
    );

    let ctx = WasiCtxBuilder::new()
        .inherit_network()
        .allow_tcp(false)
        .build();
    assert_eq!(
        ctx.create_tcp_socket(IpAddressFamily::Ipv4).err(),
        Some(ErrorCode::AccessDenied)
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn tcp_handles() {
    let mut ctx = networked();
    let mut table = ResourceTable::new();
    let mut view = WasiCtxView {
        ctx: &mut ctx,
        table: &mut table,
    };

    let network = view.instance_network().unwrap();
    let listener = view.create_tcp_socket(IpAddressFamily::Ipv4).unwrap();
    let local = IpSocketAddress::from(localhost());

    assert_eq!(
        code(view.finish_bind(listener.borrowed())),
        ErrorCode::NotInProgress
    );
    view.start_bind(listener.borrowed(), network.borrowed(), local)
        .await
        .unwrap();
    view.finish_bind(listener.borrowed()).unwrap();
    view.start_listen(listener.borrowed()).unwrap();
    view.finish_listen(listener.borrowed()).unwrap();
    assert!(view.is_listening(listener.borrowed()).unwrap());
    assert_eq!(
        code(view.accept(listener.borrowed())),
        ErrorCode::WouldBlock
    );
    let addr = view.local_address(listener.borrowed()).unwrap();

    let client = view.create_tcp_socket(IpAddressFamily::Ipv4).unwrap();
    view.start_connect(client.borrowed(), network.borrowed(), addr)
        .await
        .unwrap();
    let ready = HostTcpSocket::subscribe(&mut view, client.borrowed()).unwrap();
    poll::block(view.table, &ready).await.unwrap();
    poll::delete(view.table, ready).unwrap();
    let (client_in, client_out) = view.finish_connect(client.borrowed()).unwrap();

    let ready = HostTcpSocket::subscribe(&mut view, listener.borrowed()).unwrap();
    poll::block(view.table, &ready).await.unwrap();
    poll::delete(view.table, ready).unwrap();
    let (server, server_in, server_out) = view.accept(listener.borrowed()).unwrap();
    assert_eq!(
        view.remote_address(server.borrowed()).unwrap(),
        view.local_address(client.borrowed()).unwrap()
    );

    let mut io = IoImpl(&mut view);
    io.blocking_write_and_flush(client_out.borrowed(), b"over p2".to_vec())
        .await
        .unwrap();
    let mut received = Vec::new();
    while received.len() < 7 {
        let bytes = io.blocking_read(server_in.borrowed(), 64).await.unwrap();
        received.extend(bytes);
    }
    assert_eq!(received, b"over p2");

    HostInputStream::drop(&mut io, client_in).await.unwrap();
    HostOutputStream::drop(&mut io, client_out).await.unwrap();
    HostInputStream::drop(&mut io, server_in).await.unwrap();
    HostOutputStream::drop(&mut io, server_out).await.unwrap();

    HostTcpSocket::drop(&mut view, server).unwrap();
    HostTcpSocket::drop(&mut view, client).unwrap();
    HostTcpSocket::drop(&mut view, listener).unwrap();
    preview_shim::bindings::wasi::sockets::network::HostNetwork::drop(&mut view, network)
        .unwrap();
    assert!(table.is_empty());
}
