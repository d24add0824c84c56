use super::{Ctx, resolves_immediately};
use preview_shim_io::bindings::wasi::io::streams::{self, HostInputStream, HostOutputStream};
use preview_shim_io::bindings::wasi::io::error::HostError;
use preview_shim_io::pipe::{AsyncReadStream, MemoryInputPipe, MemoryOutputPipe};
use preview_shim_io::{
    AsyncWriteStream, DynInputStream, DynOutputStream, Resource, StreamError, TableError,
};

fn input(ctx: &mut Ctx, stream: impl preview_shim_io::InputStream) -> Resource<DynInputStream> {
    ctx.table.push(Box::new(stream) as DynInputStream).unwrap()
}

fn output(ctx: &mut Ctx, stream: impl preview_shim_io::OutputStream) -> Resource<DynOutputStream> {
    ctx.table.push(Box::new(stream) as DynOutputStream).unwrap()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn read_until_closed() {
    let mut ctx = Ctx::new();
    let s = input(&mut ctx, MemoryInputPipe::new("hello world"));
    let mut host = ctx.host();

    assert_eq!(host.read(s.borrowed(), 5).unwrap(), b"hello");
    assert_eq!(host.skip(s.borrowed(), 1).unwrap(), 1);
    assert_eq!(host.blocking_read(s.borrowed(), 64).await.unwrap(), b"world");
    assert!(matches!(host.read(s.borrowed(), 1), Err(StreamError::Closed)));
    HostInputStream::drop(&mut host, s).await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn blocking_write_and_flush_limits() {
    let mut ctx = Ctx::new();
    let pipe = MemoryOutputPipe::new(8192);
    let s = output(&mut ctx, pipe.clone());
    let mut host = ctx.host();

    host.blocking_write_and_flush(s.borrowed(), vec![b'a'; 4096])
        .await
        .unwrap();
    assert!(matches!(
        host.blocking_write_and_flush(s.borrowed(), vec![b'a'; 4097]).await,
        Err(StreamError::Trap(_))
    ));
    assert!(matches!(
        host.blocking_write_zeroes_and_flush(s.borrowed(), 4097).await,
        Err(StreamError::Trap(_))
    ));
    host.blocking_write_zeroes_and_flush(s.borrowed(), 4).await.unwrap();
    assert_eq!(pipe.contents().len(), 4100);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn write_past_permit_traps() {
    let mut ctx = Ctx::new();
    let s = output(&mut ctx, MemoryOutputPipe::new(3));
    let mut host = ctx.host();

    assert_eq!(host.check_write(s.borrowed()).unwrap(), 3);
    assert!(matches!(
        host.write(s.borrowed(), b"abcd".to_vec()),
        Err(StreamError::Trap(_))
    ));
    host.write(s.borrowed(), b"abc".to_vec()).unwrap();
    host.flush(s.borrowed()).unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn second_write_in_flight_traps() {
    let mut ctx = Ctx::new();
    // Nothing reads the other end, so the first write never drains.
    let (_peer, writer) = tokio::io::duplex(1);
    let s = output(&mut ctx, AsyncWriteStream::new(64, writer));
    let mut host = ctx.host();

    host.write(s.borrowed(), vec![1; 8]).unwrap();
    assert_eq!(host.check_write(s.borrowed()).unwrap(), 0);
    assert!(matches!(
        host.write(s.borrowed(), vec![2]),
        Err(StreamError::Trap(_))
    ));
    HostOutputStream::drop(&mut host, s).await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn splice_is_bounded_by_the_permit() {
    let mut ctx = Ctx::new();
    let src = input(&mut ctx, MemoryInputPipe::new("0123456789"));
    let pipe = MemoryOutputPipe::new(4);
    let dest = output(&mut ctx, pipe.clone());
    let mut host = ctx.host();

    assert_eq!(host.splice(dest.borrowed(), src.borrowed(), 100).unwrap(), 4);
    assert_eq!(pipe.contents(), "0123");
    assert_eq!(host.read(src.borrowed(), 100).unwrap(), b"456789");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn blocking_splice_between_adapters() {
    let mut ctx = Ctx::new();
    let (mut feed, source) = tokio::io::duplex(64);
    let (sink, mut drain) = tokio::io::duplex(64);
    let src = input(&mut ctx, AsyncReadStream::new(source));
    let dest = output(&mut ctx, AsyncWriteStream::new(1024, sink));
    let mut host = ctx.host();

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    feed.write_all(b"spliced").await.unwrap();
    let moved = resolves_immediately(host.blocking_splice(dest.borrowed(), src.borrowed(), 3))
        .await
        .unwrap();
    assert_eq!(moved, 3);
    let mut buf = [0; 3];
    drain.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"spl");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stream_errors_lower_to_guest_values() {
    let mut ctx = Ctx::new();
    let mut host = ctx.host();

    let closed = streams::Host::convert_stream_error(&mut host, StreamError::Closed).unwrap();
    assert_eq!(closed.tag(), "closed");

    let failed = streams::Host::convert_stream_error(
        &mut host,
        StreamError::LastOperationFailed(anyhow::anyhow!("disk on fire")),
    )
    .unwrap();
    assert_eq!(failed.tag(), "last-operation-failed");
    let streams::StreamError::LastOperationFailed(err) = failed else {
        unreachable!()
    };
    let debug = host.to_debug_string(err.borrowed()).unwrap();
    assert!(debug.contains("disk on fire"), "{debug}");
    HostError::drop(&mut host, err).unwrap();

    assert!(
        streams::Host::convert_stream_error(&mut host, StreamError::trap("bad guest")).is_err()
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn drop_is_idempotent_but_needs_ownership() {
    let mut ctx = Ctx::new();
    let s = input(&mut ctx, MemoryInputPipe::new("x"));
    let again = Resource::<DynInputStream>::new_own(s.rep());
    let mut host = ctx.host();

    let err = HostInputStream::drop(&mut host, s.borrowed()).await.unwrap_err();
    assert_eq!(err.downcast_ref::<TableError>(), Some(&TableError::NotOwned));

    HostInputStream::drop(&mut host, s).await.unwrap();
    HostInputStream::drop(&mut host, again).await.unwrap();
    assert!(ctx.table.is_empty());
}
