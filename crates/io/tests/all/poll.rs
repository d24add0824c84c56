use super::{Ctx, resolves_immediately};
use preview_shim_io::bindings::wasi::io::poll::{Host, HostPollable};
use preview_shim_io::bindings::wasi::io::streams::HostInputStream;
use preview_shim_io::p3;
use preview_shim_io::pipe::{AsyncReadStream, MemoryInputPipe};
use preview_shim_io::{DynInputStream, subscribe};

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn poll_does_not_wait_for_slow_members() {
    let mut ctx = Ctx::new();
    let fast = ctx
        .table
        .push(Box::new(MemoryInputPipe::new("now")) as DynInputStream)
        .unwrap();
    // Keep the writing half alive so the slow stream never becomes ready.
    let (_feed, source) = tokio::io::duplex(16);
    let slow = ctx
        .table
        .push(Box::new(AsyncReadStream::new(source)) as DynInputStream)
        .unwrap();
    let mut host = ctx.host();

    let p1 = HostInputStream::subscribe(&mut host, fast.borrowed()).unwrap();
    let p2 = HostInputStream::subscribe(&mut host, slow.borrowed()).unwrap();
    let ready = resolves_immediately(host.poll(vec![p1.borrowed(), p2.borrowed()]))
        .await
        .unwrap();
    assert_eq!(ready, [0]);

    assert!(host.ready(p1.borrowed()).await.unwrap());
    assert!(!host.ready(p2.borrowed()).await.unwrap());
    HostPollable::drop(&mut host, p1).unwrap();
    HostPollable::drop(&mut host, p2).unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn pollable_outlives_its_stream_once_ready() {
    let mut ctx = Ctx::new();
    let s = ctx
        .table
        .push(Box::new(MemoryInputPipe::new("x")) as DynInputStream)
        .unwrap();
    let mut host = ctx.host();
    let p = HostInputStream::subscribe(&mut host, s.borrowed()).unwrap();
    host.block(p.borrowed()).await.unwrap();

    HostInputStream::drop(&mut host, s).await.unwrap();
    assert!(host.ready(p.borrowed()).await.unwrap());
    host.block(p.borrowed()).await.unwrap();

    let rep = p.rep();
    HostPollable::drop(&mut host, p).unwrap();
    // A second drop of the same handle is a no-op.
    HostPollable::drop(&mut host, preview_shim_io::Resource::new_own(rep)).unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn p3_readers_are_pollables() {
    let mut ctx = Ctx::new();
    let (tx, rx) = p3::stream::<u8>();
    let (mut done, done_rx) = p3::future::<()>();
    let rx = ctx.table.push(rx).unwrap();
    let done_rx = ctx.table.push(done_rx).unwrap();
    let p_stream = subscribe(&mut ctx.table, rx.borrowed()).unwrap();
    let p_done = subscribe(&mut ctx.table, done_rx.borrowed()).unwrap();
    let mut host = ctx.host();

    assert!(!host.ready(p_stream.borrowed()).await.unwrap());
    tx.write(vec![1]).await.unwrap();
    let ready = resolves_immediately(host.poll(vec![p_done.borrowed(), p_stream.borrowed()]))
        .await
        .unwrap();
    assert_eq!(ready, [1]);

    done.write(());
    assert!(host.ready(p_done.borrowed()).await.unwrap());
}
