use preview_shim_io::p3::{self, ChannelError};

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn hi_round_trip() {
    let (tx, mut rx) = p3::stream::<u8>();
    let writer = tokio::spawn(async move {
        tx.write(vec![0x68, 0x69]).await.unwrap();
        tx.close();
    });
    assert_eq!(rx.read_all().await, [0x68, 0x69]);
    assert_eq!(rx.read(1).await, None);
    writer.await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn replaced_reader_rejects_old_writer() {
    // An installer swapping one sink for another drops the old reader.
    let mut installed = None;
    let (old_tx, old_rx) = p3::stream::<u8>();
    installed.replace(old_rx);
    old_tx.write(b"first".to_vec()).await.unwrap();

    let (new_tx, new_rx) = p3::stream::<u8>();
    drop(installed.replace(new_rx));

    assert!(old_tx.is_closed());
    assert_eq!(old_tx.write(b"late".to_vec()).await, Err(ChannelError::Closed));
    new_tx.write(b"second".to_vec()).await.unwrap();
    drop(new_tx);

    let mut rx = installed.take().unwrap();
    assert_eq!(rx.read_all().await, b"second");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn future_carries_a_result_once() {
    let (mut tx, rx) = p3::future::<Result<u16, String>>();
    let producer = preview_shim_io::runtime::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(tx.write(Ok(200)));
        assert!(!tx.write(Err("again".to_string())));
    });
    let rx = rx.with_producer(producer);
    assert_eq!(rx.read().await, Some(Ok(200)));
}
