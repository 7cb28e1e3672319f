//! Byte-stream view: channels spliced with ordinary async I/O.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use wiremux::{ChannelStream, MemTransport, MuxConfig, MuxSession};

#[tokio::test]
async fn bytes_flow_end_to_end_with_shutdown_as_eof() {
    let (ta, tb) = MemTransport::pair();
    let (a, _incoming_a) = MuxSession::new(ta, MuxConfig::default());
    let (b, mut incoming_b) = MuxSession::new(tb, MuxConfig::default());
    tokio::spawn(a.clone().run());
    tokio::spawn(b.clone().run());

    let ch_a = a.create_channel().await.expect("create");
    let mut writer = ChannelStream::new(ch_a);

    writer.write_all(b"hello ").await.expect("write");
    writer.write_all(b"stream").await.expect("write");
    writer.shutdown().await.expect("shutdown");

    let ch_b = timeout(Duration::from_secs(2), incoming_b.next())
        .await
        .expect("timed out")
        .expect("incoming");
    let mut reader = ChannelStream::new(ch_b);

    // Message boundaries vanish; read_to_end sees one byte stream ended by
    // the writer's shutdown.
    let mut received = Vec::new();
    timeout(Duration::from_secs(2), reader.read_to_end(&mut received))
        .await
        .expect("timed out")
        .expect("read");
    assert_eq!(received, b"hello stream");
}

#[tokio::test]
async fn shutdown_leaves_the_read_side_open() {
    let (ta, tb) = MemTransport::pair();
    let (a, _incoming_a) = MuxSession::new(ta, MuxConfig::default());
    let (b, mut incoming_b) = MuxSession::new(tb, MuxConfig::default());
    tokio::spawn(a.clone().run());
    tokio::spawn(b.clone().run());

    let ch_a = a.create_channel().await.expect("create");
    let mut stream_a = ChannelStream::new(ch_a);
    stream_a.write_all(b"request").await.expect("write");
    stream_a.shutdown().await.expect("shutdown");

    let ch_b = incoming_b.next().await.expect("incoming");
    let mut stream_b = ChannelStream::new(ch_b);
    let mut request = Vec::new();
    stream_b
        .read_to_end(&mut request)
        .await
        .expect("read request");
    assert_eq!(request, b"request");

    // The response direction still works after the request-side EOF.
    stream_b.write_all(b"response").await.expect("write");
    stream_b.shutdown().await.expect("shutdown");

    let mut response = Vec::new();
    timeout(Duration::from_secs(2), stream_a.read_to_end(&mut response))
        .await
        .expect("timed out")
        .expect("read response");
    assert_eq!(response, b"response");
}

#[tokio::test]
async fn write_after_shutdown_is_broken_pipe() {
    let (ta, tb) = MemTransport::pair();
    let (a, _incoming_a) = MuxSession::new(ta, MuxConfig::default());
    let (b, _incoming_b) = MuxSession::new(tb, MuxConfig::default());
    tokio::spawn(a.clone().run());
    tokio::spawn(b.clone().run());

    let ch = a.create_channel().await.expect("create");
    let mut stream = ChannelStream::new(ch);
    stream.shutdown().await.expect("shutdown");
    let err = stream.write_all(b"late").await.expect_err("must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn splices_with_copy_bidirectional() {
    let (ta, tb) = MemTransport::pair();
    let (a, _incoming_a) = MuxSession::new(ta, MuxConfig::default());
    let (b, mut incoming_b) = MuxSession::new(tb, MuxConfig::default());
    tokio::spawn(a.clone().run());
    tokio::spawn(b.clone().run());

    // Session b echoes its side of the channel back through an in-process
    // duplex pipe, the way a proxy splices a channel onto a socket.
    let echo = tokio::spawn(async move {
        let ch = incoming_b.next().await.expect("incoming");
        let mut stream = ChannelStream::new(ch);
        let (mut pipe, mut far) = tokio::io::duplex(4096);
        let far_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let n = far.read(&mut buf).await.expect("pipe read");
                if n == 0 {
                    break;
                }
                far.write_all(&buf[..n]).await.expect("pipe write");
            }
            far.shutdown().await.expect("pipe shutdown");
        });
        tokio::io::copy_bidirectional(&mut stream, &mut pipe)
            .await
            .expect("splice");
        far_task.await.expect("join");
    });

    let ch = a.create_channel().await.expect("create");
    ch.send(Bytes::from_static(b"echo me")).await.expect("send");
    ch.half_close().await.expect("half close");

    let mut echoed = Vec::new();
    loop {
        match timeout(Duration::from_secs(2), ch.receive())
            .await
            .expect("timed out")
            .expect("receive")
        {
            Some(payload) => echoed.extend_from_slice(&payload),
            None => break,
        }
    }
    assert_eq!(echoed, b"echo me");
    echo.await.expect("join");
}
