//! Frame codec tests over a real TCP loopback connection.

use portway_proto::{read_frame, write_frame, Frame, FrameType, MAX_FRAME_SIZE};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn tcp_roundtrip_preserves_type_and_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let frame = read_frame(&mut socket).await.unwrap();
        write_frame(&mut socket, FrameType::Response, &frame.payload)
            .await
            .unwrap();
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let payload: Vec<u8> = (0..=255).collect();
    write_frame(&mut client, FrameType::Request, &payload)
        .await
        .unwrap();

    let echoed = read_frame(&mut client).await.unwrap();
    assert_eq!(echoed.frame_type, FrameType::Response);
    assert_eq!(echoed.payload, payload);

    server.await.unwrap();
}

#[tokio::test]
async fn interleaved_frames_decode_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let frame = read_frame(&mut socket).await.unwrap();
            seen.push(frame);
        }
        seen
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut client, FrameType::Ping, &[]).await.unwrap();
    write_frame(&mut client, FrameType::Request, b"first")
        .await
        .unwrap();
    write_frame(&mut client, FrameType::Request, b"second")
        .await
        .unwrap();

    let seen = server.await.unwrap();
    assert_eq!(seen[0], Frame::ping());
    assert_eq!(seen[1].payload, b"first");
    assert_eq!(seen[2].payload, b"second");
}

#[tokio::test]
async fn max_size_payload_roundtrips() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_frame(&mut socket).await.unwrap()
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let payload = vec![0xA5u8; MAX_FRAME_SIZE];
    write_frame(&mut client, FrameType::Request, &payload)
        .await
        .unwrap();

    let frame = server.await.unwrap();
    assert_eq!(frame.payload.len(), MAX_FRAME_SIZE);
}

#[tokio::test]
async fn abrupt_close_mid_payload_is_short_read() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_frame(&mut socket).await
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    // Header promises 64 bytes; deliver 10 and disconnect.
    let header = portway_proto::FrameHeader::new(FrameType::Request, 64).encode();
    client.write_all(&header).await.unwrap();
    client.write_all(&[0u8; 10]).await.unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    let result = server.await.unwrap();
    assert!(matches!(
        result,
        Err(portway_proto::FrameError::ShortRead("payload"))
    ));
}
