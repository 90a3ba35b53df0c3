use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tftp::protocol::{BLOCK_SIZE, Mode, Packet};
use tftp::{Error, client};
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Start the real server on an OS-assigned port, serving `root`.
async fn start_server(root: PathBuf) -> (SocketAddr, watch::Sender<bool>) {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    drop(sock);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        // A bound port is reserved above so the caller gets a stable
        // address back before the server task has actually started.
        let _ = tftp::server::run(addr.port(), root, shutdown_rx).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, shutdown_tx)
}

#[tokio::test]
async fn get_downloads_an_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let content = b"Hello, TFTP world! This is a download test.";
    tokio::fs::write(dir.path().join("test.txt"), content)
        .await
        .unwrap();

    let (server_addr, shutdown) = start_server(dir.path().to_path_buf()).await;
    let out = dir.path().join("downloaded.txt");

    client::get(server_addr, "test.txt", &out).await.unwrap();

    assert_eq!(tokio::fs::read(&out).await.unwrap(), content);
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn put_uploads_a_new_file() {
    let dir = tempfile::tempdir().unwrap();
    let content = b"This file was uploaded via TFTP WRQ.";
    let local = dir.path().join("to_upload.txt");
    tokio::fs::write(&local, content).await.unwrap();

    tokio::fs::create_dir_all(dir.path().join("served"))
        .await
        .unwrap();
    let (server_addr, shutdown) = start_server(dir.path().join("served")).await;

    client::put(server_addr, &local, "uploaded.txt").await.unwrap();

    let written = tokio::fs::read(dir.path().join("served/uploaded.txt"))
        .await
        .unwrap();
    assert_eq!(written, content);
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn get_of_a_missing_file_surfaces_remote_error_one() {
    let dir = tempfile::tempdir().unwrap();
    let (server_addr, shutdown) = start_server(dir.path().to_path_buf()).await;

    let out = dir.path().join("wont-exist.txt");
    let err = client::get(server_addr, "nope.txt", &out).await.unwrap_err();

    assert!(matches!(err, Error::RemoteError { code: 1, .. }));
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn get_from_a_served_subdirectory() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("configs/switches");
    tokio::fs::create_dir_all(&sub).await.unwrap();
    let content = b"switch config data here";
    tokio::fs::write(sub.join("sw1.cfg"), content).await.unwrap();

    let (server_addr, shutdown) = start_server(dir.path().to_path_buf()).await;
    let out = dir.path().join("sw1-copy.cfg");

    client::get(server_addr, "configs/switches/sw1.cfg", &out)
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&out).await.unwrap(), content);
    let _ = shutdown.send(true);
}

/// A datagram from an address other than the established peer gets
/// ERROR(5) back, and the real transfer is otherwise undisturbed.
#[tokio::test]
async fn foreign_tid_gets_error_five_and_does_not_disrupt_the_transfer() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("short.bin"), b"short file, one block")
        .await
        .unwrap();
    let (server_addr, shutdown) = start_server(dir.path().to_path_buf()).await;

    let client_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = Packet::ReadRequest {
        filename: "short.bin".into(),
        mode: Mode::Octet,
    };
    client_sock
        .send_to(&request.encode(), server_addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 516];
    let (n, transfer_addr) = tokio::time::timeout(Duration::from_secs(5), client_sock.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let data = Packet::parse(&buf[..n]).unwrap();
    assert!(matches!(data, Packet::Data { block_num: 1, .. }));

    // An impostor sends a datagram to the transfer socket from a
    // different address entirely.
    let impostor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    impostor
        .send_to(&Packet::Ack { block_num: 1 }.encode(), transfer_addr)
        .await
        .unwrap();

    let (n, _) = tokio::time::timeout(Duration::from_secs(5), impostor.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = Packet::parse(&buf[..n]).unwrap();
    assert!(matches!(reply, Packet::Error { code: 5, .. }));

    // The real client's transfer still completes normally.
    client_sock
        .send_to(&Packet::Ack { block_num: 1 }.encode(), transfer_addr)
        .await
        .unwrap();

    let _ = shutdown.send(true);
}

/// A duplicate DATA for the block just committed is re-acknowledged
/// without being appended twice. Block 1 must be a full (non-final)
/// block so the Receiver is genuinely parked awaiting block 2 — and
/// still listening — when the duplicate of block 1 arrives.
#[tokio::test]
async fn duplicate_data_block_is_acked_without_double_write() {
    let dir = tempfile::tempdir().unwrap();
    let (server_addr, shutdown) = start_server(dir.path().to_path_buf()).await;

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = Packet::WriteRequest {
        filename: "dup.bin".into(),
        mode: Mode::Octet,
    };
    sock.send_to(&request.encode(), server_addr).await.unwrap();

    let mut buf = vec![0u8; 516];
    let (n, transfer_addr) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        Packet::parse(&buf[..n]).unwrap(),
        Packet::Ack { block_num: 0 }
    ));

    let block1_payload = vec![0x5Au8; BLOCK_SIZE];
    let block1 = Packet::Data {
        block_num: 1,
        payload: block1_payload.clone(),
    };
    // Send block 1 twice before letting the transfer move on to block 2.
    for _ in 0..2 {
        sock.send_to(&block1.encode(), transfer_addr).await.unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Packet::parse(&buf[..n]).unwrap(),
            Packet::Ack { block_num: 1 }
        ));
    }

    let block2 = Packet::Data {
        block_num: 2,
        payload: b"final short block".to_vec(),
    };
    sock.send_to(&block2.encode(), transfer_addr).await.unwrap();
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        Packet::parse(&buf[..n]).unwrap(),
        Packet::Ack { block_num: 2 }
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let written = tokio::fs::read(dir.path().join("dup.bin")).await.unwrap();
    let mut expected = block1_payload;
    expected.extend_from_slice(b"final short block");
    assert_eq!(written, expected);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn put_creates_missing_subdirectories() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("payload.bin");
    let content = b"uploaded into a new subdirectory";
    tokio::fs::write(&local, content).await.unwrap();

    tokio::fs::create_dir_all(dir.path().join("served"))
        .await
        .unwrap();
    let (server_addr, shutdown) = start_server(dir.path().join("served")).await;

    client::put(server_addr, &local, "new_dir/sub/uploaded.txt")
        .await
        .unwrap();

    let written = tokio::fs::read(dir.path().join("served/new_dir/sub/uploaded.txt"))
        .await
        .unwrap();
    assert_eq!(written, content);
    let _ = shutdown.send(true);
}
