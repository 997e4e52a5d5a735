//! End-to-end scenarios that exercise the public API across the seeder
//! listener, the tracker client and a real downloader, over loopback TCP.

use std::{net::TcpListener as StdTcpListener, time::Duration};

use sha1::{Digest, Sha1};
use tempfile::tempdir;
use tokio::time::sleep;

use torrentcore::{conf::Conf, engine::Engine, metainfo::MetainfoParser, Bitfield};

/// Picks a currently-free TCP port by binding to port 0 and releasing it
/// immediately. There's an inherent race between releasing the port here and
/// the engine binding to it later, but it's the same trick used throughout
/// the ecosystem for this kind of test and collisions are rare in practice.
fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Builds a single-file metainfo's raw bencode bytes by hand, the way the
/// crate's own unit tests do, with a caller-supplied announce URL and
/// content so the test can point it at a mock tracker.
fn bencode_single_file(announce: &str, name: &str, piece_len: u64, pieces: &[u8], length: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"d8:announce");
    out.extend_from_slice(announce.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(announce.as_bytes());
    out.extend_from_slice(b"4:infod6:lengthi");
    out.extend_from_slice(length.to_string().as_bytes());
    out.extend_from_slice(b"e4:name");
    out.extend_from_slice(name.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b"12:piece lengthi");
    out.extend_from_slice(piece_len.to_string().as_bytes());
    out.extend_from_slice(b"e6:pieces");
    out.extend_from_slice(pieces.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(pieces);
    out.extend_from_slice(b"ee");
    out
}

/// The tracker's announce response: a single peer dict pointing at `addr`.
fn bencode_announce_response(ip: &str, port: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"d8:intervali1800e5:peersl");
    body.extend_from_slice(b"d7:peer id20:aaaaaaaaaaaaaaaaaaaa2:ip");
    body.extend_from_slice(ip.len().to_string().as_bytes());
    body.push(b':');
    body.extend_from_slice(ip.as_bytes());
    body.extend_from_slice(b"4:porti");
    body.extend_from_slice(port.to_string().as_bytes());
    body.extend_from_slice(b"ee");
    body.extend_from_slice(b"ee");
    body
}

/// Drives a real seeder engine and a real downloader engine, connected over
/// loopback TCP with a mock HTTP tracker standing in for peer discovery, and
/// asserts the downloader ends up with the exact bytes the seeder started
/// with. This is the single-file round trip: four bytes per piece, with a
/// shorter last piece.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_file_download_round_trips_exact_bytes() {
    let content = b"ABCDEFG";
    let name = "e2e.bin";

    let piece_hashes: Vec<u8> = content
        .chunks(4)
        .flat_map(|chunk| Sha1::digest(chunk).to_vec())
        .collect();

    let mut tracker = mockito::Server::new_async().await;
    let announce_url = format!("{}/announce", tracker.url());

    let metainfo_bytes =
        bencode_single_file(&announce_url, name, 4, &piece_hashes, content.len() as u64);
    let metainfo = MetainfoParser::parse(&metainfo_bytes).expect("valid metainfo");
    assert_eq!(metainfo.piece_count(), 2);

    let seeder_dir = tempdir().expect("seeder dir");
    std::fs::write(seeder_dir.path().join(name), content).expect("seed content");

    let seeder_port = free_port();
    let mut seeder_conf = Conf::new(seeder_dir.path());
    seeder_conf.engine.listen_port = seeder_port;
    let seeder = Engine::new(seeder_conf).expect("seeder engine");

    let mut seeder_bitfield = Bitfield::new(metainfo.piece_count());
    for index in 0..metainfo.piece_count() {
        seeder_bitfield.set(index);
    }
    seeder
        .add_torrent(metainfo.clone(), seeder_bitfield)
        .await
        .expect("seeder add_torrent");

    tokio::spawn(async move {
        let _ = seeder.run_seeder_listener().await;
    });

    let mock = tracker
        .mock("GET", mockito::Matcher::Regex(".*".into()))
        .with_status(200)
        .with_body(bencode_announce_response("127.0.0.1", seeder_port))
        .create_async()
        .await;

    let downloader_dir = tempdir().expect("downloader dir");
    let downloader_conf = Conf::new(downloader_dir.path());
    let downloader = Engine::new(downloader_conf).expect("downloader engine");

    downloader
        .add_torrent(metainfo.clone(), Bitfield::new(metainfo.piece_count()))
        .await
        .expect("downloader add_torrent");

    let downloaded_path = downloader_dir.path().join(name);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(bytes) = std::fs::read(&downloaded_path) {
            if bytes == content {
                break;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("download did not complete in time");
        }
        sleep(Duration::from_millis(20)).await;
    }

    mock.assert_async().await;
}
