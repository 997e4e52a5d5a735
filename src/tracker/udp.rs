//! The UDP tracker protocol (BEP 15).

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use rand::Rng;
use tokio::net::UdpSocket;
use url::Url;

use crate::error::{Error, Result};

use super::{AnnounceParams, AnnounceResponse};

/// The magic constant that must open every connect request (BEP 15).
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// Event field of an announce: we never report started/stopped/completed
/// ourselves (that bookkeeping isn't part of this engine's responsibilities),
/// so this is always `none`.
const EVENT_NONE: u32 = 0;

const UDP_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) async fn announce(
    url: &Url,
    params: AnnounceParams,
) -> Result<AnnounceResponse> {
    let host = url.host_str().ok_or_else(|| {
        Error::TrackerFailure("udp tracker url has no host".into())
    })?;
    let port = url.port().ok_or_else(|| {
        Error::TrackerFailure("udp tracker url has no port".into())
    })?;
    let remote: SocketAddr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            Error::TrackerFailure("could not resolve udp tracker host".into())
        })?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(remote).await?;

    let connection_id = connect(&socket).await?;
    do_announce(&socket, connection_id, params).await
}

async fn connect(socket: &UdpSocket) -> Result<u64> {
    let transaction_id = rand::thread_rng().gen();
    let mut req = Vec::with_capacity(16);
    req.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    req.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    req.extend_from_slice(&transaction_id.to_be_bytes());

    tokio::time::timeout(UDP_TIMEOUT, socket.send(&req)).await??;

    let mut buf = [0; 16];
    tokio::time::timeout(UDP_TIMEOUT, socket.recv(&mut buf)).await??;

    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let resp_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let connection_id = u64::from_be_bytes(buf[8..16].try_into().unwrap());

    if resp_transaction_id != transaction_id {
        return Err(Error::TrackerFailure(
            "udp tracker connect transaction id mismatch".into(),
        ));
    }
    if action != ACTION_CONNECT {
        return Err(Error::TrackerFailure(
            "udp tracker connect action mismatch".into(),
        ));
    }

    Ok(connection_id)
}

async fn do_announce(
    socket: &UdpSocket,
    connection_id: u64,
    params: AnnounceParams,
) -> Result<AnnounceResponse> {
    let transaction_id: u32 = rand::thread_rng().gen();

    let mut req = Vec::with_capacity(98);
    req.extend_from_slice(&connection_id.to_be_bytes());
    req.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    req.extend_from_slice(&transaction_id.to_be_bytes());
    req.extend_from_slice(&params.info_hash);
    req.extend_from_slice(&params.peer_id);
    req.extend_from_slice(&params.downloaded.to_be_bytes());
    req.extend_from_slice(&params.left.to_be_bytes());
    req.extend_from_slice(&params.uploaded.to_be_bytes());
    req.extend_from_slice(&EVENT_NONE.to_be_bytes());
    req.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
    req.extend_from_slice(&0u32.to_be_bytes()); // key
    req.extend_from_slice(&(-1i32).to_be_bytes()); // num_want: let tracker decide
    req.extend_from_slice(&params.port.to_be_bytes());
    debug_assert_eq!(req.len(), 98);

    tokio::time::timeout(UDP_TIMEOUT, socket.send(&req)).await??;

    let mut buf = [0; 65536];
    let read = tokio::time::timeout(UDP_TIMEOUT, socket.recv(&mut buf)).await??;
    let buf = &buf[..read];

    if buf.len() < 20 {
        return Err(Error::TrackerFailure(
            "udp tracker announce response too short".into(),
        ));
    }

    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let resp_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap());

    if resp_transaction_id != transaction_id {
        return Err(Error::TrackerFailure(
            "udp tracker announce transaction id mismatch".into(),
        ));
    }
    if action != ACTION_ANNOUNCE {
        return Err(Error::TrackerFailure(
            "udp tracker announce action mismatch".into(),
        ));
    }

    let peers_buf = &buf[20..];
    if peers_buf.len() % 6 != 0 {
        return Err(Error::TrackerFailure(
            "udp tracker announce peers field malformed".into(),
        ));
    }
    let peers = peers_buf
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect();

    Ok(AnnounceResponse {
        interval: Some(Duration::from_secs(interval as u64)),
        peers,
    })
}
