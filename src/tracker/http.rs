//! The HTTP/HTTPS tracker protocol (BEP 3).

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use url::Url;

use crate::error::{Error, Result};

use super::{AnnounceParams, AnnounceResponse};

/// Bytes that must be percent-encoded in a query string component, beyond
/// what `CONTROLS` already covers: anything that isn't alphanumeric or one of
/// the handful of characters URL query values are allowed to contain
/// unescaped. Binary info hashes and peer ids are not ASCII, so almost every
/// byte ends up encoded; this just avoids double-encoding an already-safe
/// subset.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'/')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@');

pub(super) async fn announce(
    url: &Url,
    params: AnnounceParams,
) -> Result<AnnounceResponse> {
    let info_hash = percent_encode(&params.info_hash, QUERY_VALUE).to_string();
    let peer_id = percent_encode(&params.peer_id, QUERY_VALUE).to_string();

    // info_hash and peer_id need to be percent-encoded ourselves (as they're
    // arbitrary binary data reqwest's query serializer would otherwise
    // mangle), so the query string is built by hand and the other
    // parameters are appended to it.
    let mut full_url = url.clone();
    full_url.set_query(Some(&format!(
        "info_hash={}&peer_id={}",
        info_hash, peer_id
    )));
    {
        let mut query_pairs = full_url.query_pairs_mut();
        query_pairs
            .append_pair("port", &params.port.to_string())
            .append_pair("uploaded", &params.uploaded.to_string())
            .append_pair("downloaded", &params.downloaded.to_string())
            .append_pair("left", &params.left.to_string());
    }

    log::debug!("announcing to tracker {}", full_url);

    let resp = reqwest::get(full_url).await?;
    let body = resp.bytes().await?;
    let resp: RawAnnounceResponse = serde_bencode::from_bytes(&body)?;

    if let Some(reason) = resp.failure_reason {
        return Err(Error::TrackerFailure(reason));
    }

    let peers = resp
        .peers
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| match p.ip.parse::<IpAddr>() {
            Ok(ip) => Some(SocketAddr::new(ip, p.port as u16)),
            Err(_) => {
                log::warn!("tracker returned unparseable peer ip {:?}", p.ip);
                None
            }
        })
        .collect();

    Ok(AnnounceResponse {
        interval: resp.interval.map(|secs| Duration::from_secs(secs as u64)),
        peers,
    })
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    #[serde(default)]
    peers: Option<Vec<RawPeer>>,
}

/// One entry of the non-compact `peers` list: a dictionary per peer, as
/// returned by trackers that don't compact-encode their peer list.
#[derive(Debug, Deserialize)]
struct RawPeer {
    #[serde(rename = "peer id", default)]
    #[allow(dead_code)]
    id: Option<ByteBuf>,
    ip: String,
    port: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerId;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [1; 20],
            peer_id: [2; 20] as PeerId,
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
        }
    }

    #[tokio::test]
    async fn test_announce_parses_peer_dict_list() {
        let mut server = mockito::Server::new_async().await;
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peersl");
        body.extend_from_slice(
            b"d7:peer id20:aaaaaaaaaaaaaaaaaaaa2:ip9:127.0.0.14:porti6881ee",
        );
        body.extend_from_slice(
            b"d7:peer id20:bbbbbbbbbbbbbbbbbbbb2:ip8:10.0.0.24:porti6882ee",
        );
        body.extend_from_slice(b"ee");

        let mock = server
            .mock("GET", mockito::Matcher::Regex(".*".into()))
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let url = Url::parse(&server.url()).unwrap();
        let resp = announce(&url, params()).await.unwrap();
        mock.assert_async().await;

        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(resp.peers[0].port(), 6881);
        assert_eq!(resp.peers[1].port(), 6882);
    }

    #[tokio::test]
    async fn test_announce_propagates_failure_reason() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Regex(".*".into()))
            .with_status(200)
            .with_body(b"d14:failure reason18:torrent not found".to_vec())
            .create_async()
            .await;

        let url = Url::parse(&server.url()).unwrap();
        let result = announce(&url, params()).await;
        mock.assert_async().await;
        assert!(matches!(result, Err(Error::TrackerFailure(_))));
    }
}
