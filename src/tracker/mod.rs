//! Tracker announces: HTTP (BEP 3) and UDP (BEP 15), dispatched by URL
//! scheme.

mod http;
mod udp;

use std::{net::SocketAddr, time::Duration};

use url::Url;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// What we report about ourselves in an announce.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// A tracker's reply to an announce.
#[derive(Clone, Debug, Default)]
pub(crate) struct AnnounceResponse {
    /// How long to wait before announcing again, if the tracker expressed an
    /// opinion on it.
    pub interval: Option<Duration>,
    /// The peers the tracker knows about for this torrent.
    pub peers: Vec<SocketAddr>,
}

/// Announces to the tracker at `url`, picking the HTTP or UDP client based on
/// the URL's scheme.
pub(crate) async fn announce(
    url: &str,
    params: AnnounceParams,
) -> Result<AnnounceResponse> {
    let parsed = Url::parse(url)?;
    match parsed.scheme() {
        "http" | "https" => http::announce(&parsed, params).await,
        "udp" => udp::announce(&parsed, params).await,
        other => Err(Error::TrackerFailure(format!(
            "unsupported tracker scheme: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_scheme_is_rejected() {
        let params = AnnounceParams {
            info_hash: [0; 20],
            peer_id: [0; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
        };
        let result = announce("ws://example.com/announce", params).await;
        assert!(result.is_err());
    }
}
