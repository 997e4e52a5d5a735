//! Parsing of `.torrent` metainfo files (BEP 3).

use std::path::PathBuf;

use serde::Deserialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

/// A parsed and validated `.torrent` metainfo.
///
/// Unlike the raw bencode dictionary, this normalizes single-file and
/// multi-file torrents into the same [`FsStructure`] shape and resolves the
/// `name.utf-8`/`path.utf-8` fallback fields BEP 3 allows for non-UTF-8
/// filesystems.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The torrent's display name (also the download directory name for
    /// multi-file torrents).
    pub name: String,
    /// The announce URL of the torrent's tracker, if given.
    pub announce: Option<String>,
    /// The nominal length of a piece, in bytes. Every piece is this long
    /// except possibly the last.
    pub piece_len: u32,
    /// The expected SHA-1 hash of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The file layout of the torrent's contents.
    pub structure: FsStructure,
    /// The SHA-1 hash of the bencoded `info` dictionary, computed over the
    /// exact bytes of that value as they appeared in the original file (not
    /// a re-encoding of the parsed structure, which bencode libraries aren't
    /// guaranteed to reproduce byte for byte).
    pub info_hash: Sha1Hash,
    /// Whether this torrent is marked private (BEP 27): if set, peers should
    /// only be obtained from the tracker, never from DHT or PEX. Since this
    /// engine implements neither, the flag is recorded but otherwise inert.
    pub is_private: bool,
}

impl Metainfo {
    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the expected hash of the piece at `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        self.piece_hashes.get(index).copied()
    }
}

/// Parses and validates `.torrent` metainfo files.
pub struct MetainfoParser;

impl MetainfoParser {
    /// Parses a metainfo file's raw bytes.
    ///
    /// This both decodes the bencode structure and validates the invariants
    /// that make the result safe to hand to [`crate::storage_info::StorageInfo`]:
    /// the piece hash string is a multiple of 20 bytes, the piece count
    /// matches `ceil(total length / piece length)`, and multi-file lengths
    /// sum up to the declared total.
    pub fn parse(buf: &[u8]) -> Result<Metainfo> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        let info_span = find_info_span(buf)
            .ok_or_else(|| {
                Error::InvalidMetainfo(
                    "could not locate info dictionary in metainfo".into(),
                )
            })?;
        let digest = Sha1::digest(&buf[info_span]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        let info = raw.info;

        if info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces string length is not a multiple of 20".into(),
            ));
        }
        let piece_hashes: Vec<Sha1Hash> = info
            .pieces
            .chunks(20)
            .map(|c| {
                let mut hash = [0; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect();
        if piece_hashes.is_empty() {
            return Err(Error::InvalidMetainfo(
                "torrent has no pieces".into(),
            ));
        }

        let name = info
            .name_utf8
            .or_else(|| String::from_utf8(info.name.into_vec()).ok())
            .ok_or_else(|| {
                Error::InvalidMetainfo("name is not valid UTF-8".into())
            })?;

        let piece_len: u32 = info.piece_length.try_into().map_err(|_| {
            Error::InvalidMetainfo("piece length out of range".into())
        })?;
        if piece_len == 0 {
            return Err(Error::InvalidMetainfo(
                "piece length must be nonzero".into(),
            ));
        }

        let structure = match (info.length, info.files) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidMetainfo(
                    "info has both `length` and `files`".into(),
                ));
            }
            (None, None) => {
                return Err(Error::InvalidMetainfo(
                    "info has neither `length` nor `files`".into(),
                ));
            }
            (Some(len), None) => FsStructure::File(FileInfo {
                path: PathBuf::from(&name),
                len,
                torrent_offset: 0,
            }),
            (None, Some(raw_files)) => {
                if raw_files.is_empty() {
                    return Err(Error::InvalidMetainfo(
                        "files list is empty".into(),
                    ));
                }
                let mut files = Vec::with_capacity(raw_files.len());
                let mut offset = 0u64;
                for raw_file in raw_files {
                    let path = raw_file.relative_path()?;
                    files.push(FileInfo {
                        path,
                        len: raw_file.length,
                        torrent_offset: offset,
                    });
                    offset += raw_file.length;
                }
                FsStructure::Archive { files }
            }
        };

        let download_len = structure.download_len();
        let piece_count = piece_hashes.len();
        let expected_piece_count = ((download_len + piece_len as u64 - 1)
            / piece_len as u64) as usize;
        if piece_count != expected_piece_count {
            return Err(Error::InvalidMetainfo(format!(
                "piece count {} doesn't match ceil(download length / piece length) = {}",
                piece_count, expected_piece_count
            )));
        }
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count as u64 - 1);
        if last_piece_len == 0 || last_piece_len > piece_len as u64 {
            return Err(Error::InvalidMetainfo(
                "last piece length is inconsistent with download length".into(),
            ));
        }

        Ok(Metainfo {
            name,
            announce: raw.announce,
            piece_len,
            piece_hashes,
            structure,
            info_hash,
            is_private: info.private.unwrap_or(0) != 0,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: Option<String>,
    info: RawInfo,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: ByteBuf,
    #[serde(rename = "name.utf-8")]
    name_utf8: Option<String>,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<ByteBuf>,
    #[serde(rename = "path.utf-8")]
    path_utf8: Option<Vec<String>>,
}

impl RawFile {
    fn relative_path(self) -> Result<PathBuf> {
        let components = match self.path_utf8 {
            Some(components) => components,
            None => self
                .path
                .into_iter()
                .map(|c| {
                    String::from_utf8(c.into_vec()).map_err(|_| {
                        Error::InvalidMetainfo(
                            "file path is not valid UTF-8".into(),
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        if components.is_empty() {
            return Err(Error::InvalidMetainfo(
                "file path has no components".into(),
            ));
        }
        let mut path = PathBuf::new();
        for component in components {
            if component.is_empty() || component == ".." || component == "." {
                return Err(Error::InvalidMetainfo(format!(
                    "invalid file path component: {:?}",
                    component
                )));
            }
            path.push(component);
        }
        Ok(path)
    }
}

/// Scans the raw bencoded metainfo bytes to find the exact byte range of the
/// `info` dictionary's value, so its hash can be computed without relying on
/// re-encoding the parsed structure.
///
/// Returns `None` if `buf` isn't a well-formed bencoded dictionary or doesn't
/// contain an `info` key.
fn find_info_span(buf: &[u8]) -> Option<std::ops::Range<usize>> {
    if buf.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1;
    loop {
        if buf.get(pos) == Some(&b'e') {
            return None;
        }
        let (key, key_end) = read_bencode_string(buf, pos)?;
        let value_start = key_end;
        let value_end = skip_bencode_value(buf, value_start)?;
        if key == b"info" {
            return Some(value_start..value_end);
        }
        pos = value_end;
    }
}

/// Reads a bencode byte string (`<len>:<bytes>`) starting at `pos`, returning
/// the string's bytes and the position right after it.
fn read_bencode_string(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let colon = buf[pos..].iter().position(|&b| b == b':')? + pos;
    let len: usize = std::str::from_utf8(&buf[pos..colon])
        .ok()?
        .parse()
        .ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    Some((&buf[start..end], end))
}

/// Returns the position right after the bencode value (string, integer, list
/// or dictionary) starting at `pos`.
fn skip_bencode_value(buf: &[u8], pos: usize) -> Option<usize> {
    match *buf.get(pos)? {
        b'i' => {
            let end = buf[pos..].iter().position(|&b| b == b'e')? + pos;
            Some(end + 1)
        }
        b'l' => {
            let mut pos = pos + 1;
            while buf.get(pos) != Some(&b'e') {
                pos = skip_bencode_value(buf, pos)?;
            }
            Some(pos + 1)
        }
        b'd' => {
            let mut pos = pos + 1;
            while buf.get(pos) != Some(&b'e') {
                let (_, key_end) = read_bencode_string(buf, pos)?;
                pos = skip_bencode_value(buf, key_end)?;
            }
            Some(pos + 1)
        }
        b'0'..=b'9' => {
            let (_, end) = read_bencode_string(buf, pos)?;
            Some(end)
        }
        _ => None,
    }
}
