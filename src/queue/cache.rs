//! On-disk store of resolved albums and playlists.
//!
//! Records are appended back to back in a single little-endian file:
//!
//! ```text
//! [u64 record_len][u8 is_album][i64 last_played][cstring name][22-byte id]
//! [cstring image_url][u32 track_count]
//! track_count x [22-byte id][36-byte uri][u32 duration_ms]
//!               [cstring name][cstring art_url][cstring artist]
//! ```
//!
//! `record_len` covers the whole record including itself. Fixed-width fields
//! are NUL padded.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::CacheError;
use crate::models::{Playlist, Track};

pub const ID_LEN: usize = 22;
pub const URI_LEN: usize = 36;

/// A playlist together with its tracks, as stored
#[derive(Debug, Clone)]
pub struct CachedPlaylist {
    pub playlist: Arc<Playlist>,
    pub tracks: Vec<Track>,
}

impl PartialEq for CachedPlaylist {
    fn eq(&self, other: &Self) -> bool {
        *self.playlist == *other.playlist && self.tracks == other.tracks
    }
}

fn put_fixed(out: &mut Vec<u8>, field: &'static str, value: &str, width: usize) -> Result<(), CacheError> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(CacheError::FieldTooLong { field, len: bytes.len(), max: width });
    }
    out.extend_from_slice(bytes);
    out.resize(out.len() + width - bytes.len(), 0);
    Ok(())
}

fn put_cstring(out: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), CacheError> {
    if value.as_bytes().contains(&0) {
        return Err(CacheError::Corrupt(format!("{} contains a NUL byte", field)));
    }
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    Ok(())
}

/// Append one encoded record for `playlist` and `tracks` to `out`
pub fn encode_record(playlist: &Playlist, tracks: &[Track], out: &mut Vec<u8>) -> Result<(), CacheError> {
    let start = out.len();
    out.extend_from_slice(&0u64.to_le_bytes());
    out.push(playlist.is_album as u8);
    out.extend_from_slice(&playlist.last_played().to_le_bytes());
    put_cstring(out, "name", &playlist.name)?;
    put_fixed(out, "id", &playlist.id, ID_LEN)?;
    put_cstring(out, "image_url", &playlist.image_url)?;
    out.extend_from_slice(&(tracks.len() as u32).to_le_bytes());

    for track in tracks {
        put_fixed(out, "track id", &track.id, ID_LEN)?;
        put_fixed(out, "uri", &track.source_locator, URI_LEN)?;
        let millis = track.duration_hint.as_millis().min(u32::MAX as u128) as u32;
        out.extend_from_slice(&millis.to_le_bytes());
        put_cstring(out, "track name", &track.title)?;
        put_cstring(out, "art_url", &track.art_url)?;
        put_cstring(out, "artist", &track.artist)?;
    }

    let record_len = (out.len() - start) as u64;
    out[start..start + 8].copy_from_slice(&record_len.to_le_bytes());
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], CacheError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| CacheError::Corrupt(format!("truncated {}", what)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8, CacheError> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &str) -> Result<u32, CacheError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self, what: &str) -> Result<u64, CacheError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn i64(&mut self, what: &str) -> Result<i64, CacheError> {
        Ok(self.u64(what)? as i64)
    }

    fn fixed(&mut self, width: usize, what: &str) -> Result<String, CacheError> {
        let raw = self.take(width, what)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        text(&raw[..end], what)
    }

    fn cstring(&mut self, what: &str) -> Result<String, CacheError> {
        let rest = &self.bytes[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CacheError::Corrupt(format!("unterminated {}", what)))?;
        let value = text(&rest[..end], what)?;
        self.pos += end + 1;
        Ok(value)
    }
}

fn text(raw: &[u8], what: &str) -> Result<String, CacheError> {
    String::from_utf8(raw.to_vec()).map_err(|_| CacheError::Corrupt(format!("{} is not UTF-8", what)))
}

/// Decode the record at the start of `bytes`, returning it and its length
pub fn decode_record(bytes: &[u8]) -> Result<(CachedPlaylist, usize), CacheError> {
    let mut header = Cursor { bytes, pos: 0 };
    let record_len = header.u64("record length")? as usize;
    if record_len < 8 || record_len > bytes.len() {
        return Err(CacheError::Corrupt(format!(
            "record length {} with {} bytes left",
            record_len,
            bytes.len()
        )));
    }

    let mut cursor = Cursor {
        bytes: &bytes[..record_len],
        pos: 8,
    };
    let is_album = cursor.u8("is_album")? != 0;
    let last_played = cursor.i64("last_played")?;
    let name = cursor.cstring("name")?;
    let id = cursor.fixed(ID_LEN, "id")?;
    let image_url = cursor.cstring("image_url")?;
    let track_count = cursor.u32("track_count")?;

    let playlist = Arc::new(Playlist::new(id, name, image_url, is_album, track_count));
    playlist.set_last_played(last_played);

    let mut tracks = Vec::with_capacity((track_count as usize).min(record_len / (ID_LEN + URI_LEN)));
    for _ in 0..track_count {
        let id = cursor.fixed(ID_LEN, "track id")?;
        let uri = cursor.fixed(URI_LEN, "uri")?;
        let millis = cursor.u32("duration")?;
        let title = cursor.cstring("track name")?;
        let art_url = cursor.cstring("art_url")?;
        let artist = cursor.cstring("artist")?;
        tracks.push(
            Track::new(id, uri, Duration::from_millis(millis as u64))
                .with_details(title, artist, art_url)
                .with_playlist(Arc::clone(&playlist)),
        );
    }

    if cursor.pos != record_len {
        return Err(CacheError::Corrupt(format!(
            "record declares {} bytes but holds {}",
            record_len, cursor.pos
        )));
    }

    Ok((CachedPlaylist { playlist, tracks }, record_len))
}

/// File-backed playlist cache
#[derive(Debug, Clone)]
pub struct PlaylistCache {
    path: PathBuf,
}

impl PlaylistCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored record; a missing file is an empty cache
    pub fn load(&self) -> Result<Vec<CachedPlaylist>, CacheError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let (record, len) = decode_record(rest)?;
            records.push(record);
            rest = &rest[len..];
        }
        Ok(records)
    }

    pub fn find(&self, id: &str, is_album: bool) -> Result<Option<CachedPlaylist>, CacheError> {
        Ok(self
            .load()?
            .into_iter()
            .find(|r| r.playlist.id == id && r.playlist.is_album == is_album))
    }

    /// Insert or replace the record for `playlist`
    pub fn store(&self, playlist: &Playlist, tracks: &[Track]) -> Result<(), CacheError> {
        let mut records = match self.load() {
            Ok(records) => records,
            Err(CacheError::Corrupt(reason)) => {
                warn!("Discarding corrupt playlist cache {}: {}", self.path.display(), reason);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        records.retain(|r| !(r.playlist.id == playlist.id && r.playlist.is_album == playlist.is_album));

        let mut out = Vec::new();
        for record in &records {
            encode_record(&record.playlist, &record.tracks, &mut out)?;
        }
        encode_record(playlist, tracks, &mut out)?;

        self.write(&out)?;
        debug!(
            "Cached {} '{}' with {} tracks",
            if playlist.is_album { "album" } else { "playlist" },
            playlist.name,
            tracks.len()
        );
        Ok(())
    }

    /// Record that playback started from `playlist` now
    pub fn touch(&self, playlist: &Playlist, tracks: &[Track]) -> Result<(), CacheError> {
        playlist.touch();
        self.store(playlist, tracks)
    }

    fn write(&self, bytes: &[u8]) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
