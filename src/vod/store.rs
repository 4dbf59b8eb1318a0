//! On-disk artifact store.
//!
//! Maps a (service-ref, profile) pair to a cache directory and answers
//! readiness questions about what is already servable. Readiness checks are
//! deliberately cheap: one stat plus one bounded read of the playlist.

use recast_common::ServiceRef;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Final, fully rewritten playlist name.
pub const FINAL_PLAYLIST: &str = "index.m3u8";
/// Progressive playlist written while a build is running.
pub const LIVE_PLAYLIST: &str = "index.live.m3u8";
/// Temporary name used while finalizing, renamed atomically.
pub const FINAL_TMP: &str = "index.final.tmp";
/// Progressive MP4 output name.
pub const MP4_OUTPUT: &str = "stream.mp4";

/// Upper bound on playlist bytes inspected during readiness checks.
const PLAYLIST_READ_LIMIT: u64 = 64 * 1024;

/// A servable artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub body: ArtifactBody,
    pub mod_time: Option<SystemTime>,
    pub mime: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Playlist,
    Timeshift,
    SegmentTs,
    SegmentFmp4,
    SegmentInit,
    Mp4,
}

/// Exactly one of inline data or a filesystem path, by construction.
#[derive(Debug, Clone)]
pub enum ArtifactBody {
    Inline(bytes::Bytes),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    hls_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(hls_root: PathBuf) -> Self {
        Self { hls_root }
    }

    /// Cache directory for a service reference:
    /// `hls_root/recordings/<sha256(ref)>`.
    pub fn cache_dir(&self, sref: &ServiceRef) -> PathBuf {
        self.hls_root.join("recordings").join(sref.digest())
    }

    /// A cache is final-ready when the rewritten playlist is in place and at
    /// least one referenced segment actually exists.
    pub fn final_ready(&self, dir: &Path) -> bool {
        let playlist = dir.join(FINAL_PLAYLIST);
        let Some(content) = read_playlist_bounded(&playlist) else {
            return false;
        };
        if content.is_empty()
            || !content.contains("#EXTM3U")
            || !content.contains("#EXT-X-PLAYLIST-TYPE:VOD")
            || !content.contains("#EXT-X-ENDLIST")
        {
            return false;
        }
        any_referenced_segment_exists(dir, &content)
    }

    /// A cache is progressive-ready when the live playlist references at
    /// least one existing allow-listed segment.
    pub fn progressive_ready(&self, dir: &Path) -> bool {
        let playlist = dir.join(LIVE_PLAYLIST);
        let Some(content) = read_playlist_bounded(&playlist) else {
            return false;
        };
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .any(|name| segment_name_allowed(name) && dir.join(name).is_file())
    }
}

/// Segment allow-list: `init.mp4`, or `seg_*` with `.ts` / `.m4s`.
pub fn segment_name_allowed(name: &str) -> bool {
    if name == "init.mp4" {
        return true;
    }
    if !name.starts_with("seg_") {
        return false;
    }
    name.ends_with(".ts") || name.ends_with(".m4s")
}

/// Resolve a client-supplied segment name inside the cache directory,
/// rejecting anything that is not on the allow-list or would resolve outside
/// the directory.
pub fn confine_segment(dir: &Path, name: &str) -> Option<PathBuf> {
    if name.contains('/') || name.contains('\\') || !segment_name_allowed(name) {
        return None;
    }
    let candidate = dir.join(name);
    // Symlinks could still point out of the cache; canonicalize both sides.
    let resolved = candidate.canonicalize().ok()?;
    let root = dir.canonicalize().ok()?;
    if !resolved.starts_with(&root) {
        return None;
    }
    Some(resolved)
}

/// Content type for a segment name.
pub fn segment_kind(name: &str) -> Option<(ArtifactKind, &'static str)> {
    if name == "init.mp4" {
        return Some((ArtifactKind::SegmentInit, "video/mp4"));
    }
    if name.ends_with(".ts") {
        return Some((ArtifactKind::SegmentTs, "video/mp2t"));
    }
    if name.ends_with(".m4s") {
        return Some((ArtifactKind::SegmentFmp4, "video/iso.segment"));
    }
    None
}

fn read_playlist_bounded(path: &Path) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    let mut content = String::new();
    file.take(PLAYLIST_READ_LIMIT)
        .read_to_string(&mut content)
        .ok()?;
    Some(content)
}

fn any_referenced_segment_exists(dir: &Path, playlist: &str) -> bool {
    playlist
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .any(|name| dir.join(name).is_file())
}
