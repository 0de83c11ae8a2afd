//! Typed descriptors of the content a session will write.
//!
//! A [`Track`] is passive data: it names what to write (a stream source, a
//! set of graft points, an image, or a whole disc), where its content starts
//! and ends in sector units, and carries an open tag map for metadata and an
//! optional attached checksum. Jobs consume a track and produce a
//! transformed copy; the track itself never performs I/O.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::SECTOR_SIZE;

/// Well-known metadata tag keys.
pub const TAG_TITLE: &str = "title";
pub const TAG_ARTIST: &str = "artist";
pub const TAG_COMPOSER: &str = "composer";
pub const TAG_ISRC: &str = "isrc";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Data,
    Image,
    Disc,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackKind::Audio => "audio",
            TrackKind::Data => "data",
            TrackKind::Image => "image",
            TrackKind::Disc => "disc",
        };
        f.write_str(name)
    }
}

/// Mapping from a virtual path on the disc to the locator supplying it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraftPoint {
    pub path: String,
    pub uri: String,
}

impl GraftPoint {
    pub fn new(path: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            uri: uri.into(),
        }
    }
}

/// Per-kind content of a track. Exactly one variant is active at a time;
/// re-typing only happens through [`Track::retyped`].
#[derive(Clone, Debug)]
pub enum TrackContent {
    Audio {
        source: String,
    },
    Data {
        grafts: Vec<GraftPoint>,
        /// Locators to omit from the written tree.
        excluded: Vec<String>,
    },
    Image {
        source: String,
        toc: Option<String>,
    },
    Disc {
        device: PathBuf,
    },
}

/// Content boundaries in addressable sector units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackBounds {
    pub start: u64,
    /// `None` means unknown; determine by probing.
    pub len: Option<u64>,
    pub pad: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagValue {
    Str(String),
    Int(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChecksumKind {
    Md5,
    Sha256,
}

impl ChecksumKind {
    /// Width of the textual (hex) form.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumKind::Md5 => 32,
            ChecksumKind::Sha256 => 64,
        }
    }
}

/// A checksum attached to a track: either the value itself or the locator
/// of a sidecar file holding it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Checksum {
    Value { kind: ChecksumKind, hex: String },
    Sidecar { kind: ChecksumKind, uri: String },
}

/// Metadata gathered by probing a stream source.
#[derive(Clone, Debug, Default)]
pub struct StreamInfo {
    pub len_bytes: u64,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub composer: Option<String>,
    pub isrc: Option<i64>,
}

/// A typed, boundable descriptor of content to be written.
///
/// Copies are by-value semantically; the tag map is shared between copies
/// until one of them mutates it (copy-on-write through [`Arc`]).
#[derive(Clone, Debug)]
pub struct Track {
    content: TrackContent,
    bounds: TrackBounds,
    tags: Arc<BTreeMap<String, TagValue>>,
    checksum: Option<Checksum>,
}

impl Track {
    fn with_content(content: TrackContent) -> Self {
        Self {
            content,
            bounds: TrackBounds::default(),
            tags: Arc::new(BTreeMap::new()),
            checksum: None,
        }
    }

    pub fn audio(source: impl Into<String>) -> Self {
        Self::with_content(TrackContent::Audio {
            source: source.into(),
        })
    }

    pub fn data(grafts: Vec<GraftPoint>, excluded: Vec<String>) -> Self {
        Self::with_content(TrackContent::Data { grafts, excluded })
    }

    pub fn image(source: impl Into<String>, toc: Option<String>) -> Self {
        Self::with_content(TrackContent::Image {
            source: source.into(),
            toc,
        })
    }

    pub fn disc(device: impl Into<PathBuf>) -> Self {
        Self::with_content(TrackContent::Disc {
            device: device.into(),
        })
    }

    pub fn kind(&self) -> TrackKind {
        match self.content {
            TrackContent::Audio { .. } => TrackKind::Audio,
            TrackContent::Data { .. } => TrackKind::Data,
            TrackContent::Image { .. } => TrackKind::Image,
            TrackContent::Disc { .. } => TrackKind::Disc,
        }
    }

    pub fn content(&self) -> &TrackContent {
        &self.content
    }

    pub fn bounds(&self) -> TrackBounds {
        self.bounds
    }

    pub fn set_bounds(&mut self, bounds: TrackBounds) {
        self.bounds = bounds;
    }

    pub fn checksum(&self) -> Option<&Checksum> {
        self.checksum.as_ref()
    }

    pub fn set_checksum(&mut self, checksum: Checksum) {
        self.checksum = Some(checksum);
    }

    /// A transformed copy with new content, as produced by a job. Bounds,
    /// tags (shared) and any attached checksum carry over.
    pub fn retyped(&self, content: TrackContent) -> Track {
        Track {
            content,
            bounds: self.bounds,
            tags: Arc::clone(&self.tags),
            checksum: self.checksum.clone(),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    pub fn tags(&self) -> &BTreeMap<String, TagValue> {
        &self.tags
    }

    /// Adds a tag. Tags are additive: an existing key keeps its value and
    /// `false` is returned.
    pub fn tag_add(&mut self, key: impl Into<String>, value: TagValue) -> bool {
        let key = key.into();
        if self.tags.contains_key(&key) {
            return false;
        }
        Arc::make_mut(&mut self.tags).insert(key, value);
        true
    }

    /// Replaces the whole tag set in one step. This is the only way a
    /// metadata refresh may overwrite existing tags.
    pub fn refresh_tags(&mut self, tags: BTreeMap<String, TagValue>) {
        self.tags = Arc::new(tags);
    }

    /// Applies probed stream metadata: boundaries from the byte length and
    /// a full, atomic tag rewrite.
    pub fn apply_stream_info(&mut self, info: &StreamInfo) {
        self.bounds = TrackBounds {
            start: 0,
            len: Some(info.len_bytes.div_ceil(SECTOR_SIZE)),
            pad: 0,
        };

        let mut tags = BTreeMap::new();
        if let Some(title) = &info.title {
            tags.insert(TAG_TITLE.to_string(), TagValue::Str(title.clone()));
        }
        if let Some(artist) = &info.artist {
            tags.insert(TAG_ARTIST.to_string(), TagValue::Str(artist.clone()));
        }
        if let Some(composer) = &info.composer {
            tags.insert(TAG_COMPOSER.to_string(), TagValue::Str(composer.clone()));
        }
        if let Some(isrc) = info.isrc {
            tags.insert(TAG_ISRC.to_string(), TagValue::Int(isrc));
        }
        self.refresh_tags(tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_additive() {
        let mut track = Track::audio("/tmp/song.wav");
        assert!(track.tag_add(TAG_TITLE, TagValue::Str("First".into())));
        assert!(!track.tag_add(TAG_TITLE, TagValue::Str("Second".into())));
        assert_eq!(
            track.tag(TAG_TITLE),
            Some(&TagValue::Str("First".to_string()))
        );
    }

    #[test]
    fn copies_share_tags_until_mutation() {
        let mut original = Track::audio("/tmp/song.wav");
        original.tag_add(TAG_ARTIST, TagValue::Str("Someone".into()));

        let mut copy = original.clone();
        assert!(Arc::ptr_eq(&original.tags, &copy.tags));

        copy.tag_add(TAG_TITLE, TagValue::Str("Copy title".into()));
        assert!(!Arc::ptr_eq(&original.tags, &copy.tags));
        assert!(original.tag(TAG_TITLE).is_none());
        assert_eq!(
            copy.tag(TAG_ARTIST),
            Some(&TagValue::Str("Someone".to_string()))
        );
    }

    #[test]
    fn stream_probe_rewrites_tags_atomically() {
        let mut track = Track::audio("/tmp/song.wav");
        track.tag_add("stale", TagValue::Int(1));

        track.apply_stream_info(&StreamInfo {
            len_bytes: SECTOR_SIZE * 3 + 1,
            title: Some("Song".into()),
            artist: Some("Artist".into()),
            composer: None,
            isrc: Some(42),
        });

        assert!(track.tag("stale").is_none());
        assert_eq!(track.tag(TAG_TITLE), Some(&TagValue::Str("Song".to_string())));
        assert_eq!(track.tag(TAG_ISRC), Some(&TagValue::Int(42)));
        assert_eq!(track.bounds().len, Some(4));
    }

    #[test]
    fn retyping_keeps_bounds_and_tags() {
        let mut track = Track::image("sftp://host/disc.iso", None);
        track.set_bounds(TrackBounds {
            start: 0,
            len: Some(1200),
            pad: 150,
        });
        track.tag_add(TAG_TITLE, TagValue::Str("Backup".into()));

        let retyped = track.retyped(TrackContent::Image {
            source: "/tmp/staged/disc.iso".into(),
            toc: None,
        });
        assert_eq!(retyped.kind(), TrackKind::Image);
        assert_eq!(retyped.bounds().len, Some(1200));
        assert_eq!(
            retyped.tag(TAG_TITLE),
            Some(&TagValue::Str("Backup".to_string()))
        );
    }
}
