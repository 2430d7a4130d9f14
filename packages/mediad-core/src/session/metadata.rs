//! Now-playing metadata with a present-field mask.
//!
//! A controllee publishes partial updates: the `flags` mask says which
//! fields of the record carry meaning, and merging overwrites exactly the
//! masked fields. The serialized form travels as the `arg`/response string
//! of session commands as one line:
//!
//! ```text
//! flags:state:volume:position:duration:title<TAB>artist<TAB>album
//! ```
//!
//! Numerics are colon-separated; the string section is tab-separated so
//! titles may contain colons. Tabs inside string fields cannot be
//! represented and are replaced by spaces on serialize.

use crate::defs::{
    METAFLAG_ALBUM, METAFLAG_ARTIST, METAFLAG_DURATION, METAFLAG_POSITION, METAFLAG_STATE,
    METAFLAG_TITLE, METAFLAG_VOLUME,
};
use crate::error::{MediaError, MediaResult};

/// Playback metadata record. `state > 0` means playing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    /// Bitmask of `METAFLAG_*` naming the meaningful fields.
    pub flags: u32,
    /// Positive for active, zero for inactive, negative errno for error.
    pub state: i32,
    pub volume: i32,
    pub position: u32,
    pub duration: u32,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff constructor helpers: each sets the field and its mask bit.
    pub fn with_state(mut self, state: i32) -> Self {
        self.flags |= METAFLAG_STATE;
        self.state = state;
        self
    }

    pub fn with_volume(mut self, volume: i32) -> Self {
        self.flags |= METAFLAG_VOLUME;
        self.volume = volume;
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.flags |= METAFLAG_POSITION;
        self.position = position;
        self
    }

    pub fn with_duration(mut self, duration: u32) -> Self {
        self.flags |= METAFLAG_DURATION;
        self.duration = duration;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.flags |= METAFLAG_TITLE;
        self.title = Some(title.into());
        self
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.flags |= METAFLAG_ARTIST;
        self.artist = Some(artist.into());
        self
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.flags |= METAFLAG_ALBUM;
        self.album = Some(album.into());
        self
    }

    /// Field-by-field overwrite gated by the diff's present mask.
    pub fn merge(&mut self, diff: &Metadata) {
        if diff.flags & METAFLAG_STATE != 0 {
            self.state = diff.state;
        }
        if diff.flags & METAFLAG_VOLUME != 0 {
            self.volume = diff.volume;
        }
        if diff.flags & METAFLAG_POSITION != 0 {
            self.position = diff.position;
        }
        if diff.flags & METAFLAG_DURATION != 0 {
            self.duration = diff.duration;
        }
        if diff.flags & METAFLAG_TITLE != 0 {
            self.title = diff.title.clone();
        }
        if diff.flags & METAFLAG_ARTIST != 0 {
            self.artist = diff.artist.clone();
        }
        if diff.flags & METAFLAG_ALBUM != 0 {
            self.album = diff.album.clone();
        }
        self.flags |= diff.flags;
    }

    /// Wire form of the record; unset string fields serialize empty.
    pub fn serialize(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}\t{}\t{}",
            self.flags,
            self.state,
            self.volume,
            self.position,
            self.duration,
            untabbed(self.title.as_deref()),
            untabbed(self.artist.as_deref()),
            untabbed(self.album.as_deref()),
        )
    }

    /// Parses the wire form, rejecting malformed records.
    ///
    /// String fields count only when their mask bit is set and they are
    /// non-empty.
    pub fn deserialize(text: &str) -> MediaResult<Self> {
        let bad = || MediaError::InvalidArgument(format!("bad metadata record '{text}'"));

        let mut fields = text.splitn(6, ':');
        let mut meta = Self::new();
        meta.flags = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
        meta.state = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
        meta.volume = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
        meta.position = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
        meta.duration = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;

        // The remainder is the tab-separated string section; titles may
        // contain colons.
        let mut strings = fields.next().ok_or_else(bad)?.split('\t');
        meta.title = masked_string(meta.flags, METAFLAG_TITLE, strings.next());
        meta.artist = masked_string(meta.flags, METAFLAG_ARTIST, strings.next());
        meta.album = masked_string(meta.flags, METAFLAG_ALBUM, strings.next());
        Ok(meta)
    }
}

fn untabbed(field: Option<&str>) -> String {
    field.unwrap_or("").replace('\t', " ")
}

fn masked_string(flags: u32, flag: u32, field: Option<&str>) -> Option<String> {
    match field {
        Some(s) if flags & flag != 0 && !s.is_empty() => Some(s.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overwrites_only_masked_fields() {
        let mut meta = Metadata::new()
            .with_title("Song A")
            .with_artist("Artist A")
            .with_state(0);

        let diff = Metadata::new().with_title("Song B").with_state(1);
        meta.merge(&diff);

        assert_eq!(meta.title.as_deref(), Some("Song B"));
        assert_eq!(meta.artist.as_deref(), Some("Artist A"));
        assert_eq!(meta.state, 1);
        assert_eq!(
            meta.flags,
            METAFLAG_TITLE | METAFLAG_ARTIST | METAFLAG_STATE
        );
    }

    #[test]
    fn merge_with_empty_diff_is_identity() {
        let mut meta = Metadata::new().with_volume(5).with_duration(1000);
        let before = meta.clone();
        meta.merge(&Metadata::new());
        assert_eq!(meta, before);
    }

    #[test]
    fn serialize_uses_the_colon_tab_record() {
        let meta = Metadata::new().with_state(1).with_title("Song");
        assert_eq!(
            meta.serialize(),
            format!("{}:1:0:0:0:Song\t\t", METAFLAG_STATE | METAFLAG_TITLE)
        );
    }

    #[test]
    fn serialize_round_trips() {
        let meta = Metadata::new()
            .with_state(1)
            .with_volume(7)
            .with_position(1234)
            .with_title("Tit:le, with \"quotes\"")
            .with_album("Album");
        assert_eq!(Metadata::deserialize(&meta.serialize()).unwrap(), meta);
    }

    #[test]
    fn unset_string_fields_stay_unset() {
        let meta = Metadata::new().with_state(1);
        let back = Metadata::deserialize(&meta.serialize()).unwrap();
        assert_eq!(back.title, None);
        assert_eq!(back.artist, None);
        assert_eq!(back.album, None);
    }

    #[test]
    fn unmasked_strings_are_ignored() {
        // Artist text without its mask bit does not count.
        let record = format!("{}:0:0:0:0:\tGhost Artist\t", METAFLAG_STATE);
        let meta = Metadata::deserialize(&record).unwrap();
        assert_eq!(meta.artist, None);
    }

    #[test]
    fn tabs_in_fields_become_spaces() {
        let meta = Metadata::new().with_title("a\tb").with_artist("c");
        let back = Metadata::deserialize(&meta.serialize()).unwrap();
        assert_eq!(back.title.as_deref(), Some("a b"));
        assert_eq!(back.artist.as_deref(), Some("c"));
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert!(Metadata::deserialize("garbage").is_err());
        assert!(Metadata::deserialize("1:2:three:4:5:x\ty\tz").is_err());
        assert!(Metadata::deserialize("1:2:3").is_err());
    }
}
