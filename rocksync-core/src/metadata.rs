use std::path::Path;

use lofty::file::{AudioFile, TaggedFileExt};
use lofty::tag::{Accessor, ItemKey, Tag};
use tracing::debug;

/// Tag fields extracted from one audio file. Every field has a usable default
/// so a failed extraction still yields an indexable record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackTags {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub albumartist: String,
    pub genre: String,
    pub track: String,
    pub disc: String,
    pub year: String,
    pub date: String,
    pub composer: String,
    pub comment: String,
    pub duration_seconds: i64,
    pub format: String,
}

impl TrackTags {
    /// Defaults for a file whose tags could not be read.
    pub fn fallback(path: &Path) -> Self {
        Self {
            title: file_name(path),
            format: format_of(path),
            ..Self::default()
        }
    }
}

/// Best-effort tag reader. Implementations never fail: unreadable files map
/// to [`TrackTags::fallback`].
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> TrackTags;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyExtractor;

impl MetadataExtractor for LoftyExtractor {
    fn extract(&self, path: &Path) -> TrackTags {
        let tagged = match lofty::read_from_path(path) {
            Ok(tagged) => tagged,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "unreadable tags, using defaults");
                return TrackTags::fallback(path);
            }
        };

        let mut tags = TrackTags::fallback(path);
        tags.duration_seconds = tagged.properties().duration().as_secs() as i64;

        let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) else {
            return tags;
        };
        fill_from_tag(&mut tags, tag);
        tags
    }
}

fn fill_from_tag(tags: &mut TrackTags, tag: &Tag) {
    if let Some(title) = tag.title().map(|s| s.trim().to_string())
        && !title.is_empty()
    {
        tags.title = title;
    }
    tags.artist = tag.artist().map(|s| s.trim().to_string()).unwrap_or_default();
    tags.album = tag.album().map(|s| s.trim().to_string()).unwrap_or_default();
    tags.albumartist = text(tag, &ItemKey::AlbumArtist);
    tags.genre = join_genres(tag.get_strings(&ItemKey::Genre));
    tags.track = number_part(&text(tag, &ItemKey::TrackNumber));
    tags.disc = number_part(&text(tag, &ItemKey::DiscNumber));
    tags.year = tag.year().map(|y| y.to_string()).unwrap_or_default();
    tags.date = text(tag, &ItemKey::RecordingDate);
    tags.composer = text(tag, &ItemKey::Composer);
    tags.comment = tag.comment().map(|s| s.trim().to_string()).unwrap_or_default();
}

fn text(tag: &Tag, key: &ItemKey) -> String {
    tag.get_string(key)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Joins genre values with `"; "`, dropping blanks and repeats while keeping
/// first-seen order.
pub fn join_genres<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: Vec<&str> = Vec::new();
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen.join("; ")
}

/// `"3/12"` becomes `"3"`.
pub fn number_part(value: &str) -> String {
    value.split('/').next().unwrap_or_default().trim().to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn format_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}
