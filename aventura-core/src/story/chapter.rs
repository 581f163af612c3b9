//! Chapter metadata for long stories.
//!
//! A chapter covers a contiguous range of story positions. Only its summary and
//! index data live here; the full text is reached through a `ChapterQuery`.

use serde::{Deserialize, Serialize};

/// Summary metadata for one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    /// 1-based chapter number.
    pub number: u32,
    pub title: String,
    pub summary: String,
    /// First story position covered (inclusive).
    pub start_position: usize,
    /// Last story position covered (exclusive).
    pub end_position: usize,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
}

impl Chapter {
    pub fn new(number: u32, title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            summary: summary.into(),
            start_position: 0,
            end_position: 0,
            keywords: Vec::new(),
            characters: Vec::new(),
            locations: Vec::new(),
        }
    }

    pub fn with_range(mut self, start: usize, end: usize) -> Self {
        self.start_position = start;
        self.end_position = end.max(start);
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn with_characters<I, S>(mut self, characters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.characters.extend(characters.into_iter().map(Into::into));
        self
    }

    pub fn with_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locations.extend(locations.into_iter().map(Into::into));
        self
    }

    /// One-line description used in chapter listings.
    pub fn outline(&self) -> String {
        let mut line = format!("Chapter {}: {} - {}", self.number, self.title, self.summary);
        if !self.characters.is_empty() {
            line.push_str(&format!(" (characters: {})", self.characters.join(", ")));
        }
        if !self.locations.is_empty() {
            line.push_str(&format!(" (locations: {})", self.locations.join(", ")));
        }
        line
    }
}

/// Metadata-only listing of chapters, one line each.
pub fn chapter_listing(chapters: &[Chapter]) -> String {
    if chapters.is_empty() {
        return "No chapters yet.".to_string();
    }
    chapters
        .iter()
        .map(Chapter::outline)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Clamp an inclusive chapter range to existing chapters and at most `max_span`
/// chapters.
///
/// Returns `None` when the range does not touch any existing chapter.
pub fn clamp_range(chapters: &[Chapter], start: u32, end: u32, max_span: u32) -> Option<(u32, u32)> {
    let first = chapters.iter().map(|c| c.number).min()?;
    let last = chapters.iter().map(|c| c.number).max()?;

    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    let start = start.max(first);
    let end = end.min(last);
    if start > end {
        return None;
    }

    let span = max_span.max(1);
    Some((start, end.min(start + span - 1)))
}
