//! Chapter selection
//!
//! Turns the chapter list advertised by a source into the ordered,
//! de-duplicated set a batch session downloads. Bounds are inclusive and are
//! compared against the numeric value of a chapter label, so `"10.5"` sits
//! between `"10"` and `"11"` and a trailing suffix such as `"12b"` counts as
//! `12`. Labels without a leading number only match [`ChapterSelection::All`].

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::app::models::{chapter_value, compare_chapters};
use crate::app::sources::ChapterListing;

/// Which chapters of a content item to download
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterSelection {
    /// Every advertised chapter
    #[default]
    All,
    /// Chapters numbered up to and including the bound
    UpTo(f64),
    /// Chapters numbered within both bounds, inclusive
    Range { start: f64, end: f64 },
}

impl ChapterSelection {
    /// Range selection; reversed bounds are swapped
    pub fn range(a: f64, b: f64) -> Self {
        ChapterSelection::Range {
            start: a.min(b),
            end: a.max(b),
        }
    }

    /// Whether a chapter label satisfies the selection predicate
    pub fn matches(&self, chapter: &str) -> bool {
        match self {
            ChapterSelection::All => true,
            ChapterSelection::UpTo(bound) => chapter_value(chapter).is_some_and(|v| v <= *bound),
            ChapterSelection::Range { start, end } => {
                chapter_value(chapter).is_some_and(|v| v >= *start && v <= *end)
            }
        }
    }

    /// Apply the selection: filter, sort ascending by chapter number, dedupe
    ///
    /// Duplicates are detected on the trimmed, lowercased label; the first
    /// listing of a chapter wins.
    pub fn select(&self, chapters: &[ChapterListing]) -> Vec<ChapterListing> {
        let mut selected: Vec<ChapterListing> = chapters
            .iter()
            .filter(|listing| self.matches(&listing.chapter))
            .cloned()
            .collect();
        selected.sort_by(|a, b| compare_chapters(&a.chapter, &b.chapter));

        let mut seen = HashSet::new();
        selected.retain(|listing| seen.insert(listing.chapter.trim().to_lowercase()));
        selected
    }
}

impl fmt::Display for ChapterSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChapterSelection::All => write!(f, "all chapters"),
            ChapterSelection::UpTo(bound) => write!(f, "chapters up to {}", bound),
            ChapterSelection::Range { start, end } => write!(f, "chapters {} to {}", start, end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listings(labels: &[&str]) -> Vec<ChapterListing> {
        labels
            .iter()
            .map(|label| ChapterListing {
                chapter: label.to_string(),
                title: None,
                source_url: format!("https://reader.test/c/{}", label),
                requires_token: false,
            })
            .collect()
    }

    fn labels(selected: &[ChapterListing]) -> Vec<&str> {
        selected.iter().map(|l| l.chapter.as_str()).collect()
    }

    #[test]
    fn test_all_sorts_numerically() {
        let chapters = listings(&["10", "2", "1", "Extra", "2.5", "9"]);
        let selected = ChapterSelection::All.select(&chapters);
        assert_eq!(labels(&selected), vec!["1", "2", "2.5", "9", "10", "Extra"]);
    }

    #[test]
    fn test_up_to_is_inclusive() {
        let chapters = listings(&["1", "2", "3", "3.5", "4"]);
        let selected = ChapterSelection::UpTo(3.0).select(&chapters);
        assert_eq!(labels(&selected), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_range_is_inclusive_and_ignores_suffixes() {
        let chapters = listings(&["4", "5", "5b", "6", "7", "8", "Omake"]);
        let selected = ChapterSelection::range(7.0, 5.0).select(&chapters);
        assert_eq!(labels(&selected), vec!["5", "5b", "6", "7"]);
    }

    #[test]
    fn test_duplicates_removed() {
        let chapters = listings(&["2", "1", "2", "1", "3", "3A", "3a"]);
        let selected = ChapterSelection::All.select(&chapters);
        assert_eq!(labels(&selected), vec!["1", "2", "3", "3A"]);
    }

    #[test]
    fn test_selection_matches_predicate() {
        let chapters = listings(&["0", "1", "1.1", "12", "13", "20", "x"]);
        for selection in [
            ChapterSelection::All,
            ChapterSelection::UpTo(12.0),
            ChapterSelection::range(1.0, 13.0),
        ] {
            let selected = selection.select(&chapters);
            let expected = chapters
                .iter()
                .filter(|l| selection.matches(&l.chapter))
                .count();
            assert_eq!(selected.len(), expected, "{}", selection);
            assert!(selected
                .windows(2)
                .all(|w| compare_chapters(&w[0].chapter, &w[1].chapter).is_lt()));
        }
    }
}
