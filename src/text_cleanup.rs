// Text cleanup module
// Strips tag noise like "[Explicit]" from metadata before it is submitted

use crate::config::CleanupConfig;
use crate::player::TrackRef;
use regex::Regex;

pub struct TextCleaner {
    patterns: Vec<Regex>,
}

impl TextCleaner {
    /// Compile the configured patterns; invalid ones are skipped with a warning
    pub fn new(config: &CleanupConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let patterns = config
            .patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::warn!("Invalid cleanup pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Self { patterns }
    }

    pub fn disabled() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn clean(&self, text: &str) -> String {
        if self.patterns.is_empty() {
            return text.to_string();
        }

        let cleaned = self
            .patterns
            .iter()
            .fold(text.to_string(), |acc, re| re.replace_all(&acc, "").into_owned());
        cleaned.trim().to_string()
    }

    /// Copy of `track` with artist, title and album cleaned; identity is kept
    pub fn clean_track(&self, track: &TrackRef) -> TrackRef {
        TrackRef {
            file_id: track.file_id.clone(),
            artist: self.clean(&track.artist),
            title: self.clean(&track.title),
            album: track
                .album
                .as_deref()
                .map(|a| self.clean(a))
                .filter(|a| !a.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_patterns_strip_explicit_and_clean_markers() {
        let cleaner = TextCleaner::new(&CleanupConfig::default());
        assert_eq!(cleaner.clean("Song [Explicit]"), "Song");
        assert_eq!(cleaner.clean("Song (Clean)"), "Song");
        assert_eq!(cleaner.clean("Song - Explicit"), "Song");
        assert_eq!(cleaner.clean("  Plain Song "), "Plain Song");
    }

    #[test]
    fn disabled_cleanup_leaves_text_alone() {
        let config = CleanupConfig {
            enabled: false,
            ..CleanupConfig::default()
        };
        let cleaner = TextCleaner::new(&config);
        assert_eq!(cleaner.clean(" Song [Explicit] "), " Song [Explicit] ");
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let config = CleanupConfig {
            enabled: true,
            patterns: vec!["(unclosed".to_string(), r"\s*\(Live\)".to_string()],
        };
        let cleaner = TextCleaner::new(&config);
        assert_eq!(cleaner.clean("Song (Live)"), "Song");
    }

    #[test]
    fn clean_track_keeps_identity_and_drops_empty_album() {
        let cleaner = TextCleaner::new(&CleanupConfig::default());
        let track = TrackRef {
            file_id: "a/b.mp3".to_string(),
            artist: "Artist".to_string(),
            title: "Title [Explicit]".to_string(),
            album: Some("[Explicit]".to_string()),
        };

        let cleaned = cleaner.clean_track(&track);
        assert_eq!(cleaned, track);
        assert_eq!(cleaned.title, "Title");
        assert_eq!(cleaned.album, None);
    }
}
