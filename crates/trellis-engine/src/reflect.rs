use trellis_core::config::ReflectConfig;
use trellis_core::traits::CompletionDetector;

/// Keyword-based completion detection for the reflect phase.
///
/// A reply counts as complete when it contains any configured phrase,
/// compared case-insensitively. This is a heuristic; swap in another
/// [`CompletionDetector`] for anything smarter.
#[derive(Debug, Clone)]
pub struct PhraseDetector {
    phrases: Vec<String>,
}

impl PhraseDetector {
    pub fn new(phrases: Vec<String>) -> Self {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &ReflectConfig) -> Self {
        Self::new(config.completion_phrases.clone())
    }
}

impl Default for PhraseDetector {
    fn default() -> Self {
        Self::from_config(&ReflectConfig::default())
    }
}

impl CompletionDetector for PhraseDetector {
    fn is_complete(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.phrases.iter().any(|p| text.contains(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_phrases() {
        let detector = PhraseDetector::default();
        assert!(detector.is_complete("The Task Is Complete."));
        assert!(detector.is_complete("All steps accomplished"));
        assert!(detector.is_complete("DONE"));
        assert!(!detector.is_complete("Still gathering sources"));
    }

    #[test]
    fn test_custom_phrases() {
        let detector = PhraseDetector::new(vec!["LGTM".into(), "".into()]);
        assert!(detector.is_complete("lgtm, shipping it"));
        assert!(!detector.is_complete("task is complete"));
        assert!(!detector.is_complete(""));
    }
}
