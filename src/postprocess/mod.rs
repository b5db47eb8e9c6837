//! OCR text cleanup.
//!
//! [`TextNormalizer::clean`] tidies whitespace, repairs a few characters OCR
//! engines commonly get wrong, drops stray symbols, and optionally runs
//! spelling correction. Without spelling correction, cleaning is idempotent.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use self::spell::{DictionaryCorrector, SpellCorrector};
use crate::{config::PostprocessConfig, errors::WithWarnings, prelude::*};

pub mod spell;

static SPACE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" +").expect("failed to compile regex"));
static BLANK_LINE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\n+").expect("failed to compile regex"));

/// Character fixes, applied in order.
static REPLACEMENTS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // A lone zero is almost always a capital O.
        (r"\b0\b", "O"),
        // A lone lowercase L is almost always a capital I.
        (r"\bl\b", "I"),
        (r"~", "-"),
        (r"[‘’‚‛`]", "'"),
        (r#"[“”„‟]"#, "\""),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("failed to compile regex"),
            replacement,
        )
    })
    .collect()
});

/// Anything that isn't a word character, whitespace, or common punctuation.
static UNWANTED_SYMBOLS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[^\w\s.,;:!?\-'"()\[\]{}/@#$%&*+=]"#).expect("failed to compile regex")
});

/// Cleans up recognized text.
#[derive(Clone)]
pub struct TextNormalizer {
    config: PostprocessConfig,
    corrector: Option<Arc<dyn SpellCorrector>>,
}

impl TextNormalizer {
    /// Create a normalizer, loading the spelling dictionary if one is
    /// configured. If spelling correction is requested but no dictionary can
    /// be loaded, we log a warning and carry on without it.
    pub fn new(config: PostprocessConfig) -> Self {
        let corrector = if config.spell_check {
            match &config.dictionary_path {
                Some(path) => match DictionaryCorrector::load(path) {
                    Ok(corrector) => Some(Arc::new(corrector) as Arc<dyn SpellCorrector>),
                    Err(err) => {
                        warn!("{err:#}; spell checking disabled");
                        None
                    }
                },
                None => {
                    warn!("No spelling dictionary configured; spell checking disabled");
                    None
                }
            }
        } else {
            None
        };
        Self { config, corrector }
    }

    /// Create a normalizer with a specific spelling corrector.
    #[cfg(test)]
    pub fn with_corrector(config: PostprocessConfig, corrector: Arc<dyn SpellCorrector>) -> Self {
        Self {
            config,
            corrector: Some(corrector),
        }
    }

    /// Is spelling correction active?
    pub fn spell_check_enabled(&self) -> bool {
        self.config.spell_check && self.corrector.is_some()
    }

    /// Clean up `text`. `confidence` is only used to warn about unreliable
    /// input.
    pub fn clean(&self, text: &str, confidence: f64) -> WithWarnings<String> {
        if text.is_empty() {
            return WithWarnings::ok(String::new());
        }
        if confidence < self.config.min_confidence {
            warn!(
                "Low confidence ({:.2}), results may be unreliable",
                confidence
            );
        }

        let mut cleaned = if self.config.remove_extra_spaces {
            normalize_whitespace(text)
        } else {
            text.to_owned()
        };
        cleaned = fix_common_errors(&cleaned);
        if self.config.remove_extra_spaces {
            // Dropped symbols can leave doubled or trailing spaces behind.
            cleaned = normalize_whitespace(&cleaned);
        }

        match &self.corrector {
            Some(corrector) if self.config.spell_check => match corrector.correct(&cleaned) {
                Ok(corrected) => WithWarnings::ok(corrected),
                Err(err) => WithWarnings::with_warning(
                    cleaned,
                    format!("spell checking failed: {err:#}"),
                ),
            },
            _ => WithWarnings::ok(cleaned),
        }
    }

    /// Clean several texts. Missing confidences default to 1.0.
    pub fn clean_batch(
        &self,
        texts: &[String],
        confidences: Option<&[f64]>,
    ) -> Vec<WithWarnings<String>> {
        texts
            .iter()
            .enumerate()
            .map(|(idx, text)| {
                let confidence = confidences
                    .and_then(|c| c.get(idx).copied())
                    .unwrap_or(1.0);
                self.clean(text, confidence)
            })
            .collect()
    }
}

/// Collapse runs of spaces, trim every line, and squeeze blank lines.
pub fn normalize_whitespace(text: &str) -> String {
    let text = SPACE_RUNS.replace_all(text, " ");
    let text = text.split('\n').map(str::trim).collect::<Vec<_>>().join("\n");
    let text = BLANK_LINE_RUNS.replace_all(&text, "\n\n");
    text.trim().to_owned()
}

/// Repair common OCR character confusions and drop unexpected symbols.
pub fn fix_common_errors(text: &str) -> String {
    let mut text = text.to_owned();
    for (pattern, replacement) in REPLACEMENTS.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    UNWANTED_SYMBOLS.replace_all(&text, "").into_owned()
}

/// Join non-blank texts (pages, usually) with `separator`.
pub fn combine_texts<S: AsRef<str>>(texts: &[S], separator: &str) -> String {
    texts
        .iter()
        .map(AsRef::as_ref)
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn no_spelling() -> PostprocessConfig {
        PostprocessConfig {
            spell_check: false,
            ..PostprocessConfig::default()
        }
    }

    fn clean(text: &str) -> String {
        TextNormalizer::new(no_spelling()).clean(text, 1.0).value
    }

    struct FailingCorrector;

    impl SpellCorrector for FailingCorrector {
        fn correct(&self, _text: &str) -> Result<String> {
            Err(anyhow!("dictionary exploded"))
        }
    }

    struct ShoutingCorrector;

    impl SpellCorrector for ShoutingCorrector {
        fn correct(&self, text: &str) -> Result<String> {
            Ok(text.to_uppercase())
        }
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert_eq!(clean(""), "");
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(
            clean("  Hello    world  \n\n\n\n  second   line  "),
            "Hello world\n\nsecond line"
        );
    }

    #[test]
    fn fixes_common_confusions() {
        assert_eq!(clean("l think 0 is ~ fine"), "I think O is - fine");
        assert_eq!(clean("x10 lid"), "x10 lid");
        assert_eq!(clean("‘quoted’ “text”"), "'quoted' \"text\"");
    }

    #[test]
    fn strips_unexpected_symbols() {
        assert_eq!(clean("a § b ★ c"), "a b c");
        assert_eq!(clean("cost: $5 (approx) = 5%"), "cost: $5 (approx) = 5%");
    }

    #[test]
    fn keeps_whitespace_when_disabled() {
        let config = PostprocessConfig {
            remove_extra_spaces: false,
            ..no_spelling()
        };
        let out = TextNormalizer::new(config).clean("a   b", 1.0).value;
        assert_eq!(out, "a   b");
    }

    #[test]
    fn low_confidence_does_not_change_output() {
        let normalizer = TextNormalizer::new(no_spelling());
        assert_eq!(
            normalizer.clean("some text", 0.1),
            normalizer.clean("some text", 0.9)
        );
    }

    #[test]
    fn spell_check_without_dictionary_is_disabled() {
        let normalizer = TextNormalizer::new(PostprocessConfig::default());
        assert!(!normalizer.spell_check_enabled());
        assert_eq!(normalizer.clean("teh", 1.0).value, "teh");
    }

    #[test]
    fn spell_check_uses_corrector() {
        let normalizer =
            TextNormalizer::with_corrector(PostprocessConfig::default(), Arc::new(ShoutingCorrector));
        let out = normalizer.clean("hello", 1.0);
        assert_eq!(out.value, "HELLO");
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn spell_check_failure_keeps_text_and_warns() {
        let normalizer =
            TextNormalizer::with_corrector(PostprocessConfig::default(), Arc::new(FailingCorrector));
        let out = normalizer.clean("  keep   me ", 1.0);
        assert_eq!(out.value, "keep me");
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("dictionary exploded"));
    }

    #[test]
    fn loads_dictionary_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, "answer 10\nthe 50\n").unwrap();
        let normalizer = TextNormalizer::new(PostprocessConfig {
            dictionary_path: Some(path),
            ..PostprocessConfig::default()
        });
        assert!(normalizer.spell_check_enabled());
        assert_eq!(normalizer.clean("Teh answr", 1.0).value, "The answer");
    }

    #[test]
    fn batch_defaults_confidence_and_keeps_order() {
        let normalizer = TextNormalizer::new(no_spelling());
        let out = normalizer.clean_batch(&["  a ".to_owned(), "b  c".to_owned()], None);
        let values = out.into_iter().map(|w| w.value).collect::<Vec<_>>();
        assert_eq!(values, vec!["a", "b c"]);
    }

    #[test]
    fn combine_skips_blank_segments() {
        assert_eq!(
            combine_texts(&["page one", "   ", "", "page two"], "\n\n"),
            "page one\n\npage two"
        );
        assert_eq!(combine_texts::<&str>(&[], "\n\n"), "");
    }

    proptest! {
        #[test]
        fn clean_is_idempotent(text in "[a-z0lO ~\n\t§★“”‘’.,!?é-]{0,80}") {
            let normalizer = TextNormalizer::new(no_spelling());
            let once = normalizer.clean(&text, 1.0).value;
            let twice = normalizer.clean(&once, 1.0).value;
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn clean_is_idempotent_without_whitespace_rules(text in "[a-z0l ~\n§“”.-]{0,60}") {
            let normalizer = TextNormalizer::new(PostprocessConfig {
                remove_extra_spaces: false,
                ..no_spelling()
            });
            let once = normalizer.clean(&text, 1.0).value;
            let twice = normalizer.clean(&once, 1.0).value;
            prop_assert_eq!(once, twice);
        }
    }
}
