//! Dictionary-based spelling correction.
//!
//! This is the classic edit-distance approach: for an unknown word, try every
//! string one edit away, then two edits away, and pick the most frequent word
//! we know. It needs nothing but a word-frequency list.

use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;

use crate::prelude::*;

/// Something that can fix spelling mistakes in a text.
pub trait SpellCorrector: Send + Sync {
    fn correct(&self, text: &str) -> Result<String>;
}

/// Letters tried when generating edits.
const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

/// Words longer than this only get single-edit corrections, because the
/// two-edit candidate set grows quadratically.
const MAX_LEN_FOR_TWO_EDITS: usize = 12;

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+").expect("failed to compile regex"));

/// Corrects words against a frequency-weighted dictionary.
#[derive(Debug, Default)]
pub struct DictionaryCorrector {
    frequencies: HashMap<String, u64>,
}

impl DictionaryCorrector {
    /// Load a dictionary file with one `word` or `word count` per line.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("could not read dictionary {}", path.display()))?;
        let corrector = Self::parse(&data)
            .with_context(|| format!("could not parse dictionary {}", path.display()))?;
        info!(
            path = %path.display(),
            words = corrector.frequencies.len(),
            "Loaded spelling dictionary"
        );
        Ok(corrector)
    }

    /// Parse dictionary text. Words without a count get a count of 1.
    pub fn parse(data: &str) -> Result<Self> {
        let mut frequencies = HashMap::new();
        for (idx, line) in data.lines().enumerate() {
            let mut parts = line.split_whitespace();
            let Some(word) = parts.next() else {
                continue;
            };
            let count = match parts.next() {
                Some(count) => count
                    .parse::<u64>()
                    .with_context(|| format!("bad count on line {}: {line:?}", idx + 1))?,
                None => 1,
            };
            *frequencies.entry(word.to_lowercase()).or_insert(0) += count;
        }
        if frequencies.is_empty() {
            return Err(anyhow!("dictionary is empty"));
        }
        Ok(Self { frequencies })
    }

    /// Correct a single lowercase word, returning the original if nothing
    /// better is known.
    pub fn correct_word(&self, word: &str) -> String {
        if self.frequencies.contains_key(word) {
            return word.to_owned();
        }
        let edits = edits1(word);
        if let Some(best) = self.most_frequent(edits.iter()) {
            return best.to_owned();
        }
        if word.chars().count() <= MAX_LEN_FOR_TWO_EDITS {
            let edits2 = edits.iter().flat_map(|edit| edits1(edit)).collect::<Vec<_>>();
            if let Some(best) = self.most_frequent(edits2.iter()) {
                return best.to_owned();
            }
        }
        word.to_owned()
    }

    fn most_frequent<'a>(&'a self, candidates: impl Iterator<Item = &'a String>) -> Option<&'a str> {
        candidates
            .filter_map(|candidate| {
                self.frequencies
                    .get_key_value(candidate.as_str())
                    .map(|(word, count)| (word, *count))
            })
            // Ties go to the alphabetically first word, for stable output.
            .max_by(|(w1, c1), (w2, c2)| c1.cmp(c2).then_with(|| w2.cmp(w1)))
            .map(|(word, _)| word.as_str())
    }
}

impl SpellCorrector for DictionaryCorrector {
    fn correct(&self, text: &str) -> Result<String> {
        Ok(WORD_RE
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let word = &caps[0];
                let corrected = self.correct_word(&word.to_lowercase());
                match_case(word, &corrected)
            })
            .into_owned())
    }
}

/// Every string one insertion, deletion, substitution or transposition away.
fn edits1(word: &str) -> Vec<String> {
    let chars = word.chars().collect::<Vec<_>>();
    let n = chars.len();
    let mut edits = Vec::with_capacity(54 * n + 26);
    let join = |left: &[char], mid: &str, right: &[char]| {
        let mut s = String::with_capacity(n + 1);
        s.extend(left);
        s.push_str(mid);
        s.extend(right);
        s
    };
    for i in 0..=n {
        let (left, right) = chars.split_at(i);
        if !right.is_empty() {
            edits.push(join(left, "", &right[1..]));
        }
        if right.len() > 1 {
            let swapped = format!("{}{}", right[1], right[0]);
            edits.push(join(left, &swapped, &right[2..]));
        }
        for c in ALPHABET.chars() {
            let mut buf = [0u8; 4];
            let c = c.encode_utf8(&mut buf);
            if !right.is_empty() {
                edits.push(join(left, c, &right[1..]));
            }
            edits.push(join(left, c, right));
        }
    }
    edits
}

/// Apply the capitalization pattern of `original` to `corrected`.
fn match_case(original: &str, corrected: &str) -> String {
    if original.chars().all(|c| c.is_uppercase()) && original.chars().count() > 1 {
        corrected.to_uppercase()
    } else if original.chars().next().is_some_and(char::is_uppercase) {
        let mut chars = corrected.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    } else {
        corrected.to_owned()
    }
}
