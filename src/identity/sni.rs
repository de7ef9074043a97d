//! Generated SNI names
//!
//! Names are stitched from fragments of a word corpus, e.g.
//! `tionmark-cloud.net` or `sortwave.io`. The corpus is read once into one
//! contiguous buffer with a `u32` offset index, so concurrent callers
//! share it without locking and nothing re-reads the file per call.

use super::IdentityError;
use rand::seq::IndexedRandom;
use rand::Rng;
use std::path::Path;

/// Top-level domains appended to generated names
const TLDS: &[&str] = &["com", "net", "org", "io", "co", "info", "app", "dev"];

const SEPARATORS: &[&str] = &["-", ".", ""];

const MIN_FRAGMENT: usize = 3;
const MAX_FRAGMENT: usize = 10;

/// Used when no word file is configured
const BUILTIN_WORDS: &str = "\
account address advance amber anchor archive arrow atlas autumn beacon \
binary blossom border bridge bright bucket butter cabin camera canyon \
carbon castle center channel circle classic cloud cobalt comet copper \
corner cosmos cotton crystal current dancer delta desert digital dragon \
echo eleven ember engine falcon feather field filter forest fortune \
galaxy garden gentle glacier global golden granite harbor harvest hollow \
horizon island jasmine jungle kernel lantern lemon liberty linear market \
meadow mental metro mirror mobile modern morning motion native network \
noble north ocean office orange orbit palace panel paper pepper planet \
pocket portal prairie prime pulse quartz radar random raven rhythm river \
rocket saddle sample scarlet second signal silver simple socket solar \
spring station stream summit sunset system tablet temple thunder timber \
tower travel tunnel union update valley vector velvet violet vision \
voyage wander window winter wonder yellow zenith";

/// Plausible-looking SNI generator
pub struct SniManager {
    /// All words back to back
    corpus: String,
    /// Start offset of each word; the end is the next offset
    offsets: Vec<u32>,
    /// Fixed names, used verbatim instead of generating
    fixed: Vec<String>,
}

impl SniManager {
    /// Generator over the built-in word list
    pub fn builtin() -> Self {
        Self::from_words(BUILTIN_WORDS.split_whitespace())
    }

    /// Generator over a word file (one or more words per line)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, IdentityError> {
        let text = std::fs::read_to_string(path)?;
        let manager = Self::from_words(text.split_whitespace());
        if manager.offsets.is_empty() {
            return Err(IdentityError::EmptyCorpus);
        }
        Ok(manager)
    }

    /// Always hand out one of `names`
    pub fn fixed(names: Vec<String>) -> Self {
        let mut manager = Self::builtin();
        manager.fixed = names;
        manager
    }

    fn from_words<'a>(words: impl Iterator<Item = &'a str>) -> Self {
        let mut corpus = String::new();
        let mut offsets = Vec::new();

        for word in words {
            let cleaned: String = word
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            if cleaned.len() < MIN_FRAGMENT {
                continue;
            }
            offsets.push(corpus.len() as u32);
            corpus.push_str(&cleaned);
        }

        Self {
            corpus,
            offsets,
            fixed: Vec::new(),
        }
    }

    /// Number of words in the corpus
    pub fn word_count(&self) -> usize {
        self.offsets.len()
    }

    fn word(&self, index: usize) -> &str {
        let start = self.offsets[index] as usize;
        let end = self
            .offsets
            .get(index + 1)
            .map(|o| *o as usize)
            .unwrap_or(self.corpus.len());
        &self.corpus[start..end]
    }

    /// Random slice of a random word
    fn fragment(&self, rng: &mut impl Rng) -> String {
        let word = self.word(rng.random_range(0..self.offsets.len()));
        if word.len() <= MIN_FRAGMENT {
            return word.to_string();
        }
        let len = rng.random_range(MIN_FRAGMENT..=word.len().min(MAX_FRAGMENT));
        let start = rng.random_range(0..=word.len() - len);
        word[start..start + len].to_string()
    }

    /// A new SNI
    pub fn get(&self) -> String {
        let mut rng = rand::rng();

        if let Some(name) = self.fixed.choose(&mut rng) {
            return name.clone();
        }
        if self.offsets.is_empty() {
            return format!("www.{}.com", crate::crypto::random_lowercase(8));
        }

        let count = rng.random_range(2..=3);
        let separator = SEPARATORS.choose(&mut rng).copied().unwrap_or("");
        let fragments: Vec<String> = (0..count).map(|_| self.fragment(&mut rng)).collect();
        let tld = TLDS.choose(&mut rng).copied().unwrap_or("com");

        format!("{}.{}", fragments.join(separator), tld)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_valid_hostname(name: &str) -> bool {
        name.len() <= 253
            && name.split('.').count() >= 2
            && name.split('.').all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            })
    }

    #[test]
    fn test_generated_names_are_hostnames() {
        let sni = SniManager::builtin();
        assert!(sni.word_count() > 100);

        for _ in 0..500 {
            let name = sni.get();
            assert!(is_valid_hostname(&name), "bad sni {}", name);
            let tld = name.rsplit('.').next().unwrap();
            assert!(TLDS.contains(&tld));
        }
    }

    #[test]
    fn test_names_vary() {
        let sni = SniManager::builtin();
        let names: std::collections::HashSet<String> = (0..50).map(|_| sni.get()).collect();
        assert!(names.len() > 40);
    }

    #[test]
    fn test_word_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, "Alpha\nbeta gamma\nx\n").unwrap();

        let sni = SniManager::from_file(&path).unwrap();
        assert_eq!(sni.word_count(), 3);
        assert_eq!(sni.word(0), "alpha");
        assert_eq!(sni.word(2), "gamma");

        std::fs::write(&path, "a b\n").unwrap();
        assert!(matches!(
            SniManager::from_file(&path),
            Err(IdentityError::EmptyCorpus)
        ));
    }

    #[test]
    fn test_fixed_names() {
        let sni = SniManager::fixed(vec!["www.google.com".into()]);
        assert_eq!(sni.get(), "www.google.com");
    }
}
