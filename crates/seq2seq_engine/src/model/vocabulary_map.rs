//! Source n-gram rules restricting the target vocabulary

use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::vocabulary::{Vocabulary, BOS_TOKEN, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN};

/// Maps space-joined source n-grams to lists of eligible target ids.
///
/// Rules are indexed by n-gram size. The ids listed under the empty source
/// key, plus the four special tokens, are always eligible.
pub struct VocabularyMap {
    map_rules: Vec<HashMap<String, Vec<usize>>>,
    fixed_candidates: BTreeSet<usize>,
}

impl VocabularyMap {
    /// Parses a map file: `src_ngram <TAB> tgt_tok1 tgt_tok2 …` per line.
    pub fn load(path: impl AsRef<Path>, vocabulary: &Vocabulary) -> Result<VocabularyMap> {
        let file = std::fs::File::open(path.as_ref()).map_err(|err| {
            Error::configuration(format!(
                "cannot open vocabulary map {}: {}",
                path.as_ref().display(),
                err
            ))
        })?;

        let mut map_rules: Vec<HashMap<String, Vec<usize>>> = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let (key, targets) = match line.split_once('\t') {
                Some(parts) => parts,
                None => {
                    return Err(Error::configuration(format!(
                        "vocabulary map line has no tab separator: {}",
                        line
                    )))
                }
            };
            let ngram = if key.is_empty() {
                1
            } else {
                key.split(' ').count()
            };
            let values: Vec<usize> = targets
                .split(' ')
                .filter(|token| !token.is_empty())
                .map(|token| vocabulary.to_id(token))
                .collect();
            if ngram > map_rules.len() {
                map_rules.resize_with(ngram, HashMap::new);
            }
            map_rules[ngram - 1].insert(key.to_string(), values);
        }

        let mut fixed_candidates = BTreeSet::new();
        for special in [PAD_TOKEN, UNK_TOKEN, BOS_TOKEN, EOS_TOKEN] {
            fixed_candidates.insert(vocabulary.to_id(special));
        }
        // The empty source key marks tokens that are always candidates.
        if let Some(always) = map_rules.first().and_then(|rules| rules.get("")) {
            fixed_candidates.extend(always.iter().copied());
        }

        Ok(VocabularyMap {
            map_rules,
            fixed_candidates,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.map_rules.is_empty()
    }

    pub fn fixed_candidates(&self) -> impl Iterator<Item = usize> + '_ {
        self.fixed_candidates.iter().copied()
    }

    /// Collects the eligible target ids for a batch of source sequences:
    /// the fixed candidates plus every rule matched by a sliding n-gram
    /// window over each sequence. The result is sorted and duplicate-free.
    pub fn get_candidates(&self, batch_tokens: &[Vec<String>]) -> Vec<i32> {
        let mut candidates = self.fixed_candidates.clone();
        for tokens in batch_tokens {
            for (ngram_index, rules) in self.map_rules.iter().enumerate() {
                let ngram = ngram_index + 1;
                if rules.is_empty() || tokens.len() < ngram {
                    continue;
                }
                for window in tokens.windows(ngram) {
                    let key = window.join(" ");
                    if let Some(values) = rules.get(&key) {
                        candidates.extend(values.iter().copied());
                    }
                }
            }
        }
        candidates.into_iter().map(|id| id as i32).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_map(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn vocabulary() -> Vocabulary {
        Vocabulary::from_tokens(
            [
                "<blank>", "<unk>", "<s>", "</s>", "hello", "world", "bonjour", "monde", "the",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }

    #[test]
    fn fixed_candidates_are_always_returned() {
        let vocab = vocabulary();
        let file = write_map("hello\tbonjour\n\tthe\n");
        let map = VocabularyMap::load(file.path(), &vocab).unwrap();

        let candidates = map.get_candidates(&[vec!["world".to_string()]]);
        for id in map.fixed_candidates() {
            assert!(candidates.contains(&(id as i32)));
        }
        assert!(candidates.contains(&(vocab.to_id("the") as i32)));
        assert!(!candidates.contains(&(vocab.to_id("bonjour") as i32)));
    }

    #[test]
    fn matched_rules_extend_the_candidates() {
        let vocab = vocabulary();
        let file = write_map("hello\tbonjour\nhello world\tmonde\n");
        let map = VocabularyMap::load(file.path(), &vocab).unwrap();

        let candidates =
            map.get_candidates(&[vec!["hello".to_string(), "world".to_string()]]);
        assert!(candidates.contains(&(vocab.to_id("bonjour") as i32)));
        assert!(candidates.contains(&(vocab.to_id("monde") as i32)));
    }

    #[test]
    fn result_is_sorted_and_unique() {
        let vocab = vocabulary();
        let file = write_map("hello\tbonjour bonjour monde\n");
        let map = VocabularyMap::load(file.path(), &vocab).unwrap();

        let candidates = map.get_candidates(&[
            vec!["hello".to_string()],
            vec!["hello".to_string()],
        ]);
        let mut sorted = candidates.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(candidates, sorted);
    }
}
