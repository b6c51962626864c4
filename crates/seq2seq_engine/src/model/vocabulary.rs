//! Token vocabulary with reserved special tokens

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};

pub const PAD_TOKEN: &str = "<blank>";
pub const UNK_TOKEN: &str = "<unk>";
pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";

/// Ordered token list with a bidirectional token <-> id map.
///
/// Out-of-vocabulary lookups resolve to the unknown token id.
pub struct Vocabulary {
    tokens: Vec<String>,
    ids: HashMap<String, usize>,
}

impl Vocabulary {
    /// Loads a vocabulary file: one token per line, id = line number.
    /// Special tokens missing from the file are appended.
    pub fn load(path: impl AsRef<Path>) -> Result<Vocabulary> {
        let file = std::fs::File::open(path.as_ref()).map_err(|err| {
            Error::configuration(format!(
                "cannot open vocabulary {}: {}",
                path.as_ref().display(),
                err
            ))
        })?;
        let mut tokens = Vec::new();
        for line in BufReader::new(file).lines() {
            tokens.push(line?);
        }
        Ok(Vocabulary::from_tokens(tokens))
    }

    pub fn from_tokens(tokens: Vec<String>) -> Vocabulary {
        let mut vocabulary = Vocabulary {
            tokens: Vec::with_capacity(tokens.len()),
            ids: HashMap::with_capacity(tokens.len()),
        };
        for token in tokens {
            vocabulary.add(token);
        }
        for special in [PAD_TOKEN, UNK_TOKEN, BOS_TOKEN, EOS_TOKEN] {
            if !vocabulary.ids.contains_key(special) {
                vocabulary.add(special.to_string());
            }
        }
        vocabulary
    }

    fn add(&mut self, token: String) {
        if !self.ids.contains_key(&token) {
            self.ids.insert(token.clone(), self.tokens.len());
            self.tokens.push(token);
        }
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    /// Token to id; unknown tokens map to the `<unk>` id.
    pub fn to_id(&self, token: &str) -> usize {
        match self.ids.get(token) {
            Some(&id) => id,
            None => self.ids[UNK_TOKEN],
        }
    }

    pub fn to_token(&self, id: usize) -> Result<&str> {
        self.tokens
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::precondition(format!(
                    "token id {} out of range for vocabulary of {} tokens",
                    id,
                    self.tokens.len()
                ))
            })
    }

    pub fn bos_id(&self) -> usize {
        self.to_id(BOS_TOKEN)
    }

    pub fn eos_id(&self) -> usize {
        self.to_id(EOS_TOKEN)
    }
}
