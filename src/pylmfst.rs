use anyhow::{bail, Result};
use std::collections::HashMap;

use crate::lexfst::{LexFst, UNK_CLOSE, UNK_OPEN};
use crate::pylm::PyLm;
use crate::WordId;

/// Stand-in for a just-spelled word with no lexicon entry yet. It
/// matches no context-trie edge, exactly like the fresh id will once the
/// parse step allocates it.
const UNK_WORD: usize = usize::MAX;

/// The two language models viewed as a weighted automaton over the
/// lexicon's output labels, expanded on demand.
///
/// A state is a language-model history: the last words of the sentence
/// so far, or that plus the recent characters of an unknown spelling in
/// progress. Known-word arcs carry the exact smoothed cost, so back-off
/// needs no failure arc at this layer; the x<unk> entry arc carries the
/// full back-off-to-base weight and the character model prices each
/// character of the spelling.
pub struct PylmFst<'a> {
    known_lm: &'a PyLm,
    unk_lm: &'a PyLm,
    lex: &'a LexFst,
    /// Spelling likelihood of every lexicon word under the character LM
    word_bases: Vec<f64>,
    /// Uniform character base probability
    unk_base: f64,
    states: Vec<LmHistory>,
    ids: HashMap<LmHistory, usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum LmHistory {
    /// Between words: the most recent word ids
    Words(Vec<WordId>),
    /// Inside an unknown span: the word history on entry plus the most
    /// recent characters of the spelling
    Chars(Vec<WordId>, Vec<usize>),
}

impl<'a> PylmFst<'a> {
    pub fn new(known_lm: &'a PyLm, unk_lm: &'a PyLm, lex: &'a LexFst, unk_bases: &[f64]) -> Self {
        let word_bases = lex
            .words()
            .iter()
            .map(|chars| unk_lm.sentence_prob(chars, unk_bases).exp())
            .collect();
        PylmFst {
            known_lm,
            unk_lm,
            lex,
            word_bases,
            unk_base: 1.0 / lex.num_chars() as f64,
            states: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// State of the empty history.
    pub fn start(&mut self) -> usize {
        self.intern(LmHistory::Words(Vec::new()))
    }

    /// True when the state may end the sentence (not mid-spelling).
    pub fn can_finish(&self, state: usize) -> bool {
        matches!(self.states[state], LmHistory::Words(_))
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// The arc consuming `olabel` out of `state`: negative-log cost and
    /// the next state. Epsilon never reaches here; a label the lexicon
    /// could not have emitted in this position is an invariant violation.
    pub fn arc(&mut self, state: usize, olabel: usize) -> Result<(f64, usize)> {
        match self.states[state].clone() {
            LmHistory::Words(ctx) => {
                if let Some(w) = self.lex.word_of_label(olabel) {
                    let p = self.known_lm.prob(&ctx, w, self.word_bases[w]);
                    let next = push_trunc(&ctx, w, self.known_lm.n() - 1);
                    let id = self.intern(LmHistory::Words(next));
                    Ok((-p.ln(), id))
                } else if olabel == UNK_OPEN {
                    let f = self.known_lm.backoff_to_base(&ctx);
                    let id = self.intern(LmHistory::Chars(ctx, Vec::new()));
                    Ok((-f.ln(), id))
                } else {
                    bail!("label {} cannot follow a word history", olabel)
                }
            }
            LmHistory::Chars(words, chars) => {
                if olabel == UNK_CLOSE {
                    let next = push_trunc(&words, UNK_WORD, self.known_lm.n() - 1);
                    let id = self.intern(LmHistory::Words(next));
                    Ok((0.0, id))
                } else if self.lex.is_char(olabel) {
                    let p = self.unk_lm.prob(&chars, olabel, self.unk_base);
                    let next = push_trunc(&chars, olabel, self.unk_lm.n() - 1);
                    let id = self.intern(LmHistory::Chars(words, next));
                    Ok((-p.ln(), id))
                } else {
                    bail!("label {} cannot appear inside an unknown-word span", olabel)
                }
            }
        }
    }

    fn intern(&mut self, h: LmHistory) -> usize {
        if let Some(&id) = self.ids.get(&h) {
            return id;
        }
        let id = self.states.len();
        self.states.push(h.clone());
        self.ids.insert(h, id);
        id
    }
}

/// History extended by one token, truncated to the newest `keep`.
fn push_trunc(ctx: &[usize], next: usize, keep: usize) -> Vec<usize> {
    let mut out = ctx.to_vec();
    out.push(next);
    if out.len() > keep {
        let cut = out.len() - keep;
        out.drain(..cut);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexfst::LexFst;
    use crate::pylm::PyLm;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_world() -> (PyLm, PyLm, LexFst) {
        let mut lex = LexFst::new("");
        let perm: Vec<String> = ["<eps>", "<phi>", "x<unk>", "x</unk>", "xa", "xb", "w<s>"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        lex.set_perm_symbols(perm).unwrap();
        lex.add_word(&[4, 5]).unwrap();
        lex.add_word(&[4]).unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let mut known = PyLm::new(2);
        let mut unk = PyLm::new(2);
        let bases = vec![0.25; 4];
        known.calc_sentence(&[0, 1, 0], &bases, true, &mut rng).unwrap();
        unk.calc_sentence(&[4, 5], &bases, true, &mut rng).unwrap();
        (known, unk, lex)
    }

    #[test]
    fn it_prices_known_words_with_the_smoothed_model() {
        let (known, unk, lex) = small_world();
        let unk_bases = vec![0.25; crate::MAX_WORD_LEN];
        let mut view = PylmFst::new(&known, &unk, &lex, &unk_bases);
        let start = view.start();
        let (cost, next) = view.arc(start, lex.word_label(0)).unwrap();
        let base = unk.sentence_prob(&[4, 5], &unk_bases).exp();
        let expect = -known.prob(&[], 0, base).ln();
        assert!((cost - expect).abs() < 1e-9);
        assert!(view.can_finish(next));
    }

    #[test]
    fn it_walks_the_character_model_through_an_unknown_span() {
        let (known, unk, lex) = small_world();
        let unk_bases = vec![0.25; crate::MAX_WORD_LEN];
        let mut view = PylmFst::new(&known, &unk, &lex, &unk_bases);
        let start = view.start();
        let (enter, s1) = view.arc(start, UNK_OPEN).unwrap();
        assert!((enter - -known.backoff_to_base(&[]).ln()).abs() < 1e-9);
        assert!(!view.can_finish(s1));
        let (c1, s2) = view.arc(s1, 4).unwrap();
        assert!((c1 - -unk.prob(&[], 4, 0.25).ln()).abs() < 1e-9);
        let (c2, s3) = view.arc(s2, 5).unwrap();
        assert!((c2 - -unk.prob(&[4], 5, 0.25).ln()).abs() < 1e-9);
        let (exit, s4) = view.arc(s3, UNK_CLOSE).unwrap();
        assert_eq!(exit, 0.0);
        assert!(view.can_finish(s4));
    }

    #[test]
    fn it_rejects_labels_the_lexicon_cannot_emit() {
        let (known, unk, lex) = small_world();
        let unk_bases = vec![0.25; crate::MAX_WORD_LEN];
        let mut view = PylmFst::new(&known, &unk, &lex, &unk_bases);
        let start = view.start();
        assert!(view.arc(start, UNK_CLOSE).is_err());
        assert!(view.arc(start, 4).is_err());
    }
}
