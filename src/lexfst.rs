use anyhow::{anyhow, bail, Context, Result};
use rustfst::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

use crate::{StdVectorFst, WordId, MAX_WORD_LEN};

/// Failure label, reserved next to epsilon
pub const PHI_LABEL: usize = 1;
/// Opens an unknown-word spelling on the output tape
pub const UNK_OPEN: usize = 2;
/// Closes an unknown-word spelling
pub const UNK_CLOSE: usize = 3;
/// First character symbol
pub const CHAR_BASE: usize = 4;

const ROOT: StateId = 0;

/// Transducer from character sequences to word ids.
///
/// Known words form a trie hanging off the root: continuation arcs
/// consume a character and emit epsilon, the word-final character emits
/// the word symbol and returns to the root. Any character sequence is
/// additionally accepted as an unknown-word spelling bracketed by
/// x<unk> ... x</unk> on the output tape. Every arc costs nothing; the
/// language-model view supplies all weights during composition.
///
/// The symbol table is owned here: permanent symbols first (epsilon,
/// phi, the two delimiters, the characters, then the w<s> anchor), one
/// word symbol per lexicon entry after that.
#[derive(Debug, Clone)]
pub struct LexFst {
    fst: StdVectorFst,
    symbols: Vec<String>,
    /// Permanent prefix of `symbols`
    num_perm: usize,
    /// Character symbols, the two delimiters included
    num_chars: usize,
    words: Vec<Vec<usize>>,
    word_index: HashMap<Vec<usize>, WordId>,
    /// Continuation arcs of the known-word trie
    trie: HashMap<(StateId, usize), StateId>,
    separator: String,
    /// Symbol-file id to internal label, for fst-mode lattices
    ext_labels: Vec<usize>,
    sorted: bool,
}

impl LexFst {
    pub fn new(separator: &str) -> Self {
        LexFst {
            fst: StdVectorFst::new(),
            symbols: Vec::new(),
            num_perm: 0,
            num_chars: 0,
            words: Vec::new(),
            word_index: HashMap::new(),
            trie: HashMap::new(),
            separator: separator.to_string(),
            ext_labels: Vec::new(),
            sorted: true,
        }
    }

    /// Install the permanent symbols (ending with the w<s> anchor) and
    /// build the root and unknown-spelling arcs.
    pub fn set_perm_symbols(&mut self, perm: Vec<String>) -> Result<()> {
        if perm.len() < CHAR_BASE + 2 {
            bail!("permanent symbols must include at least one character");
        }
        if perm[perm.len() - 1] != "w<s>" {
            bail!("permanent symbols must end with the w<s> anchor");
        }
        self.symbols = perm;
        self.num_perm = self.symbols.len();
        self.num_chars = self.num_perm - 3;
        self.words.clear();
        self.word_index.clear();
        self.initialize_arcs()
    }

    /// Root state plus the unknown-spelling branch.
    pub fn initialize_arcs(&mut self) -> Result<()> {
        let mut fst = StdVectorFst::new();
        let root = fst.add_state();
        fst.set_start(root)?;
        fst.set_final(root, TropicalWeight::one())?;
        let entry = fst.add_state();
        let body = fst.add_state();
        fst.add_tr(
            root,
            Tr::new(
                EPS_LABEL,
                UNK_OPEN as Label,
                TropicalWeight::one(),
                entry,
            ),
        )?;
        for c in self.char_labels() {
            fst.add_tr(
                entry,
                Tr::new(c as Label, c as Label, TropicalWeight::one(), body),
            )?;
            fst.add_tr(
                body,
                Tr::new(c as Label, c as Label, TropicalWeight::one(), body),
            )?;
        }
        fst.add_tr(
            body,
            Tr::new(
                EPS_LABEL,
                UNK_CLOSE as Label,
                TropicalWeight::one(),
                root,
            ),
        )?;
        self.fst = fst;
        self.trie.clear();
        self.sorted = false;
        Ok(())
    }

    /// Initialise the permanent symbols from a symbol-table file
    /// ("symbol<TAB>id" per line, ids dense from 0, <eps> at 0) and
    /// remember the external ids so lattices can be relabelled on load.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let fh = File::open(path)
            .with_context(|| format!("couldn't open the symbol file {}", path.display()))?;
        let mut entries: Vec<(usize, String)> = Vec::new();
        for line in BufReader::new(fh).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let sym = fields.next().unwrap_or_default();
            let id: usize = fields
                .next()
                .ok_or_else(|| anyhow!("malformed symbol line: {}", line))?
                .parse()
                .with_context(|| format!("malformed symbol id in line: {}", line))?;
            entries.push((id, sym.to_string()));
        }
        entries.sort();
        let mut perm: Vec<String> = ["<eps>", "<phi>", "x<unk>", "x</unk>"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut ext = vec![EPS_LABEL as usize];
        for (pos, (id, sym)) in entries.iter().enumerate() {
            if *id != pos {
                bail!("symbol ids must be dense from 0, found {}", id);
            }
            if pos == 0 {
                if sym.as_str() != "<eps>" {
                    bail!("symbol 0 must be <eps>, found {}", sym);
                }
                continue;
            }
            ext.push(perm.len());
            perm.push(format!("x{}", sym));
        }
        perm.push("w<s>".to_string());
        self.ext_labels = ext;
        self.set_perm_symbols(perm)
    }

    /// Translate a lattice label from the symbol file's id space.
    pub fn external_label(&self, ext: usize) -> Result<usize> {
        self.ext_labels
            .get(ext)
            .copied()
            .ok_or_else(|| anyhow!("lattice label {} is not covered by the symbol file", ext))
    }

    /// Append a word, splicing its character path into the trie. An
    /// existing spelling returns its existing id.
    pub fn add_word(&mut self, chars: &[usize]) -> Result<WordId> {
        if let Some(&id) = self.word_index.get(chars) {
            return Ok(id);
        }
        if chars.is_empty() {
            bail!("a word needs at least one character");
        }
        if chars.len() > MAX_WORD_LEN {
            bail!(
                "word of {} characters exceeds the {} limit",
                chars.len(),
                MAX_WORD_LEN
            );
        }
        for &c in chars {
            if !self.is_char(c) {
                bail!("label {} is not a character", c);
            }
        }
        let id = self.words.len();
        let name: Vec<&str> = chars.iter().map(|&c| &self.symbols[c][1..]).collect();
        self.symbols.push(format!("w{}", name.join(&self.separator)));
        self.words.push(chars.to_vec());
        self.word_index.insert(chars.to_vec(), id);
        let mut state = ROOT;
        for &c in &chars[..chars.len() - 1] {
            state = match self.trie.get(&(state, c)) {
                Some(&s) => s,
                None => {
                    let next = self.fst.add_state();
                    self.fst.add_tr(
                        state,
                        Tr::new(c as Label, EPS_LABEL, TropicalWeight::one(), next),
                    )?;
                    self.trie.insert((state, c), next);
                    next
                }
            };
        }
        let last = chars[chars.len() - 1];
        self.fst.add_tr(
            state,
            Tr::new(
                last as Label,
                self.word_label(id) as Label,
                TropicalWeight::one(),
                ROOT,
            ),
        )?;
        self.sorted = false;
        Ok(id)
    }

    /// Read the word sequence off a linear path FST, registering any
    /// unknown-word span as a new lexicon entry. Epsilons on both tapes
    /// are skipped.
    pub fn parse_sample(&mut self, path: &StdVectorFst) -> Result<Vec<WordId>> {
        let mut words = Vec::new();
        let mut in_unk = false;
        let mut spelling: Vec<usize> = Vec::new();
        let mut state = path
            .start()
            .ok_or_else(|| anyhow!("sampled path has no start state"))?;
        loop {
            let trs = path.get_trs(state)?;
            let trs = trs.trs();
            if trs.is_empty() {
                if path.final_weight(state)?.is_none() {
                    bail!("sampled path ends in a non-final state");
                }
                break;
            }
            if trs.len() > 1 {
                bail!("sampled path is not linear at state {}", state);
            }
            let o = trs[0].olabel as usize;
            if o != EPS_LABEL as usize {
                if !in_unk {
                    if o == UNK_OPEN {
                        in_unk = true;
                    } else {
                        let w = self
                            .word_of_label(o)
                            .ok_or_else(|| anyhow!("unexpected label {} in sampled path", o))?;
                        words.push(w);
                    }
                } else if o == UNK_CLOSE {
                    in_unk = false;
                    let chars = std::mem::take(&mut spelling);
                    words.push(self.add_word(&chars)?);
                } else if self.is_char(o) {
                    spelling.push(o);
                } else {
                    bail!("unexpected label {} inside an unknown-word span", o);
                }
            }
            state = trs[0].nextstate;
        }
        if in_unk {
            bail!("unknown-word span was never closed");
        }
        Ok(words)
    }

    /// Rebuild, keeping only words with a slot in `remap`. The remap must
    /// number its survivors densely in old-id order, the way the word
    /// LM's trim emits it.
    pub fn retain_words(&mut self, remap: &[Option<WordId>]) -> Result<()> {
        let old_words = std::mem::take(&mut self.words);
        self.word_index.clear();
        self.symbols.truncate(self.num_perm);
        self.initialize_arcs()?;
        for (old, chars) in old_words.iter().enumerate() {
            if let Some(new) = remap.get(old).copied().flatten() {
                let got = self.add_word(chars)?;
                if got != new {
                    bail!("lexicon rebuild disagreed with the language-model remap");
                }
            }
        }
        Ok(())
    }

    /// Input-label sort so composition can binary-search the arcs.
    pub fn ensure_sorted(&mut self) {
        if !self.sorted {
            tr_sort(&mut self.fst, ILabelCompare {});
            self.sorted = true;
        }
    }

    pub fn fst(&self) -> &StdVectorFst {
        &self.fst
    }

    pub fn words(&self) -> &[Vec<usize>] {
        &self.words
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn perm_symbols(&self) -> &[String] {
        &self.symbols[..self.num_perm]
    }

    /// Character symbols, the two unknown-word delimiters included
    pub fn num_chars(&self) -> usize {
        self.num_chars
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Real character labels (the delimiters are output-only)
    pub fn char_labels(&self) -> std::ops::Range<usize> {
        CHAR_BASE..2 + self.num_chars
    }

    pub fn is_char(&self, label: usize) -> bool {
        (CHAR_BASE..2 + self.num_chars).contains(&label)
    }

    /// Symbol-table index of word `id`
    pub fn word_label(&self, id: WordId) -> usize {
        self.num_perm + id
    }

    /// First word symbol's index; words() index plus this is the label
    pub fn word_base(&self) -> usize {
        self.num_perm
    }

    pub fn word_of_label(&self, label: usize) -> Option<WordId> {
        if label >= self.num_perm && label - self.num_perm < self.words.len() {
            Some(label - self.num_perm)
        } else {
            None
        }
    }

    /// Printable form of a word: its symbol without the w prefix
    pub fn word_string(&self, id: WordId) -> &str {
        &self.symbols[self.num_perm + id][1..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc_lex() -> LexFst {
        let mut lex = LexFst::new("");
        let perm: Vec<String> = ["<eps>", "<phi>", "x<unk>", "x</unk>", "xa", "xb", "xc", "w<s>"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        lex.set_perm_symbols(perm).unwrap();
        lex
    }

    #[test]
    fn it_adds_words_idempotently() {
        let mut lex = abc_lex();
        let ab = lex.add_word(&[4, 5]).unwrap();
        let c = lex.add_word(&[6]).unwrap();
        assert_eq!(lex.add_word(&[4, 5]).unwrap(), ab);
        assert_eq!(lex.words().len(), 2);
        assert_eq!(lex.word_string(ab), "ab");
        assert_eq!(lex.word_string(c), "c");
    }

    #[test]
    fn it_joins_characters_with_the_separator() {
        let mut lex = LexFst::new("+");
        let perm: Vec<String> = ["<eps>", "<phi>", "x<unk>", "x</unk>", "xa", "xb", "w<s>"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        lex.set_perm_symbols(perm).unwrap();
        let ab = lex.add_word(&[4, 5]).unwrap();
        assert_eq!(lex.word_string(ab), "a+b");
    }

    #[test]
    fn it_rejects_non_characters() {
        let mut lex = abc_lex();
        assert!(lex.add_word(&[]).is_err());
        assert!(lex.add_word(&[1]).is_err());
        assert!(lex.add_word(&[99]).is_err());
    }

    #[test]
    fn it_parses_a_sample_with_an_unknown_span() {
        let mut lex = abc_lex();
        let ab = lex.add_word(&[4, 5]).unwrap();
        // known "ab", then unknown "ca"
        let mut path = StdVectorFst::new();
        let labels: Vec<(usize, usize)> = vec![
            (4, 0),
            (5, lex.word_label(ab)),
            (0, UNK_OPEN),
            (6, 6),
            (4, 4),
            (0, UNK_CLOSE),
        ];
        let mut state = path.add_state();
        path.set_start(state).unwrap();
        for (i, o) in labels {
            let next = path.add_state();
            path.add_tr(
                state,
                Tr::new(i as Label, o as Label, TropicalWeight::one(), next),
            )
            .unwrap();
            state = next;
        }
        path.set_final(state, TropicalWeight::one()).unwrap();
        let words = lex.parse_sample(&path).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], ab);
        assert_eq!(lex.words()[words[1]], vec![6, 4]);
        assert_eq!(lex.word_string(words[1]), "ca");
    }

    #[test]
    fn it_retains_only_remapped_words() {
        let mut lex = abc_lex();
        lex.add_word(&[4]).unwrap();
        lex.add_word(&[5]).unwrap();
        lex.add_word(&[6]).unwrap();
        lex.retain_words(&[None, Some(0), Some(1)]).unwrap();
        assert_eq!(lex.words().len(), 2);
        assert_eq!(lex.words()[0], vec![5]);
        assert_eq!(lex.words()[1], vec![6]);
        assert_eq!(lex.word_string(0), "b");
    }
}
