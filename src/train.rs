use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustfst::prelude::*;
use rustfst::utils::acceptor;
use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

use crate::lexfst::LexFst;
use crate::pylm::PyLm;
use crate::pylmfst::PylmFst;
use crate::sampler;
use crate::{StdVectorFst, WordId, MAX_WORD_LEN};

/// Where the training sequences come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// One whitespace-separated sentence per line
    Text,
    /// One binary lattice per file, tropical semiring
    Fst,
}

/// Everything the trainer needs to know; mirrors the command line.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Iterations before snapshots begin
    pub burn_in: usize,
    /// Number of annealing plateaus
    pub anneal_steps: usize,
    /// Iterations per plateau
    pub anneal_step_length: usize,
    /// Total iterations past index 0
    pub num_samples: usize,
    /// Iterations between snapshots once burned in
    pub sample_rate: usize,
    /// Iterations between trims
    pub trim_rate: usize,
    /// Word LM order
    pub known_n: usize,
    /// Character LM order
    pub unk_n: usize,
    /// Beam for path pruning; 0 disables
    pub prune_threshold: f64,
    /// Acoustic scale applied to lattice weights on load
    pub am_scale: f64,
    pub input: InputKind,
    pub input_files: Vec<PathBuf>,
    /// Symbol table, required for fst input
    pub symbol_file: Option<PathBuf>,
    /// Prefix for every output artifact
    pub prefix: String,
    /// Joins characters when printing words
    pub separator: String,
    /// Keep fst-mode lattices in memory between iterations
    pub cache_input: bool,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            burn_in: 20,
            anneal_steps: 5,
            anneal_step_length: 3,
            num_samples: 100,
            sample_rate: 1,
            trim_rate: 1,
            known_n: 3,
            unk_n: 3,
            prune_threshold: 0.0,
            am_scale: 0.2,
            input: InputKind::Text,
            input_files: Vec::new(),
            symbol_file: None,
            prefix: String::new(),
            separator: String::new(),
            cache_input: false,
            seed: 42,
        }
    }
}

/// Blocked Gibbs training: every iteration resamples each sequence's
/// segmentation against the current models, then the hyperparameters,
/// trimming dead words and emitting snapshots as configured.
#[derive(Debug)]
pub struct Trainer {
    config: TrainConfig,
    rng: StdRng,
    lex: LexFst,
    known_lm: PyLm,
    unk_lm: PyLm,
    input_fsts: Vec<Option<StdVectorFst>>,
    histories: Vec<Vec<WordId>>,
    unk_bases: Vec<f64>,
    anneal_level: f64,
    known_likelihood: f64,
    unk_likelihood: f64,
    lattice_likelihood: f64,
}

impl Trainer {
    pub fn new(mut config: TrainConfig) -> Result<Self> {
        if config.input_files.is_empty() {
            bail!("no input files specified");
        }
        if config.prefix.is_empty() {
            bail!("no output prefix was specified");
        }
        if config.known_n < 1 || config.unk_n < 1 {
            bail!("language model orders must be at least 1");
        }
        if config.sample_rate < 1 || config.trim_rate < 1 || config.anneal_step_length < 1 {
            bail!("rates and step lengths must be at least 1");
        }
        for path in &config.input_files {
            if !path.is_file() {
                bail!("couldn't find input file {}", path.display());
            }
        }
        let mut lex = LexFst::new(&config.separator);
        let input_fsts: Vec<Option<StdVectorFst>>;
        match config.input {
            InputKind::Text => {
                config.cache_input = true;
                let (fsts, perm) = load_text(&config.input_files)?;
                lex.set_perm_symbols(perm)?;
                input_fsts = fsts.into_iter().map(Some).collect();
            }
            InputKind::Fst => {
                let sym = config
                    .symbol_file
                    .as_ref()
                    .ok_or_else(|| anyhow!("no symbol file was set"))?;
                lex.load(sym)?;
                input_fsts = vec![None; config.input_files.len()];
            }
        }
        info!(
            num_chars = lex.num_chars(),
            sequences = input_fsts.len(),
            "loaded symbols"
        );
        let unk_bases = vec![1.0 / lex.num_chars() as f64; MAX_WORD_LEN];
        Ok(Trainer {
            known_lm: PyLm::new(config.known_n),
            unk_lm: PyLm::new(config.unk_n),
            rng: StdRng::seed_from_u64(config.seed),
            histories: vec![Vec::new(); input_fsts.len()],
            lex,
            input_fsts,
            unk_bases,
            anneal_level: 0.0,
            known_likelihood: 0.0,
            unk_likelihood: 0.0,
            lattice_likelihood: 0.0,
            config,
        })
    }

    /// Run the full schedule: burn-in, annealing, sampling, trimming and
    /// snapshot emission.
    pub fn train(&mut self) -> Result<()> {
        for iter in 0..=self.config.num_samples {
            self.known_likelihood = 0.0;
            self.unk_likelihood = 0.0;
            self.lattice_likelihood = 0.0;
            // integer division first: the schedule moves in plateaus,
            // and the whole first plateau draws paths uniformly
            let level = (iter + self.config.anneal_step_length - 1) / self.config.anneal_step_length;
            self.anneal_level = if level == 0 {
                0.0
            } else {
                1.0 / f64::max(1.0, self.config.anneal_steps as f64 - level as f64)
            };
            let started = Instant::now();
            for s in 0..self.histories.len() {
                self.single_sample(s)?;
            }
            debug!(
                iter,
                seconds = started.elapsed().as_secs_f64(),
                "finished sampling pass"
            );
            self.known_lm.sample_parameters(&mut self.rng)?;
            self.unk_lm.sample_parameters(&mut self.rng)?;
            self.log_status(iter);
            if iter % self.config.trim_rate == 0 {
                self.trim_models()?;
            }
            if iter >= self.config.burn_in
                && (iter - self.config.burn_in) % self.config.sample_rate == 0
            {
                info!(iter, "writing snapshot");
                self.write_snapshot(iter)?;
            }
        }
        Ok(())
    }

    /// Resample one sequence: unseat its old analysis, draw a path from
    /// the composed lattice, parse it back and seat the new analysis.
    fn single_sample(&mut self, s: usize) -> Result<()> {
        if !self.histories[s].is_empty() {
            self.remove_sample(s)?;
        }
        let input = self.input_fst(s)?;
        self.lex.ensure_sorted();
        let sampled = {
            let mut view = PylmFst::new(&self.known_lm, &self.unk_lm, &self.lex, &self.unk_bases);
            sampler::sample_path(
                &input,
                self.lex.fst(),
                &mut view,
                self.config.prune_threshold,
                self.anneal_level,
                &mut self.rng,
            )?
        };
        self.histories[s] = self.lex.parse_sample(&sampled)?;
        self.add_sample(s)?;
        let mut q = sampled
            .start()
            .ok_or_else(|| anyhow!("sampled path has no start state"))?;
        loop {
            let trs = sampled.get_trs(q)?;
            let trs = trs.trs();
            if trs.is_empty() {
                break;
            }
            self.lattice_likelihood += *trs[0].weight.value() as f64;
            q = trs[0].nextstate;
        }
        Ok(())
    }

    /// Unseat a sequence from the word LM, and its base-position
    /// spellings from the character LM.
    fn remove_sample(&mut self, s: usize) -> Result<()> {
        self.known_lm
            .remove_customers(&self.histories[s], &mut self.rng)?;
        let positions = self.known_lm.base_positions().to_vec();
        for j in positions {
            let w = self.histories[s][j];
            self.unk_lm
                .remove_customers(&self.lex.words()[w], &mut self.rng)?;
        }
        Ok(())
    }

    /// Seat a sequence in the word LM, spelling out base-position words
    /// through the character LM.
    fn add_sample(&mut self, s: usize) -> Result<()> {
        let bases: Vec<f64> = self.histories[s]
            .iter()
            .map(|&w| {
                self.unk_lm
                    .sentence_prob(&self.lex.words()[w], &self.unk_bases)
                    .exp()
            })
            .collect();
        self.known_likelihood -=
            self.known_lm
                .calc_sentence(&self.histories[s], &bases, true, &mut self.rng)?;
        let positions = self.known_lm.base_positions().to_vec();
        for j in positions {
            let w = self.histories[s][j];
            self.unk_likelihood -= self.unk_lm.calc_sentence(
                &self.lex.words()[w],
                &self.unk_bases,
                true,
                &mut self.rng,
            )?;
        }
        Ok(())
    }

    /// The lattice for sequence `s`, loading and caching as configured.
    fn input_fst(&mut self, s: usize) -> Result<StdVectorFst> {
        if let Some(fst) = &self.input_fsts[s] {
            return Ok(fst.clone());
        }
        let path = &self.config.input_files[s];
        let raw = StdVectorFst::read(path)
            .with_context(|| format!("couldn't read the lattice {}", path.display()))?;
        let fst = self.relabel_and_scale(&raw)?;
        if self.config.cache_input {
            self.input_fsts[s] = Some(fst.clone());
        }
        Ok(fst)
    }

    /// Map lattice labels into our symbol space and apply the acoustic
    /// scale to every weight.
    fn relabel_and_scale(&self, raw: &StdVectorFst) -> Result<StdVectorFst> {
        let mut fst = StdVectorFst::new();
        for _ in 0..raw.num_states() {
            fst.add_state();
        }
        if let Some(s) = raw.start() {
            fst.set_start(s)?;
        }
        let scale = self.config.am_scale as f32;
        for q in raw.states_iter() {
            let trs = raw.get_trs(q)?;
            for tr in trs.trs() {
                let lab = if tr.ilabel == EPS_LABEL {
                    EPS_LABEL
                } else {
                    self.lex.external_label(tr.ilabel as usize)? as Label
                };
                fst.add_tr(
                    q,
                    Tr::new(
                        lab,
                        lab,
                        TropicalWeight::new(*tr.weight.value() * scale),
                        tr.nextstate,
                    ),
                )?;
            }
            if let Some(w) = raw.final_weight(q)? {
                fst.set_final(q, TropicalWeight::new(*w.value() * scale))?;
            }
        }
        tr_sort(&mut fst, OLabelCompare {});
        Ok(fst)
    }

    /// Trim both LMs, rebuild the lexicon around the surviving words and
    /// renumber every history.
    fn trim_models(&mut self) -> Result<()> {
        let remap = self.known_lm.trim_to_remap(self.lex.words().len())?;
        self.unk_lm.trim()?;
        self.lex.retain_words(&remap)?;
        for hist in &mut self.histories {
            for w in hist.iter_mut() {
                *w = remap[*w].ok_or_else(|| anyhow!("history refers to a trimmed word"))?;
            }
        }
        Ok(())
    }

    fn log_status(&self, iter: usize) {
        info!(
            iter,
            anneal = self.anneal_level,
            lm = self.known_likelihood + self.unk_likelihood,
            word = self.known_likelihood,
            unk = self.unk_likelihood,
            lattice = self.lattice_likelihood,
            "finished iteration"
        );
        info!(
            word_vocab = self.known_lm.vocab_size(),
            char_vocab = self.unk_lm.vocab_size(),
            word_contexts = self.known_lm.size(),
            char_contexts = self.unk_lm.size(),
            "model size"
        );
        for i in 0..self.known_lm.n() {
            debug!(
                order = i + 1,
                strength = self.known_lm.strength(i),
                discount = self.known_lm.discount(i),
                "word LM level"
            );
        }
        for i in 0..self.unk_lm.n() {
            debug!(
                order = i + 1,
                strength = self.unk_lm.strength(i),
                discount = self.unk_lm.discount(i),
                "character LM level"
            );
        }
    }

    /// Spelling likelihood of every lexicon word under the character LM.
    pub fn calculate_word_bases(&self) -> Vec<f64> {
        self.lex
            .words()
            .iter()
            .map(|w| self.unk_lm.sentence_prob(w, &self.unk_bases).exp())
            .collect()
    }

    fn snapshot_path(&self, kind: &str, iter: usize) -> PathBuf {
        PathBuf::from(format!("{}{}.{}", self.config.prefix, kind, iter))
    }

    /// Emit the character LM, word LM, current segmentations and symbol
    /// table with this iteration's suffix.
    fn write_snapshot(&self, iter: usize) -> Result<()> {
        let symbols = self.lex.symbols();
        let char_bases = vec![1.0 / self.lex.num_chars() as f64; symbols.len()];
        self.write_lm(&self.unk_lm, symbols, &char_bases, "ulm", iter)?;
        let word_bases = self.calculate_word_bases();
        self.write_lm(
            &self.known_lm,
            &symbols[self.lex.word_base()..],
            &word_bases,
            "wlm",
            iter,
        )?;
        self.write_samples("samp", iter)?;
        self.write_symbols("sym", iter)?;
        Ok(())
    }

    fn write_lm(
        &self,
        lm: &PyLm,
        symbols: &[String],
        bases: &[f64],
        kind: &str,
        iter: usize,
    ) -> Result<()> {
        let path = self.snapshot_path(kind, iter);
        debug!(path = %path.display(), "writing LM");
        let mut out = BufWriter::new(
            File::create(&path)
                .with_context(|| format!("couldn't write the LM to {}", path.display()))?,
        );
        lm.print(symbols, bases, &mut out)
    }

    fn write_samples(&self, kind: &str, iter: usize) -> Result<()> {
        let path = self.snapshot_path(kind, iter);
        debug!(path = %path.display(), "writing samples");
        let mut out = BufWriter::new(File::create(&path)?);
        for hist in &self.histories {
            let line: Vec<&str> = hist.iter().map(|&w| self.lex.word_string(w)).collect();
            writeln!(out, "{}", line.join(" "))?;
        }
        Ok(())
    }

    fn write_symbols(&self, kind: &str, iter: usize) -> Result<()> {
        let path = self.snapshot_path(kind, iter);
        debug!(path = %path.display(), "writing symbols");
        let mut out = BufWriter::new(File::create(&path)?);
        for (i, sym) in self.lex.symbols().iter().enumerate() {
            writeln!(out, "{}\t{}", sym, i)?;
        }
        Ok(())
    }

    pub fn histories(&self) -> &[Vec<WordId>] {
        &self.histories
    }

    pub fn lex(&self) -> &LexFst {
        &self.lex
    }

    pub fn known_lm(&self) -> &PyLm {
        &self.known_lm
    }

    pub fn unk_lm(&self) -> &PyLm {
        &self.unk_lm
    }
}

/// Read whitespace-separated lines into linear FSTs, building the
/// permanent symbol list over the characters that occur.
fn load_text(inputs: &[PathBuf]) -> Result<(Vec<StdVectorFst>, Vec<String>)> {
    let mut ids: HashMap<String, usize> = HashMap::new();
    let mut perm: Vec<String> = ["<eps>", "<phi>", "x<unk>", "x</unk>"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut fsts = Vec::new();
    for input in inputs {
        let fh = File::open(input)
            .with_context(|| format!("couldn't open {}", input.display()))?;
        for (lineno, line) in BufReader::new(fh).lines().enumerate() {
            let line = line?;
            let mut labels: Vec<Label> = Vec::new();
            for tok in line.split_whitespace() {
                let next = perm.len();
                let id = *ids.entry(tok.to_string()).or_insert_with(|| {
                    perm.push(format!("x{}", tok));
                    next
                });
                labels.push(id as Label);
            }
            if labels.is_empty() {
                bail!(
                    "empty line {} in {}: every training line needs at least one symbol",
                    lineno + 1,
                    input.display()
                );
            }
            let mut fst: StdVectorFst = acceptor(&labels, TropicalWeight::one());
            tr_sort(&mut fst, OLabelCompare {});
            fsts.push(fst);
        }
    }
    perm.push("w<s>".to_string());
    Ok((fsts, perm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_rejects_a_missing_prefix() {
        let config = TrainConfig {
            input_files: vec![PathBuf::from("/nonexistent")],
            ..TrainConfig::default()
        };
        assert!(Trainer::new(config).is_err());
    }

    #[test]
    fn it_requires_a_symbol_file_for_lattices() {
        let dir = std::env::temp_dir().join("latticelm_test_fstmode");
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("a.fst");
        std::fs::write(&input, b"").unwrap();
        let config = TrainConfig {
            input: InputKind::Fst,
            input_files: vec![input],
            prefix: dir.join("out.").to_string_lossy().into_owned(),
            ..TrainConfig::default()
        };
        assert!(Trainer::new(config).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn it_quantises_the_annealing_schedule() {
        // iteration 0 sits on the uniform plateau, later plateaus step
        // towards 1 in integer jumps
        let cfg = TrainConfig::default();
        let levels: Vec<f64> = (0..16)
            .map(|iter: usize| {
                let level = (iter + cfg.anneal_step_length - 1) / cfg.anneal_step_length;
                if level == 0 {
                    0.0
                } else {
                    1.0 / f64::max(1.0, cfg.anneal_steps as f64 - level as f64)
                }
            })
            .collect();
        assert_eq!(levels[0], 0.0);
        assert_eq!(levels[1], 0.25);
        assert_eq!(levels[3], 0.25);
        assert!((levels[4] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(levels[12], 1.0);
        assert_eq!(levels[15], 1.0);
    }
}
