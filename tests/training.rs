use std::fs;
use std::path::PathBuf;

use latticelm::{TrainConfig, Trainer};

fn corpus(dir: &tempfile::TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("corpus.txt");
    fs::write(&path, text).unwrap();
    path
}

fn prefix(dir: &tempfile::TempDir) -> String {
    dir.path().join("out.").to_string_lossy().into_owned()
}

#[test]
fn it_learns_a_segmentation_of_repeated_text() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainConfig {
        burn_in: 5,
        num_samples: 5,
        known_n: 2,
        unk_n: 2,
        input_files: vec![corpus(&dir, "a b\na b\na b\n")],
        prefix: prefix(&dir),
        seed: 7,
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(config).unwrap();
    trainer.train().unwrap();

    // seating conservation: one word-LM customer per history token
    let tokens: usize = trainer.histories().iter().map(|h| h.len()).sum();
    assert!(tokens > 0);
    assert_eq!(tokens, trainer.known_lm().direct_customers());
    // character-LM customers exist whenever the vocabulary does
    assert!(trainer.known_lm().vocab_size() > 0);
    assert!(trainer.unk_lm().direct_customers() > 0);

    // every history token indexes a live lexicon word
    for hist in trainer.histories() {
        for &w in hist {
            assert!(w < trainer.lex().words().len());
        }
    }

    // the sample snapshot re-spells the input exactly
    let samp = fs::read_to_string(dir.path().join("out.samp.5")).unwrap();
    let lines: Vec<&str> = samp.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let rejoined: String = line.split_whitespace().collect::<Vec<_>>().concat();
        assert_eq!(rejoined, "ab");
    }
}

#[test]
fn it_emits_consistent_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainConfig {
        burn_in: 3,
        num_samples: 4,
        known_n: 3,
        unk_n: 3,
        input_files: vec![corpus(&dir, "x y z\nx y z\n")],
        prefix: prefix(&dir),
        separator: "-".to_string(),
        seed: 11,
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(config).unwrap();
    trainer.train().unwrap();

    for iter in 3..=4 {
        for kind in ["ulm", "wlm", "samp", "sym"] {
            let path = dir.path().join(format!("out.{}.{}", kind, iter));
            assert!(path.is_file(), "missing snapshot {}", path.display());
        }
    }

    // the symbol file covers the lexicon and is numbered densely
    let sym = fs::read_to_string(dir.path().join("out.sym.4")).unwrap();
    let entries: Vec<(&str, usize)> = sym
        .lines()
        .map(|l| {
            let mut it = l.split('\t');
            (it.next().unwrap(), it.next().unwrap().parse().unwrap())
        })
        .collect();
    assert_eq!(entries.len(), trainer.lex().symbols().len());
    for (i, (sym, id)) in entries.iter().enumerate() {
        assert_eq!(*id, i);
        assert_eq!(*sym, trainer.lex().symbols()[i]);
    }
    assert_eq!(entries[0].0, "<eps>");
    assert_eq!(entries[1].0, "<phi>");

    // samp lines rebuild the corpus under the separator
    let samp = fs::read_to_string(dir.path().join("out.samp.4")).unwrap();
    for line in samp.lines() {
        let rejoined: String = line
            .split_whitespace()
            .flat_map(|w| w.split('-'))
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rejoined, "x y z");
    }

    // only referenced words survive the final trim
    let used: std::collections::HashSet<usize> = trainer
        .histories()
        .iter()
        .flat_map(|h| h.iter().copied())
        .collect();
    assert_eq!(used.len(), trainer.lex().words().len());
}

#[test]
fn it_is_reproducible_for_a_fixed_seed() {
    let run = |seed: u64| {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            burn_in: 2,
            num_samples: 2,
            known_n: 2,
            unk_n: 2,
            input_files: vec![corpus(&dir, "a b a\nb a b\n")],
            prefix: prefix(&dir),
            seed,
            ..TrainConfig::default()
        };
        let mut trainer = Trainer::new(config).unwrap();
        trainer.train().unwrap();
        let words: Vec<Vec<usize>> = trainer.lex().words().to_vec();
        (trainer.histories().to_vec(), words)
    };
    assert_eq!(run(5), run(5));
}

#[test]
fn it_rejects_an_empty_line() {
    let dir = tempfile::tempdir().unwrap();
    let out = prefix(&dir);
    let config = TrainConfig {
        input_files: vec![corpus(&dir, "a b\n\na b\n")],
        prefix: out,
        ..TrainConfig::default()
    };
    let err = Trainer::new(config).unwrap_err();
    assert!(err.to_string().contains("empty line"));
}
