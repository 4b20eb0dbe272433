use anyhow::{anyhow, bail, Result};
use rand::Rng;
use rand_distr::{Beta, Distribution, Gamma};
use std::collections::HashMap;
use std::io::Write;

use crate::restaurant::Restaurant;

/// One context in the suffix trie. Children extend the context one token
/// further into the past.
#[derive(Debug, Default, Clone)]
struct Node {
    children: HashMap<usize, usize>,
    restaurant: Restaurant,
    depth: usize,
}

/// Hierarchical Pitman-Yor language model of order `n`.
///
/// Contexts of length 0 to n-1 live in a trie keyed by the most recent
/// token first; every node owns one restaurant, and every context length
/// shares one strength/discount pair. A node exists only while a customer
/// sits in it or below it (empty nodes linger until the next trim).
#[derive(Debug, Clone)]
pub struct PyLm {
    n: usize,
    strengths: Vec<f64>,
    discounts: Vec<f64>,
    nodes: Vec<Node>,
    /// Token positions whose last add or remove cascaded into the base
    base_positions: Vec<usize>,
    /// Customers seated directly by calc_sentence, one per token
    direct_customers: usize,
}

impl PyLm {
    pub fn new(n: usize) -> Self {
        assert!(n >= 1, "a language model needs at least a unigram level");
        PyLm {
            n,
            strengths: vec![2.0; n],
            discounts: vec![0.5; n],
            nodes: vec![Node::default()],
            base_positions: Vec::new(),
            direct_customers: 0,
        }
    }

    /// Trie nodes for ever-longer suffixes of `ctx`, root first, stopping
    /// where the trie runs out.
    fn chain(&self, ctx: &[usize]) -> Vec<usize> {
        let mut chain = vec![0];
        let mut node = 0;
        for &lab in ctx.iter().rev() {
            match self.nodes[node].children.get(&lab) {
                Some(&c) => {
                    node = c;
                    chain.push(c);
                }
                None => break,
            }
        }
        chain
    }

    /// Like `chain` but creates the missing tail.
    fn chain_mut(&mut self, ctx: &[usize]) -> Vec<usize> {
        let mut chain = vec![0];
        let mut node = 0;
        for &lab in ctx.iter().rev() {
            let depth = self.nodes[node].depth + 1;
            let next = match self.nodes[node].children.get(&lab) {
                Some(&c) => c,
                None => {
                    let c = self.nodes.len();
                    self.nodes.push(Node {
                        children: HashMap::new(),
                        restaurant: Restaurant::new(),
                        depth,
                    });
                    self.nodes[node].children.insert(lab, c);
                    c
                }
            };
            node = next;
            chain.push(next);
        }
        chain
    }

    /// Smoothed probability after each level: slot 0 is the base, slot
    /// i+1 applies the restaurant at chain[i]. The recursion stays in
    /// linear space; callers take the log once.
    fn level_probs(&self, chain: &[usize], dish: usize, base: f64) -> Vec<f64> {
        let mut probs = Vec::with_capacity(chain.len() + 1);
        probs.push(base);
        let mut p = base;
        for (depth, &node) in chain.iter().enumerate() {
            let rst = &self.nodes[node].restaurant;
            let d = self.discounts[depth];
            let s = self.strengths[depth];
            let c = rst.customers(dish) as f64;
            let t = rst.tables(dish) as f64;
            let big_c = rst.total_customers() as f64;
            let big_t = rst.total_tables() as f64;
            p = ((c - d * t).max(0.0) + (s + d * big_t) * p) / (s + big_c);
            probs.push(p);
        }
        probs
    }

    /// Smoothed P(dish | ctx) with the given base probability.
    pub fn prob(&self, ctx: &[usize], dish: usize, base: f64) -> f64 {
        let chain = self.chain(ctx);
        let probs = self.level_probs(&chain, dish, base);
        probs[probs.len() - 1]
    }

    /// Weight of backing off through every level of `ctx` down to the
    /// base; P(w | ctx) for an entirely unseen w is this times its base.
    pub fn backoff_to_base(&self, ctx: &[usize]) -> f64 {
        let mut f = 1.0;
        for (depth, &node) in self.chain(ctx).iter().enumerate() {
            let rst = &self.nodes[node].restaurant;
            let d = self.discounts[depth];
            let s = self.strengths[depth];
            f *= (s + d * rst.total_tables() as f64) / (s + rst.total_customers() as f64);
        }
        f
    }

    /// Log-probability of a token sequence without seating anyone.
    /// `bases[j]` is the base probability of token j.
    pub fn sentence_prob(&self, words: &[usize], bases: &[f64]) -> f64 {
        let mut ll = 0.0;
        for (j, &w) in words.iter().enumerate() {
            let ctx = &words[j.saturating_sub(self.n - 1)..j];
            ll += self.prob(ctx, w, bases[j]).ln();
        }
        ll
    }

    /// Log-probability of a token sequence; with `do_add` every token is
    /// also seated, new tables cascading towards shorter contexts.
    /// Positions whose cascade opened a table at the root end up in
    /// `base_positions` (left empty when `do_add` is false).
    pub fn calc_sentence(
        &mut self,
        words: &[usize],
        bases: &[f64],
        do_add: bool,
        rng: &mut impl Rng,
    ) -> Result<f64> {
        self.base_positions.clear();
        if words.len() > bases.len() {
            bail!(
                "sequence of {} tokens but only {} base probabilities",
                words.len(),
                bases.len()
            );
        }
        if !do_add {
            return Ok(self.sentence_prob(words, bases));
        }
        let mut ll = 0.0;
        for (j, &w) in words.iter().enumerate() {
            let ctx = &words[j.saturating_sub(self.n - 1)..j];
            let chain = self.chain_mut(ctx);
            let probs = self.level_probs(&chain, w, bases[j]);
            ll += probs[probs.len() - 1].ln();
            self.direct_customers += 1;
            for level in (0..chain.len()).rev() {
                let opened = self.nodes[chain[level]].restaurant.add(
                    w,
                    probs[level],
                    self.strengths[level],
                    self.discounts[level],
                    rng,
                );
                if !opened {
                    break;
                }
                if level == 0 {
                    self.base_positions.push(j);
                }
            }
        }
        Ok(ll)
    }

    /// Unseat a previously added sequence, in the same order. Removals
    /// that cascade past the root are recorded in `base_positions` so the
    /// caller can unseat the matching spellings elsewhere.
    pub fn remove_customers(&mut self, words: &[usize], rng: &mut impl Rng) -> Result<()> {
        self.base_positions.clear();
        for (j, &w) in words.iter().enumerate() {
            let ctx = &words[j.saturating_sub(self.n - 1)..j];
            let chain = self.chain(ctx);
            if chain.len() != ctx.len() + 1 {
                bail!("removing an n-gram from a context that was never seen");
            }
            self.direct_customers = self
                .direct_customers
                .checked_sub(1)
                .ok_or_else(|| anyhow!("more customers removed than were ever added"))?;
            for level in (0..chain.len()).rev() {
                let emptied = self.nodes[chain[level]].restaurant.remove(w, rng)?;
                if !emptied {
                    break;
                }
                if level == 0 {
                    self.base_positions.push(j);
                }
            }
        }
        Ok(())
    }

    /// Token positions from the last calc_sentence/remove_customers whose
    /// seating cascade reached the base distribution.
    pub fn base_positions(&self) -> &[usize] {
        &self.base_positions
    }

    /// Resample strength and discount per level with Teh's
    /// auxiliary-variable scheme under Beta(1,1) / Gamma(1,1) priors.
    pub fn sample_parameters(&mut self, rng: &mut impl Rng) -> Result<()> {
        for depth in 0..self.n {
            let d = self.discounts[depth];
            let s = self.strengths[depth];
            let mut y_on = 0.0;
            let mut y_off = 0.0;
            let mut z_off = 0.0;
            let mut log_x = 0.0;
            for node in self.nodes.iter().filter(|nd| nd.depth == depth) {
                let rst = &node.restaurant;
                let c = rst.total_customers();
                if c == 0 {
                    continue;
                }
                if c >= 2 {
                    let x: f64 = Beta::new(s + 1.0, (c - 1) as f64)?.sample(rng);
                    log_x += x.ln();
                }
                for i in 1..rst.total_tables() {
                    if rng.gen_range(0.0..1.0) < s / (s + d * i as f64) {
                        y_on += 1.0;
                    } else {
                        y_off += 1.0;
                    }
                }
                for dish in rst.sorted_dishes() {
                    for &sz in rst.tables_of(dish) {
                        for i in 1..sz {
                            if rng.gen_range(0.0..1.0) >= (i as f64 - 1.0) / (i as f64 - d) {
                                z_off += 1.0;
                            }
                        }
                    }
                }
            }
            self.discounts[depth] = Beta::new(1.0 + y_off, 1.0 + z_off)?.sample(rng);
            self.strengths[depth] = Gamma::new(1.0 + y_on, 1.0 / (1.0 - log_x))?.sample(rng);
        }
        Ok(())
    }

    /// Drop every context with no customers in it or below it.
    pub fn trim(&mut self) -> Result<()> {
        self.rebuild(None)
    }

    /// Drop dead contexts and dead dishes, renumbering the survivors
    /// densely. Slot w of the result holds the new id of dish w, or None
    /// when it has no customers left at the root.
    pub fn trim_to_remap(&mut self, num_dishes: usize) -> Result<Vec<Option<usize>>> {
        let root = &self.nodes[0].restaurant;
        let mut remap = vec![None; num_dishes];
        let mut next = 0;
        for (dish, slot) in remap.iter_mut().enumerate() {
            if root.customers(dish) > 0 {
                *slot = Some(next);
                next += 1;
            }
        }
        self.rebuild(Some(&remap))?;
        Ok(remap)
    }

    fn mark_live(&self, node: usize, live: &mut [bool]) -> bool {
        let mut alive = !self.nodes[node].restaurant.is_empty();
        for &c in self.nodes[node].children.values() {
            let child_alive = self.mark_live(c, live);
            alive = alive || child_alive;
        }
        live[node] = alive;
        alive
    }

    /// Depth-first in sorted-child order, so the rebuilt arena comes out
    /// the same on every run.
    fn collect_live(&self, node: usize, live: &[bool], order: &mut Vec<usize>) {
        order.push(node);
        let mut kids: Vec<(usize, usize)> = self.nodes[node]
            .children
            .iter()
            .map(|(&l, &c)| (l, c))
            .collect();
        kids.sort_unstable();
        for (_, c) in kids {
            if live[c] {
                self.collect_live(c, live, order);
            }
        }
    }

    fn rebuild(&mut self, remap: Option<&[Option<usize>]>) -> Result<()> {
        let mut live = vec![false; self.nodes.len()];
        self.mark_live(0, &mut live);
        live[0] = true;
        let mut order = Vec::new();
        self.collect_live(0, &live, &mut order);
        let mut new_index = vec![usize::MAX; self.nodes.len()];
        for (i, &old) in order.iter().enumerate() {
            new_index[old] = i;
        }
        let mut nodes = Vec::with_capacity(order.len());
        for &old in &order {
            let old_node = std::mem::take(&mut self.nodes[old]);
            let mut node = Node {
                children: HashMap::new(),
                restaurant: old_node.restaurant,
                depth: old_node.depth,
            };
            for (lab, child) in old_node.children {
                if !live[child] {
                    continue;
                }
                let lab = match remap {
                    Some(r) => r
                        .get(lab)
                        .copied()
                        .flatten()
                        .ok_or_else(|| anyhow!("live context refers to trimmed id {}", lab))?,
                    None => lab,
                };
                node.children.insert(lab, new_index[child]);
            }
            if let Some(r) = remap {
                node.restaurant.remap_dishes(r)?;
            }
            nodes.push(node);
        }
        self.nodes = nodes;
        Ok(())
    }

    /// One line per (context, dish): the context oldest-first, the dish,
    /// then its smoothed probability, customer count and table count.
    /// `symbols` and `bases` are indexed by dish id.
    pub fn print(&self, symbols: &[String], bases: &[f64], out: &mut impl Write) -> Result<()> {
        let mut rev_ctx = Vec::new();
        self.print_node(0, &mut rev_ctx, symbols, bases, out)
    }

    fn print_node(
        &self,
        node: usize,
        rev_ctx: &mut Vec<usize>,
        symbols: &[String],
        bases: &[f64],
        out: &mut impl Write,
    ) -> Result<()> {
        let ctx: Vec<usize> = rev_ctx.iter().rev().copied().collect();
        let rst = &self.nodes[node].restaurant;
        for dish in rst.sorted_dishes() {
            let sym = symbols
                .get(dish)
                .ok_or_else(|| anyhow!("dish {} is outside the symbol table", dish))?;
            let base = bases.get(dish).copied().unwrap_or(0.0);
            let p = self.prob(&ctx, dish, base);
            let mut line = String::new();
            for &c in &ctx {
                line.push_str(&symbols[c]);
                line.push(' ');
            }
            writeln!(
                out,
                "{}{}\t{} {} {}",
                line,
                sym,
                p,
                rst.customers(dish),
                rst.tables(dish)
            )?;
        }
        let mut kids: Vec<(usize, usize)> = self.nodes[node]
            .children
            .iter()
            .map(|(&l, &c)| (l, c))
            .collect();
        kids.sort_unstable();
        for (lab, child) in kids {
            rev_ctx.push(lab);
            self.print_node(child, rev_ctx, symbols, bases, out)?;
            rev_ctx.pop();
        }
        Ok(())
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of live context nodes
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Dishes with at least one customer at the root
    pub fn vocab_size(&self) -> usize {
        self.nodes[0].restaurant.num_dishes()
    }

    pub fn strength(&self, level: usize) -> f64 {
        self.strengths[level]
    }

    pub fn discount(&self, level: usize) -> f64 {
        self.discounts[level]
    }

    /// Customers seated by calc_sentence and not yet removed; one per
    /// token of every added sequence.
    pub fn direct_customers(&self) -> usize {
        self.direct_customers
    }

    /// Customers of one dish at the root
    pub fn root_customers(&self, dish: usize) -> usize {
        self.nodes[0].restaurant.customers(dish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn uniform(k: usize, len: usize) -> Vec<f64> {
        vec![1.0 / k as f64; len]
    }

    #[test]
    fn it_restores_the_empty_state_after_add_then_remove() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut lm = PyLm::new(3);
        let sent = [1usize, 2, 1, 2, 3];
        let bases = uniform(4, sent.len());
        lm.calc_sentence(&sent, &bases, true, &mut rng).unwrap();
        assert_eq!(lm.direct_customers(), sent.len());
        assert!(lm.vocab_size() > 0);
        lm.remove_customers(&sent, &mut rng).unwrap();
        assert_eq!(lm.direct_customers(), 0);
        assert_eq!(lm.vocab_size(), 0);
        lm.trim().unwrap();
        assert_eq!(lm.size(), 1);
    }

    #[test]
    fn it_leaves_base_positions_empty_without_add() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut lm = PyLm::new(2);
        let sent = [1usize, 2];
        let bases = uniform(3, sent.len());
        lm.calc_sentence(&sent, &bases, true, &mut rng).unwrap();
        assert!(!lm.base_positions().is_empty());
        let ll = lm.calc_sentence(&sent, &bases, false, &mut rng).unwrap();
        assert!(ll.is_finite());
        assert!(lm.base_positions().is_empty());
    }

    #[test]
    fn it_normalizes_over_a_closed_dish_set() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut lm = PyLm::new(2);
        let k = 4;
        let sent = [0usize, 1, 2, 1, 0, 3, 1];
        let bases = uniform(k, sent.len());
        lm.calc_sentence(&sent, &bases, true, &mut rng).unwrap();
        for ctx in [&[][..], &[1][..], &[3][..]] {
            let total: f64 = (0..k).map(|w| lm.prob(ctx, w, 1.0 / k as f64)).sum();
            assert!((total - 1.0).abs() < 1e-9, "sum over {:?} was {}", ctx, total);
        }
    }

    #[test]
    fn it_matches_the_backoff_factor_on_unseen_dishes() {
        let mut rng = StdRng::seed_from_u64(14);
        let mut lm = PyLm::new(2);
        let sent = [0usize, 1, 0, 1];
        let bases = uniform(10, sent.len());
        lm.calc_sentence(&sent, &bases, true, &mut rng).unwrap();
        let base = 0.1;
        let unseen = lm.prob(&[1], 7, base);
        let factor = lm.backoff_to_base(&[1]);
        assert!((unseen - factor * base).abs() < 1e-12);
    }

    #[test]
    fn it_preserves_probabilities_across_trim() {
        let mut rng = StdRng::seed_from_u64(15);
        let mut lm = PyLm::new(3);
        let sent = [2usize, 5, 2, 5, 9];
        let bases = uniform(10, sent.len());
        lm.calc_sentence(&sent, &bases, true, &mut rng).unwrap();
        let before = lm.prob(&[2, 5], 2, 0.1);
        let remap = lm.trim_to_remap(10).unwrap();
        assert!(remap[2].is_some() && remap[5].is_some() && remap[9].is_some());
        assert!(remap[0].is_none());
        let ctx = [remap[2].unwrap(), remap[5].unwrap()];
        let after = lm.prob(&ctx, remap[2].unwrap(), 0.1);
        assert!((before - after).abs() < 1e-12);
    }

    #[test]
    fn it_rejects_removal_from_an_unseen_context() {
        let mut rng = StdRng::seed_from_u64(16);
        let mut lm = PyLm::new(3);
        assert!(lm.remove_customers(&[1, 2], &mut rng).is_err());
    }

    #[test]
    fn it_resamples_hyperparameters_into_range() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut lm = PyLm::new(2);
        let sent = [0usize, 1, 2, 0, 1, 2, 0, 1];
        let bases = uniform(3, sent.len());
        lm.calc_sentence(&sent, &bases, true, &mut rng).unwrap();
        lm.sample_parameters(&mut rng).unwrap();
        for i in 0..lm.n() {
            assert!(lm.discount(i) > 0.0 && lm.discount(i) < 1.0);
            assert!(lm.strength(i) > 0.0);
        }
    }
}
