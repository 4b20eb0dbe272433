use anyhow::{anyhow, bail, Result};
use rand::Rng;
use rustfst::algorithms::compose::compose;
use rustfst::prelude::*;
use std::collections::HashMap;
use tracing::error;

use crate::pylmfst::PylmFst;
use crate::{LogVectorFst, StdVectorFst};

/// Compose the input lattice with the lexicon and the language-model
/// view, optionally prune by a beam, then draw one path by
/// forward-filter/backward-sampling with the annealing exponent applied
/// to every weight. The returned FST is linear and keeps the unannealed
/// weights.
pub fn sample_path(
    input: &StdVectorFst,
    lex_fst: &StdVectorFst,
    pylm: &mut PylmFst,
    prune_threshold: f64,
    anneal: f64,
    rng: &mut impl Rng,
) -> Result<StdVectorFst> {
    let il: StdVectorFst = compose::<TropicalWeight, StdVectorFst, StdVectorFst, _, _, _>(
        input.clone(),
        lex_fst.clone(),
    )?;
    let ilp = expand_lm(&il, pylm)?;
    let pruned = if prune_threshold > 0.0 {
        prune(&ilp, prune_threshold)?
    } else {
        ilp
    };
    if pruned.num_states() <= 1 {
        input.write("debug-input.fst")?;
        il.write("debug-il.fst")?;
        pruned.write("debug-ilp.fst")?;
        error!("lattice collapsed; component FSTs dumped to debug-*.fst");
        bail!("pruned lattice has one or fewer states");
    }
    draw_path(&pruned, anneal, rng)
}

/// Materialise il composed with the LM view by driving its arc
/// enumeration; back-off is already folded into each arc weight.
fn expand_lm(il: &StdVectorFst, pylm: &mut PylmFst) -> Result<StdVectorFst> {
    let mut out = StdVectorFst::new();
    let il_start = match il.start() {
        Some(s) => s,
        None => return Ok(out),
    };
    let mut ids: HashMap<(StateId, usize), StateId> = HashMap::new();
    let start = out.add_state();
    out.set_start(start)?;
    let lm_start = pylm.start();
    ids.insert((il_start, lm_start), start);
    let mut stack = vec![(il_start, lm_start, start)];
    while let Some((iq, lq, oq)) = stack.pop() {
        if let Some(w) = il.final_weight(iq)? {
            if pylm.can_finish(lq) {
                out.set_final(oq, w)?;
            }
        }
        let trs = il.get_trs(iq)?;
        for tr in trs.trs() {
            let (cost, ln) = if tr.olabel == EPS_LABEL {
                (0.0, lq)
            } else {
                pylm.arc(lq, tr.olabel as usize)?
            };
            let key = (tr.nextstate, ln);
            let dest = match ids.get(&key) {
                Some(&d) => d,
                None => {
                    let d = out.add_state();
                    ids.insert(key, d);
                    stack.push((tr.nextstate, ln, d));
                    d
                }
            };
            let w = TropicalWeight::new(*tr.weight.value() + cost as f32);
            out.add_tr(oq, Tr::new(tr.ilabel, tr.olabel, w, dest))?;
        }
    }
    Ok(out)
}

/// Keep only states and arcs lying on a path within `threshold` of the
/// best one.
fn prune(fst: &StdVectorFst, threshold: f64) -> Result<StdVectorFst> {
    let start = match fst.start() {
        Some(s) => s,
        None => return Ok(StdVectorFst::new()),
    };
    let alpha = shortest_distance(fst, false)?;
    let beta = shortest_distance(fst, true)?;
    let best = *beta[start as usize].value() as f64;
    if !best.is_finite() {
        return Ok(StdVectorFst::new());
    }
    let limit = best + threshold;
    let mut out = StdVectorFst::new();
    let mut map = vec![NO_STATE_ID; fst.num_states()];
    for q in fst.states_iter() {
        let through =
            (*alpha[q as usize].value() + *beta[q as usize].value()) as f64;
        if through <= limit {
            map[q as usize] = out.add_state();
        }
    }
    out.set_start(map[start as usize])?;
    for q in fst.states_iter() {
        if map[q as usize] == NO_STATE_ID {
            continue;
        }
        let trs = fst.get_trs(q)?;
        for tr in trs.trs() {
            if map[tr.nextstate as usize] == NO_STATE_ID {
                continue;
            }
            let via = (*alpha[q as usize].value()
                + *tr.weight.value()
                + *beta[tr.nextstate as usize].value()) as f64;
            if via <= limit {
                out.add_tr(
                    map[q as usize],
                    Tr::new(tr.ilabel, tr.olabel, tr.weight, map[tr.nextstate as usize]),
                )?;
            }
        }
        if let Some(w) = fst.final_weight(q)? {
            if (*alpha[q as usize].value() + *w.value()) as f64 <= limit {
                out.set_final(map[q as usize], w)?;
            }
        }
    }
    connect(&mut out)?;
    Ok(out)
}

/// Forward weights in the log semiring over annealed costs, then a
/// backward pass drawing the final state proportional to alpha times the
/// final weight and each predecessor arc proportional to alpha(prev)
/// times the arc weight.
fn draw_path(fst: &StdVectorFst, anneal: f64, rng: &mut impl Rng) -> Result<StdVectorFst> {
    let start = fst
        .start()
        .ok_or_else(|| anyhow!("lattice has no start state"))?;
    let mut lfst = LogVectorFst::new();
    for _ in 0..fst.num_states() {
        lfst.add_state();
    }
    lfst.set_start(start)?;
    for q in fst.states_iter() {
        let trs = fst.get_trs(q)?;
        for tr in trs.trs() {
            let w = LogWeight::new(*tr.weight.value() * anneal as f32);
            lfst.add_tr(q, Tr::new(tr.ilabel, tr.olabel, w, tr.nextstate))?;
        }
        if let Some(w) = fst.final_weight(q)? {
            lfst.set_final(q, LogWeight::new(*w.value() * anneal as f32))?;
        }
    }
    let alpha = shortest_distance(&lfst, false)?;
    for w in &alpha {
        if w.value().is_nan() {
            bail!("NaN in the forward pass");
        }
    }
    let mut finals = Vec::new();
    let mut final_costs = Vec::new();
    for q in fst.states_iter() {
        if let Some(w) = lfst.final_weight(q)? {
            let cost = *alpha[q as usize].value() as f64 + *w.value() as f64;
            if cost.is_finite() {
                finals.push(q);
                final_costs.push(cost);
            }
        }
    }
    if finals.is_empty() {
        bail!("lattice has no complete path");
    }
    let chosen = finals[draw_index(&final_costs, rng)?];

    // incoming arcs, addressed as (origin state, arc offset)
    let mut preds: Vec<Vec<(StateId, usize)>> = vec![Vec::new(); fst.num_states()];
    for q in fst.states_iter() {
        let trs = fst.get_trs(q)?;
        for (i, tr) in trs.trs().iter().enumerate() {
            preds[tr.nextstate as usize].push((q, i));
        }
    }
    let mut rev: Vec<(StateId, usize)> = Vec::new();
    let mut cur = chosen;
    loop {
        let mut costs = Vec::new();
        let mut opts = Vec::new();
        if cur == start {
            costs.push(0.0);
            opts.push(None);
        }
        for &(p, i) in &preds[cur as usize] {
            let trs = lfst.get_trs(p)?;
            let w = *trs.trs()[i].weight.value() as f64;
            costs.push(*alpha[p as usize].value() as f64 + w);
            opts.push(Some((p, i)));
        }
        match opts[draw_index(&costs, rng)?] {
            None => break,
            Some((p, i)) => {
                rev.push((p, i));
                cur = p;
            }
        }
    }

    let mut out = StdVectorFst::new();
    let mut state = out.add_state();
    out.set_start(state)?;
    for &(p, i) in rev.iter().rev() {
        let trs = fst.get_trs(p)?;
        let tr = &trs.trs()[i];
        let next = out.add_state();
        out.add_tr(state, Tr::new(tr.ilabel, tr.olabel, tr.weight, next))?;
        state = next;
    }
    let rho = fst
        .final_weight(chosen)?
        .ok_or_else(|| anyhow!("chosen final state lost its weight"))?;
    out.set_final(state, rho)?;
    Ok(out)
}

/// Draw an index proportional to exp(-cost).
fn draw_index(costs: &[f64], rng: &mut impl Rng) -> Result<usize> {
    let min = costs.iter().cloned().fold(f64::INFINITY, f64::min);
    if !min.is_finite() {
        bail!("no probability mass to sample from");
    }
    let weights: Vec<f64> = costs.iter().map(|c| (-(c - min)).exp()).collect();
    let total: f64 = weights.iter().sum();
    let mut draw = rng.gen_range(0.0..total);
    for (i, w) in weights.iter().enumerate() {
        if draw < *w {
            return Ok(i);
        }
        draw -= w;
    }
    Ok(weights.len() - 1)
}
