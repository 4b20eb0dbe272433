use anyhow::{anyhow, bail, Result};
use rand::Rng;
use std::collections::HashMap;

/// Seating arrangement for one Chinese restaurant (one LM context).
///
/// Tracks, per dish, the total number of customers and the size of every
/// table serving that dish. Only the counts carry meaning; the order of
/// tables inside a restaurant is immaterial.
#[derive(Debug, Default, Clone)]
pub struct Restaurant {
    dishes: HashMap<usize, Dish>,
    /// Total customers seated in this restaurant
    customers: usize,
    /// Total tables open in this restaurant
    tables: usize,
}

#[derive(Debug, Default, Clone)]
struct Dish {
    customers: usize,
    tables: Vec<usize>,
}

impl Restaurant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seat one customer for `dish`. An existing table k is joined with
    /// weight max(size_k - discount, 0); a new table is opened with
    /// weight (strength + discount * T) * parent_prob. Returns true when
    /// a new table opened, in which case the caller must also seat the
    /// dish in the parent context.
    pub fn add(
        &mut self,
        dish: usize,
        parent_prob: f64,
        strength: f64,
        discount: f64,
        rng: &mut impl Rng,
    ) -> bool {
        let new_weight = (strength + discount * self.tables as f64) * parent_prob;
        let entry = self.dishes.entry(dish).or_default();
        let existing: f64 = entry
            .tables
            .iter()
            .map(|&sz| (sz as f64 - discount).max(0.0))
            .sum();
        let total = existing + new_weight;
        if total > 0.0 {
            let mut draw = rng.gen_range(0.0..total);
            for sz in entry.tables.iter_mut() {
                let w = (*sz as f64 - discount).max(0.0);
                if draw < w {
                    *sz += 1;
                    entry.customers += 1;
                    self.customers += 1;
                    return false;
                }
                draw -= w;
            }
        }
        entry.tables.push(1);
        entry.customers += 1;
        self.customers += 1;
        self.tables += 1;
        true
    }

    /// Unseat one customer of `dish`, chosen uniformly. Returns true when
    /// their table emptied and was removed, in which case the caller must
    /// also unseat the dish from the parent context.
    pub fn remove(&mut self, dish: usize, rng: &mut impl Rng) -> Result<bool> {
        let entry = self
            .dishes
            .get_mut(&dish)
            .ok_or_else(|| anyhow!("removed a customer of dish {} that was never seated", dish))?;
        let mut draw = rng.gen_range(0..entry.customers);
        let mut emptied = None;
        for k in 0..entry.tables.len() {
            if draw < entry.tables[k] {
                entry.tables[k] -= 1;
                if entry.tables[k] == 0 {
                    entry.tables.swap_remove(k);
                    emptied = Some(true);
                } else {
                    emptied = Some(false);
                }
                break;
            }
            draw -= entry.tables[k];
        }
        let emptied = match emptied {
            Some(e) => e,
            None => bail!("table sizes for dish {} disagree with its customer count", dish),
        };
        entry.customers -= 1;
        self.customers -= 1;
        if emptied {
            self.tables -= 1;
        }
        if entry.customers == 0 {
            self.dishes.remove(&dish);
        }
        Ok(emptied)
    }

    /// Customers of one dish
    pub fn customers(&self, dish: usize) -> usize {
        self.dishes.get(&dish).map_or(0, |d| d.customers)
    }

    /// Tables serving one dish
    pub fn tables(&self, dish: usize) -> usize {
        self.dishes.get(&dish).map_or(0, |d| d.tables.len())
    }

    /// Table sizes for one dish (empty slice for an unserved dish)
    pub fn tables_of(&self, dish: usize) -> &[usize] {
        self.dishes.get(&dish).map_or(&[][..], |d| &d.tables)
    }

    pub fn total_customers(&self) -> usize {
        self.customers
    }

    pub fn total_tables(&self) -> usize {
        self.tables
    }

    pub fn num_dishes(&self) -> usize {
        self.dishes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customers == 0
    }

    /// Dish ids in ascending order, so iteration consumes randomness in a
    /// reproducible order
    pub fn sorted_dishes(&self) -> Vec<usize> {
        let mut dishes: Vec<usize> = self.dishes.keys().copied().collect();
        dishes.sort_unstable();
        dishes
    }

    /// Renumber every dish through `remap`; a live dish without a slot is
    /// an invariant violation.
    pub fn remap_dishes(&mut self, remap: &[Option<usize>]) -> Result<()> {
        let old = std::mem::take(&mut self.dishes);
        for (dish, entry) in old {
            let new = remap
                .get(dish)
                .copied()
                .flatten()
                .ok_or_else(|| anyhow!("live dish {} has no slot after trimming", dish))?;
            self.dishes.insert(new, entry);
        }
        Ok(())
    }
}
