use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap};

use crate::{NodeId, WordId, WordValue};

/// Norm used to normalize a [`BowVector`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LNorm {
    L1,
    L2,
}

/// Bag-of-Words representation of an image or descriptor set.
///
/// Sparse map from word id to the total weight of that word in the
/// transformed descriptors, kept in ascending word order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BowVector(BTreeMap<WordId, WordValue>);

impl BowVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `v` to the weight of `id`, inserting the word if it is absent.
    pub fn add_weight(&mut self, id: WordId, v: WordValue) {
        *self.0.entry(id).or_insert(0.) += v;
    }

    /// Insert `(id, v)` only if `id` is not present yet.
    pub fn add_if_not_exist(&mut self, id: WordId, v: WordValue) {
        self.0.entry(id).or_insert(v);
    }

    /// Divide every weight by the vector's norm. A zero norm leaves the
    /// vector unchanged.
    pub fn normalize(&mut self, norm: LNorm) {
        let n = self.norm(norm);
        if n > 0. {
            self.scale(1. / n);
        }
    }

    pub(crate) fn scale(&mut self, factor: f64) {
        for w in self.0.values_mut() {
            *w *= factor;
        }
    }

    pub fn norm(&self, norm: LNorm) -> f64 {
        match norm {
            LNorm::L1 => self.0.values().map(|w| w.abs()).sum(),
            LNorm::L2 => self.0.values().map(|w| w * w).sum::<f64>().sqrt(),
        }
    }

    pub fn get(&self, id: WordId) -> Option<WordValue> {
        self.0.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Words and weights in ascending word order.
    pub fn iter(&self) -> impl Iterator<Item = (WordId, WordValue)> + '_ {
        self.0.iter().map(|(&id, &w)| (id, w))
    }

    /// Words present in both vectors, with the weight from each, in
    /// ascending word order.
    pub fn shared_words<'a>(&'a self, other: &'a BowVector) -> SharedWords<'a> {
        SharedWords {
            a: self,
            b: other,
            a_it: self.0.range::<WordId, _>(..),
            b_it: other.0.range::<WordId, _>(..),
        }
    }
}

impl FromIterator<(WordId, WordValue)> for BowVector {
    fn from_iter<I: IntoIterator<Item = (WordId, WordValue)>>(iter: I) -> Self {
        let mut v = Self::new();
        for (id, w) in iter {
            v.add_weight(id, w);
        }
        v
    }
}

/// Merge-walk over two [`BowVector`]s yielding `(word, v1 weight, v2 weight)`
/// for every shared word.
///
/// When the heads differ, the lagging side jumps straight to the lower bound
/// of the other side's word, so long runs of unshared words are skipped in
/// logarithmic time.
pub struct SharedWords<'a> {
    a: &'a BowVector,
    b: &'a BowVector,
    a_it: btree_map::Range<'a, WordId, WordValue>,
    b_it: btree_map::Range<'a, WordId, WordValue>,
}

impl<'a> Iterator for SharedWords<'a> {
    type Item = (WordId, WordValue, WordValue);

    fn next(&mut self) -> Option<Self::Item> {
        let (mut ka, mut va) = self.a_it.next()?;
        let (mut kb, mut vb) = self.b_it.next()?;
        loop {
            if ka == kb {
                return Some((*ka, *va, *vb));
            } else if ka < kb {
                self.a_it = self.a.0.range(*kb..);
                let (k, v) = self.a_it.next()?;
                ka = k;
                va = v;
            } else {
                self.b_it = self.b.0.range(*ka..);
                let (k, v) = self.b_it.next()?;
                kb = k;
                vb = v;
            }
        }
    }
}

/// Direct index of one image: for each vocabulary node at a fixed level,
/// the indices of the descriptors that descended through it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FeatureVector(BTreeMap<NodeId, Vec<u32>>);

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that descriptor `feature` passed through `node`.
    pub fn add_feature(&mut self, node: NodeId, feature: u32) {
        self.0.entry(node).or_default().push(feature);
    }

    pub fn features(&self, node: NodeId) -> &[u32] {
        self.0.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct nodes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[u32])> + '_ {
        self.0.iter().map(|(&n, f)| (n, f.as_slice()))
    }

    /// Flattened `(node, descriptor index)` records, grouped by node.
    pub fn pairs(&self) -> impl Iterator<Item = (NodeId, u32)> + '_ {
        self.0
            .iter()
            .flat_map(|(&n, f)| f.iter().map(move |&i| (n, i)))
    }
}
