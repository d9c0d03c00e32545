use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::marker::PhantomData;
use tracing::info;

use crate::bow::{BowVector, FeatureVector};
use crate::cluster::{Builder, CancelToken, Subtree};
use crate::desc::{DescriptorOps, Orb};
use crate::scoring::{Scoring, ScoringType};
use crate::*;

/// How word weights are computed and accumulated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightingType {
    /// Term frequency times inverse document frequency.
    TfIdf,
    /// Term frequency only.
    Tf,
    /// Inverse document frequency, counted once per image.
    Idf,
    /// Word presence.
    Binary,
}

impl WeightingType {
    pub(crate) fn to_code(self) -> u8 {
        match self {
            WeightingType::TfIdf => 0,
            WeightingType::Tf => 1,
            WeightingType::Idf => 2,
            WeightingType::Binary => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => WeightingType::TfIdf,
            1 => WeightingType::Tf,
            2 => WeightingType::Idf,
            3 => WeightingType::Binary,
            _ => return None,
        })
    }

    fn uses_idf(self) -> bool {
        matches!(self, WeightingType::TfIdf | WeightingType::Idf)
    }
}

/// Shape and training settings of a [`Vocabulary`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabularyParams {
    /// Branching factor.
    pub k: u32,
    /// Number of levels below the root.
    pub depth: u32,
    pub weighting: WeightingType,
    pub scoring: ScoringType,
    /// Root seed of the k-means initialization.
    pub seed: u64,
    /// Cap on Lloyd iterations per node.
    pub max_iterations: u32,
}

impl Default for VocabularyParams {
    fn default() -> Self {
        Self {
            k: 10,
            depth: 5,
            weighting: WeightingType::TfIdf,
            scoring: ScoringType::L1Norm,
            seed: 0,
            max_iterations: 100,
        }
    }
}

impl VocabularyParams {
    pub fn new(k: u32, depth: u32) -> Self {
        Self {
            k,
            depth,
            ..Self::default()
        }
    }

    pub fn weighting(mut self, weighting: WeightingType) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn scoring(mut self, scoring: ScoringType) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Upper bound on the number of nodes of a tree with these parameters,
    /// or `None` if it does not fit in a [`NodeId`].
    pub fn max_nodes(&self) -> Option<u32> {
        let k = u64::from(self.k);
        let mut level = 1u64;
        let mut total = 1u64;
        for _ in 0..self.depth {
            level = level.checked_mul(k)?;
            total = total.checked_add(level)?;
        }
        u32::try_from(total).ok().filter(|&t| t < NO_PARENT)
    }

    pub fn validate(&self) -> BowResult<()> {
        if self.k < 2 {
            return Err(BowErr::InvalidInput(format!(
                "branching factor must be at least 2, got {}",
                self.k
            )));
        }
        if self.depth < 1 {
            return Err(BowErr::InvalidInput("depth must be at least 1".to_string()));
        }
        if self.max_iterations < 1 {
            return Err(BowErr::InvalidInput(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.max_nodes().is_none() {
            return Err(BowErr::InvalidInput(format!(
                "a {}^{} tree does not fit 32-bit node ids",
                self.k, self.depth
            )));
        }
        Ok(())
    }
}

/// Sentinel parent id of the root.
pub(crate) const NO_PARENT: NodeId = NodeId::MAX;

/// Node ids from the root to the word reached by one descriptor.
pub type NodePath = SmallVec<[NodeId; 8]>;

#[derive(Debug, Clone, PartialEq)]
/// A node of the vocabulary tree. Nodes live in one arena indexed by id.
pub(crate) struct Node<T> {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    /// Ascending ids; empty iff the node is a word.
    pub children: Vec<NodeId>,
    pub descriptor: T,
    /// Word weight, zero on inner nodes.
    pub weight: WordValue,
    pub word: Option<WordId>,
}

/// Feature vocabulary built from a collection of image keypoint descriptors. Can be:
/// 1. Created from a training corpus.
/// 2. Saved to & loaded from its raw binary format.
/// 3. Used to transform a new set of descriptors into a BoW representation
///    (and optionally a direct index from nodes to features), and to score
///    two BoW vectors against each other.
///
/// A vocabulary built with [`Vocabulary::new`] stays untrained; every query on
/// it fails with [`BowErr::NotTrained`]. Trained vocabularies come only from
/// [`create`](Vocabulary::create) or [`load`](Vocabulary::load), are never
/// modified afterwards and may be shared freely between threads.
pub struct Vocabulary<D: DescriptorOps = Orb> {
    params: VocabularyParams,
    nodes: Vec<Node<D::Descriptor>>,
    /// Word id -> node id.
    words: Vec<NodeId>,
    _ops: PhantomData<D>,
}

/// Vocabulary API
impl<D: DescriptorOps> Vocabulary<D> {
    /// An empty, untrained vocabulary.
    pub fn new(params: VocabularyParams) -> Self {
        Self {
            params,
            nodes: Vec::new(),
            words: Vec::new(),
            _ops: PhantomData,
        }
    }

    /// Build a vocabulary from a training corpus of per-image descriptor sets.
    pub fn create(params: VocabularyParams, corpus: &[Vec<D::Descriptor>]) -> BowResult<Self> {
        Self::create_with_cancel(params, corpus, &CancelToken::new())
    }

    /// [`create`](Self::create) that can be aborted from another thread.
    pub fn create_with_cancel(
        params: VocabularyParams,
        corpus: &[Vec<D::Descriptor>],
        cancel: &CancelToken,
    ) -> BowResult<Self> {
        let mut v = Self::new(params);
        v.train(corpus, cancel)?;
        Ok(v)
    }

    /// Cluster the corpus into a tree and compute word weights. On error the
    /// vocabulary is left untrained.
    fn train(&mut self, corpus: &[Vec<D::Descriptor>], cancel: &CancelToken) -> BowResult<()> {
        self.params.validate()?;
        self.nodes.clear();
        self.words.clear();

        // Flatten all features into one pool
        let pool: Vec<&D::Descriptor> = corpus.iter().flatten().collect();
        if pool.is_empty() {
            return Err(BowErr::InvalidInput(
                "cannot train a vocabulary without descriptors".to_string(),
            ));
        }
        info!(
            images = corpus.len(),
            features = pool.len(),
            k = self.params.k,
            depth = self.params.depth,
            "training vocabulary"
        );

        let builder = Builder {
            k: self.params.k as usize,
            depth: self.params.depth as usize,
            max_iterations: self.params.max_iterations as usize,
            cancel,
        };
        let root = D::mean_value(&pool)?;
        let tree = builder.grow::<D>(root, pool, 0, self.params.seed)?;

        let (nodes, words) = flatten(tree);
        self.nodes = nodes;
        self.words = words;
        self.set_word_weights(corpus);

        info!(
            words = self.words.len(),
            nodes = self.nodes.len(),
            "vocabulary trained"
        );
        Ok(())
    }

    /// Transform a set of binary descriptors into its bag of words
    /// representation with respect to the Vocabulary.
    pub fn transform(&self, features: &[D::Descriptor]) -> BowResult<BowVector> {
        self.transform_generic(features, None).map(|(bow, _)| bow)
    }

    /// Transform a set of binary descriptors into its bag of words
    /// representation with respect to the Vocabulary.
    ///
    /// Also provides a "direct index" grouping the features by the node they
    /// passed through at `level` (the root is level 0). A `level` past the
    /// depth of the tree groups features by word node.
    pub fn transform_with_features(
        &self,
        features: &[D::Descriptor],
        level: u32,
    ) -> BowResult<(BowVector, FeatureVector)> {
        self.transform_generic(features, Some(level as usize))
    }

    /// Similarity between two vectors transformed by this vocabulary, with
    /// the configured scoring.
    pub fn score(&self, v1: &BowVector, v2: &BowVector) -> BowResult<f64> {
        self.ensure_trained()?;
        Ok(self.params.scoring.score(v1, v2))
    }

    /// Word reached by a single descriptor, and its weight.
    pub fn word_of(&self, feature: &D::Descriptor) -> BowResult<(WordId, WordValue)> {
        self.ensure_trained()?;
        let leaf = self.leaf(&self.descend(feature));
        Ok((leaf.word.unwrap_or_default(), leaf.weight))
    }

    /// Node ids from the root down to the word reached by `feature`.
    pub fn path(&self, feature: &D::Descriptor) -> BowResult<NodePath> {
        self.ensure_trained()?;
        Ok(self.descend(feature))
    }

    pub fn is_trained(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn params(&self) -> &VocabularyParams {
        &self.params
    }

    pub fn branching_factor(&self) -> u32 {
        self.params.k
    }

    pub fn depth(&self) -> u32 {
        self.params.depth
    }

    pub fn weighting(&self) -> WeightingType {
        self.params.weighting
    }

    pub fn scoring(&self) -> ScoringType {
        self.params.scoring
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Length of the longest root-to-word path.
    pub fn tree_depth(&self) -> usize {
        self.words
            .iter()
            .map(|&n| self.level_of(n))
            .max()
            .unwrap_or(0)
    }

    pub fn word_weight(&self, word: WordId) -> Option<WordValue> {
        self.word_node(word).map(|n| n.weight)
    }

    /// Centroid of the descriptors clustered into `word`.
    pub fn word_centroid(&self, word: WordId) -> Option<&D::Descriptor> {
        self.word_node(word).map(|n| &n.descriptor)
    }

    /// Node id of the word leaf.
    pub fn word_node_id(&self, word: WordId) -> Option<NodeId> {
        self.words.get(word as usize).copied()
    }

    pub fn node_descriptor(&self, node: NodeId) -> Option<&D::Descriptor> {
        self.nodes.get(node as usize).map(|n| &n.descriptor)
    }

    /// Ancestor of `word` at `level`, or the word's own node if `level` is
    /// past the depth of the tree.
    pub fn parent_at_level(&self, word: WordId, level: u32) -> Option<NodeId> {
        let mut id = self.word_node_id(word)?;
        let mut depth = self.level_of(id);
        while depth > level as usize {
            id = self.nodes[id as usize].parent?;
            depth -= 1;
        }
        Some(id)
    }
}

impl<D: DescriptorOps> Vocabulary<D> {
    fn transform_generic(
        &self,
        features: &[D::Descriptor],
        level: Option<usize>,
    ) -> BowResult<(BowVector, FeatureVector)> {
        self.ensure_trained()?;
        let mut bow = BowVector::new();
        let mut direct_idx = FeatureVector::new();
        let weighting = self.params.weighting;

        for (i, feature) in features.iter().enumerate() {
            let path = self.descend(feature);
            if let Some(level) = level {
                let node = path[level.min(path.len() - 1)];
                direct_idx.add_feature(node, i as u32);
            }

            let leaf = self.leaf(&path);
            // Words seen in every training image carry no information
            let (Some(word), true) = (leaf.word, leaf.weight > 0.) else {
                continue;
            };
            match weighting {
                WeightingType::TfIdf | WeightingType::Tf => bow.add_weight(word, leaf.weight),
                WeightingType::Idf | WeightingType::Binary => {
                    bow.add_if_not_exist(word, leaf.weight)
                }
            }
        }

        match self.params.scoring.norm() {
            Some(norm) => bow.normalize(norm),
            None => {
                if matches!(weighting, WeightingType::TfIdf | WeightingType::Tf)
                    && !features.is_empty()
                {
                    // term frequency: n_id / n_d
                    bow.scale(1. / features.len() as f64);
                }
            }
        }

        Ok((bow, direct_idx))
    }

    /// Follow the nearest child from the root down to a word. Ties go to the
    /// lowest node id.
    fn descend(&self, feature: &D::Descriptor) -> NodePath {
        let mut path: NodePath = smallvec![0];
        let mut node = &self.nodes[0];
        while !node.children.is_empty() {
            let mut best: (u32, NodeId) = (u32::MAX, node.children[0]);
            for &child in node.children.iter() {
                let d = D::distance(feature, &self.nodes[child as usize].descriptor);
                if d < best.0 {
                    best = (d, child);
                }
            }
            path.push(best.1);
            node = &self.nodes[best.1 as usize];
        }
        path
    }

    fn leaf(&self, path: &NodePath) -> &Node<D::Descriptor> {
        &self.nodes[path[path.len() - 1] as usize]
    }

    fn level_of(&self, mut id: NodeId) -> usize {
        let mut level = 0;
        while let Some(parent) = self.nodes[id as usize].parent {
            id = parent;
            level += 1;
        }
        level
    }

    fn word_node(&self, word: WordId) -> Option<&Node<D::Descriptor>> {
        self.word_node_id(word).map(|id| &self.nodes[id as usize])
    }

    pub(crate) fn ensure_trained(&self) -> BowResult<()> {
        match self.is_trained() {
            true => Ok(()),
            false => Err(BowErr::NotTrained),
        }
    }

    /// IDF: ln(N / N_i), N_i the number of training images containing word i.
    /// Words never reached get zero. TF and BINARY words weigh one.
    fn set_word_weights(&mut self, corpus: &[Vec<D::Descriptor>]) {
        if !self.params.weighting.uses_idf() {
            for &id in &self.words {
                self.nodes[id as usize].weight = 1.;
            }
            return;
        }

        let per_image: Vec<Vec<WordId>> = corpus
            .par_iter()
            .map(|image| {
                let mut words: Vec<WordId> = image
                    .iter()
                    .filter_map(|f| self.leaf(&self.descend(f)).word)
                    .collect();
                words.sort_unstable();
                words.dedup();
                words
            })
            .collect();

        let mut counts = vec![0usize; self.words.len()];
        for words in &per_image {
            for &w in words {
                counts[w as usize] += 1;
            }
        }

        let n = corpus.len() as f64;
        for (word, &count) in counts.iter().enumerate() {
            let id = self.words[word] as usize;
            self.nodes[id].weight = match count {
                0 => 0.,
                c => (n / c as f64).ln(),
            };
        }
    }

    pub(crate) fn from_parts(params: VocabularyParams, nodes: Vec<Node<D::Descriptor>>) -> Self {
        let words = nodes
            .iter()
            .filter(|n| n.word.is_some())
            .map(|n| n.id)
            .collect();
        Self {
            params,
            nodes,
            words,
            _ops: PhantomData,
        }
    }

    pub(crate) fn nodes(&self) -> &[Node<D::Descriptor>] {
        &self.nodes
    }
}

/// Lay the clustered tree out in pre-order, which assigns node ids and word
/// ids.
fn flatten<T>(tree: Subtree<T>) -> (Vec<Node<T>>, Vec<NodeId>) {
    fn visit<T>(
        tree: Subtree<T>,
        parent: Option<NodeId>,
        nodes: &mut Vec<Node<T>>,
        words: &mut Vec<NodeId>,
    ) -> NodeId {
        let id = nodes.len() as NodeId;
        let word = match tree.children.is_empty() {
            true => {
                words.push(id);
                Some(words.len() as WordId - 1)
            }
            false => None,
        };
        nodes.push(Node {
            id,
            parent,
            children: Vec::with_capacity(tree.children.len()),
            descriptor: tree.centroid,
            weight: 0.,
            word,
        });
        for child in tree.children {
            let child_id = visit(child, Some(id), nodes, words);
            nodes[id as usize].children.push(child_id);
        }
        id
    }

    let mut nodes = Vec::new();
    let mut words = Vec::new();
    visit(tree, None, &mut nodes, &mut words);
    (nodes, words)
}

impl<D: DescriptorOps> Clone for Vocabulary<D> {
    fn clone(&self) -> Self {
        Self {
            params: self.params,
            nodes: self.nodes.clone(),
            words: self.words.clone(),
            _ops: PhantomData,
        }
    }
}

impl<D: DescriptorOps> PartialEq for Vocabulary<D> {
    fn eq(&self, other: &Self) -> bool {
        self.params.k == other.params.k
            && self.params.depth == other.params.depth
            && self.params.weighting == other.params.weighting
            && self.params.scoring == other.params.scoring
            && self.nodes == other.nodes
    }
}

impl<D: DescriptorOps> fmt::Debug for Vocabulary<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let weights: Vec<f64> = self
            .words
            .iter()
            .map(|&id| self.nodes[id as usize].weight)
            .collect();
        let min = weights.iter().copied().fold(f64::INFINITY, f64::min);
        let max = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        f.debug_struct("Vocabulary")
            .field("Word/Leaf Nodes", &self.words.len())
            .field("Other Nodes", &(self.nodes.len() - self.words.len()))
            .field("Levels", &self.params.depth)
            .field("Tree Depth", &self.tree_depth())
            .field("Branching Factor", &self.params.k)
            .field("Weighting", &self.params.weighting)
            .field("Scoring", &self.params.scoring)
            .field("Zero Weight Words", &weights.iter().filter(|&&w| w == 0.).count())
            .field("Min Word Weight", &min)
            .field("Max Word Weight", &max)
            .finish()
    }
}
