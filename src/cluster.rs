use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::desc::DescriptorOps;
use crate::*;

/// Cooperative cancellation handle for vocabulary training.
///
/// Clones share the same flag. Training checks it before every node and
/// between k-means iterations and fails with [`BowErr::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> BowResult<()> {
        match self.is_cancelled() {
            true => Err(BowErr::Cancelled),
            false => Ok(()),
        }
    }
}

/// Unflattened result of clustering: a centroid and its sub-clusters.
/// A node without children is a word.
#[derive(Debug)]
pub(crate) struct Subtree<T> {
    pub centroid: T,
    pub children: Vec<Subtree<T>>,
}

/// Settings shared by every node of one training run.
pub(crate) struct Builder<'c> {
    pub k: usize,
    pub depth: usize,
    pub max_iterations: usize,
    pub cancel: &'c CancelToken,
}

impl<'c> Builder<'c> {
    /// Grow the subtree rooted at `centroid`, clustering `members` at `level`.
    pub fn grow<D: DescriptorOps>(
        &self,
        centroid: D::Descriptor,
        members: Vec<&D::Descriptor>,
        level: usize,
        seed: u64,
    ) -> BowResult<Subtree<D::Descriptor>> {
        self.cancel.check()?;
        // Every word sits at `depth`; a lone descriptor is carried down as a
        // chain of single-child nodes.
        if level == self.depth {
            return Ok(Subtree {
                centroid,
                children: Vec::new(),
            });
        }

        let clusters = self.kmeans::<D>(&members, level, seed)?;
        drop(members);

        // Sibling subtrees are independent
        let children = clusters
            .into_par_iter()
            .enumerate()
            .map(|(i, (c, group))| self.grow::<D>(c, group, level + 1, child_seed(seed, i)))
            .collect::<BowResult<Vec<_>>>()?;

        Ok(Subtree { centroid, children })
    }

    /// Split `members` into at most `k` clusters. Empty clusters are dropped.
    fn kmeans<'a, D: DescriptorOps>(
        &self,
        members: &[&'a D::Descriptor],
        level: usize,
        seed: u64,
    ) -> BowResult<Vec<(D::Descriptor, Vec<&'a D::Descriptor>)>> {
        let mut centroids = self.initial_centroids::<D>(members, seed);
        if centroids.len() < self.k {
            debug!(
                level,
                features = members.len(),
                distinct = centroids.len(),
                k = self.k,
                "degenerate node, fewer distinct descriptors than k"
            );
        }

        let mut assignment: Vec<usize> = Vec::new();
        let mut converged = false;
        for iter in 0..self.max_iterations {
            self.cancel.check()?;

            let next: Vec<usize> = members
                .par_iter()
                .map(|f| nearest::<D>(&centroids, f))
                .collect();
            if next == assignment {
                debug!(level, iterations = iter, "k-means converged");
                converged = true;
                break;
            }
            assignment = next;

            let groups = group_by(members, &assignment, centroids.len());
            for (centroid, group) in centroids.iter_mut().zip(&groups) {
                // An emptied cluster keeps its previous centroid.
                if !group.is_empty() {
                    *centroid = D::mean_value(group)?;
                }
            }
        }
        if !converged {
            // Centroids were updated after the last assignment.
            assignment = members
                .par_iter()
                .map(|f| nearest::<D>(&centroids, f))
                .collect();
            warn!(
                level,
                features = members.len(),
                max_iterations = self.max_iterations,
                "k-means did not converge, using current centroids"
            );
        }

        let groups = group_by(members, &assignment, centroids.len());
        Ok(centroids
            .into_iter()
            .zip(groups)
            .filter(|(_, group)| !group.is_empty())
            .collect())
    }

    /// Sample `k` distinct descriptors, or take all of them when there are
    /// no more than `k`.
    fn initial_centroids<D: DescriptorOps>(
        &self,
        members: &[&D::Descriptor],
        seed: u64,
    ) -> Vec<D::Descriptor> {
        let mut seen = HashSet::with_capacity(members.len());
        let distinct: Vec<&D::Descriptor> =
            members.iter().copied().filter(|d| seen.insert(*d)).collect();

        if distinct.len() <= self.k {
            return distinct.into_iter().cloned().collect();
        }
        let mut rng = StdRng::seed_from_u64(seed);
        distinct
            .choose_multiple(&mut rng, self.k)
            .map(|d| (*d).clone())
            .collect()
    }
}

/// Index of the nearest centroid. Ties go to the lowest index.
#[inline]
fn nearest<D: DescriptorOps>(centroids: &[D::Descriptor], f: &D::Descriptor) -> usize {
    let mut best: (usize, u32) = (0, u32::MAX);
    for (j, c) in centroids.iter().enumerate() {
        let d = D::distance(c, f);
        if d < best.1 {
            best = (j, d);
        }
    }
    best.0
}

fn group_by<'a, T>(members: &[&'a T], assignment: &[usize], n: usize) -> Vec<Vec<&'a T>> {
    let mut groups = vec![Vec::new(); n];
    for (f, &c) in members.iter().zip(assignment) {
        groups[c].push(*f);
    }
    groups
}

/// Seed of the `child`-th subtree of a node seeded with `seed` (splitmix64).
fn child_seed(seed: u64, child: usize) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15u64.wrapping_mul(child as u64 + 1));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::Orb;

    fn desc(byte: u8) -> Desc {
        [byte; 32]
    }

    fn builder(k: usize, depth: usize, cancel: &CancelToken) -> Builder<'_> {
        Builder {
            k,
            depth,
            max_iterations: 20,
            cancel,
        }
    }

    fn count_leaves<T>(t: &Subtree<T>) -> usize {
        match t.children.is_empty() {
            true => 1,
            false => t.children.iter().map(count_leaves).sum(),
        }
    }

    #[test]
    fn separates_obvious_clusters() {
        let cancel = CancelToken::new();
        let b = builder(2, 1, &cancel);
        let pool: Vec<Desc> = (0..10)
            .map(|i| if i % 2 == 0 { desc(0x00) } else { desc(0xff) })
            .collect();
        let members: Vec<&Desc> = pool.iter().collect();
        let clusters = b.kmeans::<Orb>(&members, 0, 7).unwrap();
        assert_eq!(clusters.len(), 2);
        for (c, group) in &clusters {
            assert_eq!(group.len(), 5);
            assert!(group.iter().all(|g| *g == c));
        }
    }

    #[test]
    fn fewer_distinct_than_k_gives_fewer_children() {
        let cancel = CancelToken::new();
        let b = builder(5, 2, &cancel);
        let pool = vec![desc(1), desc(2), desc(1)];
        let members: Vec<&Desc> = pool.iter().collect();
        let tree = b.grow::<Orb>(desc(0), members, 0, 3).unwrap();
        assert_eq!(tree.children.len(), 2);
        // depth is kept below degenerate nodes
        for child in &tree.children {
            assert_eq!(child.children.len(), 1);
            assert!(child.children[0].children.is_empty());
            assert_eq!(child.children[0].centroid, child.centroid);
        }
    }

    #[test]
    fn depth_limit_makes_leaves() {
        let cancel = CancelToken::new();
        let b = builder(2, 1, &cancel);
        let pool: Vec<Desc> = (0..16u8).map(desc).collect();
        let tree = b
            .grow::<Orb>(desc(0), pool.iter().collect(), 0, 11)
            .unwrap();
        assert!(tree.children.iter().all(|c| c.children.is_empty()));
        assert!(count_leaves(&tree) <= 2);
    }

    #[test]
    fn same_seed_same_tree() {
        let pool: Vec<Desc> = (0..200u32)
            .map(|i| {
                let mut d = [0u8; 32];
                for (j, x) in d.iter_mut().enumerate() {
                    *x = (i.wrapping_mul(2654435761).rotate_left(j as u32) & 0xff) as u8;
                }
                d
            })
            .collect();
        let cancel = CancelToken::new();
        let b = builder(3, 3, &cancel);
        let centroids = |t: &Subtree<Desc>| -> Vec<Desc> {
            fn walk(t: &Subtree<Desc>, out: &mut Vec<Desc>) {
                out.push(t.centroid);
                t.children.iter().for_each(|c| walk(c, out));
            }
            let mut out = Vec::new();
            walk(t, &mut out);
            out
        };
        let t1 = b.grow::<Orb>(desc(0), pool.iter().collect(), 0, 42).unwrap();
        let t2 = b.grow::<Orb>(desc(0), pool.iter().collect(), 0, 42).unwrap();
        assert_eq!(centroids(&t1), centroids(&t2));
    }

    #[test]
    fn cancelled_training_fails() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let b = builder(2, 2, &cancel);
        let pool = vec![desc(1), desc(2), desc(3)];
        let r = b.grow::<Orb>(desc(0), pool.iter().collect(), 0, 1);
        assert!(matches!(r, Err(BowErr::Cancelled)));
    }

    #[test]
    fn child_seeds_differ() {
        assert_ne!(child_seed(5, 0), child_seed(5, 1));
        assert_eq!(child_seed(5, 2), child_seed(5, 2));
    }
}
