use serde::{Deserialize, Serialize};

use crate::bow::{BowVector, LNorm};
use crate::WordValue;

/// `ln(f64::EPSILON)`: floor for the log of a zero probability in KL scoring.
pub const LOG_EPS: f64 = -36.04365338911715;

/// Provides the similarity score between bow vectors.
///
/// A score is a sum of per-word `term`s over the shared words, closed by
/// `finish`. The database scores straight from its posting lists this way.
pub trait Scoring: Send + Sync {
    /// Norm the inputs must be normalized with, if any.
    fn norm(&self) -> Option<LNorm>;

    /// Contribution of one word present in both the query (`v`) and the
    /// other vector (`w`).
    fn term(&self, v: WordValue, w: WordValue) -> f64;

    /// Turn the accumulated terms into the final score.
    fn finish(&self, acc: f64, query: &BowVector) -> f64;

    fn must_normalize(&self) -> bool {
        self.norm().is_some()
    }

    /// Score between two vectors. Higher is more similar.
    fn score(&self, v1: &BowVector, v2: &BowVector) -> f64 {
        let acc = v1
            .shared_words(v2)
            .fold(0., |acc, (_, v, w)| acc + self.term(v, w));
        self.finish(acc, v1)
    }
}

/// Supported scoring metrics.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoringType {
    L1Norm,
    L2Norm,
    ChiSquare,
    Kl,
    Bhattacharyya,
    DotProduct,
}

impl ScoringType {
    pub(crate) fn to_code(self) -> u8 {
        match self {
            ScoringType::L1Norm => 0,
            ScoringType::L2Norm => 1,
            ScoringType::ChiSquare => 2,
            ScoringType::Kl => 3,
            ScoringType::Bhattacharyya => 4,
            ScoringType::DotProduct => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ScoringType::L1Norm,
            1 => ScoringType::L2Norm,
            2 => ScoringType::ChiSquare,
            3 => ScoringType::Kl,
            4 => ScoringType::Bhattacharyya,
            5 => ScoringType::DotProduct,
            _ => return None,
        })
    }

    /// The strategy object implementing this metric.
    pub fn strategy(self) -> &'static dyn Scoring {
        match self {
            ScoringType::L1Norm => &L1Scoring,
            ScoringType::L2Norm => &L2Scoring,
            ScoringType::ChiSquare => &ChiSquareScoring,
            ScoringType::Kl => &KlScoring,
            ScoringType::Bhattacharyya => &BhattacharyyaScoring,
            ScoringType::DotProduct => &DotProductScoring,
        }
    }
}

impl Scoring for ScoringType {
    fn norm(&self) -> Option<LNorm> {
        self.strategy().norm()
    }

    fn term(&self, v: WordValue, w: WordValue) -> f64 {
        self.strategy().term(v, w)
    }

    fn finish(&self, acc: f64, query: &BowVector) -> f64 {
        self.strategy().finish(acc, query)
    }
}

/// Scaled L1 distance (Nister, 2006). In `[0, 1]`, 1 for identical vectors.
///
/// `||v - w||_1 = 2 + sum(|v_i - w_i| - |v_i| - |w_i|)` over shared words,
/// scaled to `1 - 0.5 * ||v - w||_1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Scoring;

impl Scoring for L1Scoring {
    fn norm(&self) -> Option<LNorm> {
        Some(LNorm::L1)
    }

    fn term(&self, v: WordValue, w: WordValue) -> f64 {
        (v - w).abs() - v.abs() - w.abs()
    }

    fn finish(&self, acc: f64, _query: &BowVector) -> f64 {
        -acc / 2.
    }
}

/// Scaled L2 distance. In `[0, 1]`, 1 for identical vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Scoring;

impl Scoring for L2Scoring {
    fn norm(&self) -> Option<LNorm> {
        Some(LNorm::L2)
    }

    fn term(&self, v: WordValue, w: WordValue) -> f64 {
        v * w
    }

    fn finish(&self, acc: f64, _query: &BowVector) -> f64 {
        // rounding can push the dot product of unit vectors past 1
        if acc >= 1. {
            1.
        } else {
            1. - (1. - acc).sqrt()
        }
    }
}

/// Chi-square similarity. In `[0, 1]`, 1 for identical vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChiSquareScoring;

impl Scoring for ChiSquareScoring {
    fn norm(&self) -> Option<LNorm> {
        Some(LNorm::L1)
    }

    fn term(&self, v: WordValue, w: WordValue) -> f64 {
        if v + w != 0. {
            v * w / (v + w)
        } else {
            0.
        }
    }

    fn finish(&self, acc: f64, _query: &BowVector) -> f64 {
        2. * acc
    }
}

/// Negated Kullback-Leibler divergence of the second vector from the query.
/// At most 0, reached by identical vectors.
///
/// Words of the query missing from the other vector contribute
/// `v_i * (ln v_i - LOG_EPS)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KlScoring;

impl Scoring for KlScoring {
    fn norm(&self) -> Option<LNorm> {
        Some(LNorm::L1)
    }

    // Replaces the missing-word penalty already counted in `finish` with the
    // real `v * ln(v / w)` contribution.
    fn term(&self, v: WordValue, w: WordValue) -> f64 {
        if v > 0. && w > 0. {
            v * (LOG_EPS - w.ln())
        } else {
            0.
        }
    }

    fn finish(&self, acc: f64, query: &BowVector) -> f64 {
        let missing: f64 = query
            .iter()
            .filter(|(_, v)| *v > 0.)
            .map(|(_, v)| v * (v.ln() - LOG_EPS))
            .sum();
        -(missing + acc)
    }
}

/// Bhattacharyya coefficient. In `[0, 1]`, 1 for identical vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct BhattacharyyaScoring;

impl Scoring for BhattacharyyaScoring {
    fn norm(&self) -> Option<LNorm> {
        Some(LNorm::L1)
    }

    fn term(&self, v: WordValue, w: WordValue) -> f64 {
        (v * w).sqrt()
    }

    fn finish(&self, acc: f64, _query: &BowVector) -> f64 {
        acc
    }
}

/// Plain dot product of unnormalized vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProductScoring;

impl Scoring for DotProductScoring {
    fn norm(&self) -> Option<LNorm> {
        None
    }

    fn term(&self, v: WordValue, w: WordValue) -> f64 {
        v * w
    }

    fn finish(&self, acc: f64, _query: &BowVector) -> f64 {
        acc
    }
}
