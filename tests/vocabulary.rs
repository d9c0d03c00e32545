//! End-to-end tests of vocabulary training, transform, scoring and the raw
//! file format.

use abow::*;
use approx::assert_relative_eq;
use rand::prelude::*;

fn random_corpus(images: usize, per_image: usize, seed: u64) -> Vec<Vec<Desc>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..images)
        .map(|_| (0..per_image).map(|_| rng.gen::<Desc>()).collect())
        .collect()
}

fn train(params: VocabularyParams, corpus: &[Vec<Desc>]) -> Vocabulary {
    Vocabulary::create(params, corpus).unwrap()
}

#[test]
fn k9_l3_tree_shape() {
    let corpus = random_corpus(20, 100, 1);
    let voc = train(VocabularyParams::new(9, 3), &corpus);

    assert!(voc.is_trained());
    assert_eq!(voc.tree_depth(), 3);
    assert!(voc.word_count() <= 729);
    assert!(voc.node_count() <= 1 + 9 + 81 + 729);
    for image in &corpus {
        for f in image {
            let (word, weight) = voc.word_of(f).unwrap();
            assert!((word as usize) < voc.word_count());
            assert!(weight >= 0.);
            assert_eq!(voc.path(f).unwrap().len(), 4);
        }
    }
}

#[test]
fn training_is_deterministic() {
    let corpus = random_corpus(10, 60, 2);
    let params = VocabularyParams::new(5, 3).seed(77);
    let a = train(params, &corpus);
    let b = train(params, &corpus);
    assert_eq!(a, b);

    let query = &random_corpus(1, 80, 3)[0];
    assert_eq!(a.transform(query).unwrap(), b.transform(query).unwrap());
    assert_eq!(a.transform(query).unwrap(), a.transform(query).unwrap());
}

#[test]
fn self_score_is_the_maximum() {
    let corpus = random_corpus(20, 100, 4);
    let cases = [
        (ScoringType::L1Norm, 1.),
        (ScoringType::L2Norm, 1.),
        (ScoringType::ChiSquare, 1.),
        (ScoringType::Kl, 0.),
        (ScoringType::Bhattacharyya, 1.),
    ];
    for (scoring, best) in cases {
        let voc = train(VocabularyParams::new(9, 3).scoring(scoring), &corpus);
        let bow = voc.transform(&corpus[0]).unwrap();
        assert!(!bow.is_empty());
        let own = voc.score(&bow, &bow).unwrap();
        assert_relative_eq!(own, best, epsilon = 1e-7);

        let other = voc.transform(&corpus[1]).unwrap();
        assert!(voc.score(&bow, &other).unwrap() < own);
    }
}

#[test]
fn l1_scores_are_symmetric_and_bounded() {
    let corpus = random_corpus(12, 80, 5);
    let voc = train(VocabularyParams::new(6, 3), &corpus);
    let bows: Vec<BowVector> = corpus.iter().map(|i| voc.transform(i).unwrap()).collect();
    for a in &bows {
        for b in &bows {
            let s = voc.score(a, b).unwrap();
            assert!((-1e-12..=1. + 1e-12).contains(&s));
            assert_relative_eq!(s, voc.score(b, a).unwrap(), epsilon = 1e-12);
        }
    }
}

#[test]
fn file_roundtrip_preserves_behavior() {
    let corpus = random_corpus(15, 80, 6);
    let voc = train(
        VocabularyParams::new(7, 3).weighting(WeightingType::TfIdf),
        &corpus,
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.voc");
    voc.save(&path).unwrap();
    let loaded: Vocabulary = Vocabulary::load(&path).unwrap();

    assert_eq!(loaded, voc);
    assert_eq!(loaded.word_count(), voc.word_count());
    assert_eq!(loaded.node_count(), voc.node_count());
    for image in &corpus[..4] {
        let a = voc.transform(image).unwrap();
        let b = loaded.transform(image).unwrap();
        assert_eq!(a, b);
        let q = voc.transform(&corpus[5]).unwrap();
        assert_eq!(voc.score(&a, &q).unwrap(), loaded.score(&b, &q).unwrap());
    }
}

#[test]
fn loading_garbage_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.voc");
    std::fs::write(&path, b"definitely not a vocabulary").unwrap();
    assert!(matches!(
        Vocabulary::<Orb>::load(&path),
        Err(BowErr::Format(_))
    ));
    assert!(matches!(
        Vocabulary::<Orb>::load(dir.path().join("missing.voc")),
        Err(BowErr::Io(_))
    ));
}

#[test]
fn cancelled_training_fails() {
    let corpus = random_corpus(5, 50, 7);
    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(matches!(
        Vocabulary::<Orb>::create_with_cancel(VocabularyParams::new(4, 2), &corpus, &cancel),
        Err(BowErr::Cancelled)
    ));
}

#[test]
fn training_descriptor_reaches_its_own_centroid_region() {
    // Well separated groups end up in distinct words.
    let corpus: Vec<Vec<Desc>> = [0x00u8, 0x0f, 0xf0, 0xff]
        .iter()
        .map(|&b| vec![[b; 32]; 5])
        .collect();
    let voc = train(VocabularyParams::new(4, 2), &corpus);
    let words: Vec<WordId> = corpus
        .iter()
        .map(|i| voc.word_of(&i[0]).unwrap().0)
        .collect();
    for (i, w) in words.iter().enumerate() {
        assert!(!words[..i].contains(w));
        assert_eq!(voc.word_centroid(*w), Some(&corpus[i][0]));
        assert_relative_eq!(voc.word_weight(*w).unwrap(), (4f64).ln());
    }
}
