use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::bow::{BowVector, FeatureVector};
use crate::desc::{DescriptorOps, Orb};
use crate::scoring::Scoring;
use crate::vocab::Vocabulary;
use crate::*;

/// One occurrence of a word in an entry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Posting {
    pub entry: EntryId,
    pub value: WordValue,
}

/// A ranked database entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryResult {
    pub entry_id: EntryId,
    pub score: f64,
    /// Number of words the entry shares with the query.
    pub shared_words: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatabaseParams {
    /// Tree level the direct index records nodes at (root is 0), or `None`
    /// to keep no direct index.
    pub direct_index_level: Option<u32>,
}

impl DatabaseParams {
    pub fn with_direct_index(level: u32) -> Self {
        Self {
            direct_index_level: Some(level),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct Index {
    /// Word id -> postings in entry order.
    inverted: Vec<Vec<Posting>>,
    /// Entry id -> direct index, only filled when enabled.
    direct: Vec<FeatureVector>,
    next_entry: EntryId,
}

impl Index {
    fn new(words: usize) -> Self {
        Self {
            inverted: vec![Vec::new(); words],
            ..Self::default()
        }
    }

    /// Check a deserialized index against the invariants `add` maintains.
    #[cfg(feature = "bincode")]
    fn validate<D: DescriptorOps>(
        &self,
        vocabulary: &Vocabulary<D>,
        params: &DatabaseParams,
    ) -> BowResult<()> {
        let format_err = |msg: String| Err(BowErr::Format(msg));
        if self.inverted.len() != vocabulary.word_count() {
            return format_err(format!(
                "inverted file has {} words, vocabulary {}",
                self.inverted.len(),
                vocabulary.word_count()
            ));
        }
        for (word, postings) in self.inverted.iter().enumerate() {
            let mut last: Option<EntryId> = None;
            for p in postings {
                if p.entry >= self.next_entry {
                    return format_err(format!(
                        "word {} lists entry {} of {}",
                        word, p.entry, self.next_entry
                    ));
                }
                if last.map_or(false, |l| p.entry <= l) {
                    return format_err(format!(
                        "postings of word {} are not in strictly increasing entry order",
                        word
                    ));
                }
                if !p.value.is_finite() {
                    return format_err(format!("word {} has weight {}", word, p.value));
                }
                last = Some(p.entry);
            }
        }

        let direct_expected = match params.direct_index_level {
            Some(_) => self.next_entry as usize,
            None => 0,
        };
        if self.direct.len() != direct_expected {
            return format_err(format!(
                "direct file has {} entries, expected {}",
                self.direct.len(),
                direct_expected
            ));
        }
        let nodes = vocabulary.node_count();
        for (entry, fv) in self.direct.iter().enumerate() {
            if let Some((node, _)) = fv.iter().find(|&(n, _)| n as usize >= nodes) {
                return format_err(format!(
                    "entry {} refers to node {} of {}",
                    entry, node, nodes
                ));
            }
        }
        Ok(())
    }
}

/// Inverted-index image database.
///
/// Every added image becomes an entry. The inverted file keeps, per word, the
/// entries containing it and the word's weight in each. The optional direct
/// file keeps, per entry, the node each descriptor went through at a fixed
/// level.
///
/// The vocabulary is shared read-only through an [`Arc`]. Queries take a
/// shared lock on the index and `add` an exclusive one, so a database can be
/// used from several threads at once.
pub struct Database<D: DescriptorOps = Orb> {
    vocabulary: Arc<Vocabulary<D>>,
    params: DatabaseParams,
    index: RwLock<Index>,
}

impl<D: DescriptorOps> Database<D> {
    /// Database owning its own copy of the vocabulary.
    pub fn new(vocabulary: Vocabulary<D>, params: DatabaseParams) -> Self {
        Self::with_shared(Arc::new(vocabulary), params)
    }

    /// Database over a vocabulary shared with other databases.
    pub fn with_shared(vocabulary: Arc<Vocabulary<D>>, params: DatabaseParams) -> Self {
        let index = Index::new(vocabulary.word_count());
        Self {
            vocabulary,
            params,
            index: RwLock::new(index),
        }
    }

    /// Transform an image's descriptors and add it as a new entry.
    pub fn add(&self, features: &[D::Descriptor]) -> BowResult<EntryId> {
        let (bow, direct_idx) = match self.params.direct_index_level {
            Some(level) => {
                let (bow, fv) = self.vocabulary.transform_with_features(features, level)?;
                (bow, Some(fv))
            }
            None => (self.vocabulary.transform(features)?, None),
        };
        self.add_bow(&bow, direct_idx)
    }

    /// Add an image already transformed by this database's vocabulary.
    pub fn add_bow(&self, bow: &BowVector, features: Option<FeatureVector>) -> BowResult<EntryId> {
        self.vocabulary.ensure_trained()?;
        let words = self.vocabulary.word_count();
        if let Some((word, _)) = bow.iter().find(|&(w, _)| w as usize >= words) {
            return Err(BowErr::InvalidInput(format!(
                "word {} is not in a vocabulary of {} words",
                word, words
            )));
        }

        let mut index = self.write();
        let entry = index.next_entry;
        for (word, value) in bow.iter() {
            index.inverted[word as usize].push(Posting { entry, value });
        }
        if self.params.direct_index_level.is_some() {
            index.direct.push(features.unwrap_or_default());
        }
        index.next_entry += 1;

        debug!(entry, words = bow.len(), "entry added");
        Ok(entry)
    }

    /// Entries most similar to the given descriptors, best first. A
    /// `max_results` of 0 returns every entry sharing a word with the query.
    pub fn query(&self, features: &[D::Descriptor], max_results: usize) -> BowResult<Vec<QueryResult>> {
        let bow = self.vocabulary.transform(features)?;
        self.query_bow(&bow, max_results, None)
    }

    /// Query with a vector already transformed by this database's vocabulary.
    /// Entries with ids above `max_id` are ignored.
    ///
    /// Scores equal [`Vocabulary::score`] of the query against each entry's
    /// vector. Ties are ranked by ascending entry id.
    pub fn query_bow(
        &self,
        bow: &BowVector,
        max_results: usize,
        max_id: Option<EntryId>,
    ) -> BowResult<Vec<QueryResult>> {
        self.vocabulary.ensure_trained()?;
        let scoring = self.vocabulary.scoring();
        let index = self.read();

        let mut acc: HashMap<EntryId, (f64, usize)> = HashMap::new();
        for (word, q) in bow.iter() {
            let Some(postings) = index.inverted.get(word as usize) else {
                continue;
            };
            for p in postings {
                if max_id.map_or(false, |m| p.entry > m) {
                    // postings are in entry order
                    break;
                }
                let (sum, shared) = acc.entry(p.entry).or_insert((0., 0));
                *sum += scoring.term(q, p.value);
                *shared += 1;
            }
        }
        drop(index);

        let mut results: Vec<QueryResult> = acc
            .into_iter()
            .map(|(entry_id, (sum, shared_words))| QueryResult {
                entry_id,
                score: scoring.finish(sum, bow),
                shared_words,
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.entry_id.cmp(&b.entry_id))
        });
        if max_results > 0 {
            results.truncate(max_results);
        }
        Ok(results)
    }

    /// Direct index of `entry`, if the database keeps one.
    pub fn features(&self, entry: EntryId) -> Option<FeatureVector> {
        self.read().direct.get(entry as usize).cloned()
    }

    /// Postings of `word`, in entry order.
    pub fn posting_list(&self, word: WordId) -> Vec<Posting> {
        self.read()
            .inverted
            .get(word as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.read().next_entry as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary<D>> {
        &self.vocabulary
    }

    pub fn params(&self) -> &DatabaseParams {
        &self.params
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(feature = "bincode")]
#[derive(Serialize)]
struct SnapshotRef<'a> {
    vocabulary: &'a [u8],
    params: &'a DatabaseParams,
    index: &'a Index,
}

#[cfg(feature = "bincode")]
#[derive(Deserialize)]
struct Snapshot {
    vocabulary: Vec<u8>,
    params: DatabaseParams,
    index: Index,
}

/// Database persistence (requires the bincode feature, enabled by default).
#[cfg(feature = "bincode")]
impl<D: DescriptorOps> Database<D> {
    /// Save the vocabulary and every entry to a file
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> BowResult<()> {
        let vocabulary = self.vocabulary.to_bytes()?;
        let serialized = {
            let index = self.read();
            bincode::serialize(&SnapshotRef {
                vocabulary: &vocabulary,
                params: &self.params,
                index: &index,
            })?
        };
        let path = file.as_ref();
        let mut file = std::fs::File::create(path)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        info!(path = %path.display(), entries = self.len(), "database saved");
        Ok(())
    }

    /// Load a database saved with [`save`](Self::save)
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> BowResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        let snapshot: Snapshot = bincode::deserialize(&buffer)?;

        let vocabulary = Vocabulary::<D>::from_bytes(&snapshot.vocabulary)?;
        let index = snapshot.index;
        index.validate(&vocabulary, &snapshot.params)?;

        info!(entries = index.next_entry, "database loaded");
        Ok(Self {
            vocabulary: Arc::new(vocabulary),
            params: snapshot.params,
            index: RwLock::new(index),
        })
    }
}

impl<D: DescriptorOps> fmt::Debug for Database<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.read();
        f.debug_struct("Database")
            .field("Entries", &index.next_entry)
            .field("Words", &index.inverted.len())
            .field(
                "Postings",
                &index.inverted.iter().map(Vec::len).sum::<usize>(),
            )
            .field("Direct Index Level", &self.params.direct_index_level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::VocabularyParams;
    use approx::assert_relative_eq;

    fn image(bytes: &[u8]) -> Vec<Desc> {
        bytes.iter().map(|&b| [b; 32]).collect()
    }

    fn corpus() -> Vec<Vec<Desc>> {
        // One distinct descriptor per image: every image gets its own word.
        vec![
            image(&[0x00; 3]),
            image(&[0x70; 3]),
            image(&[0x0f; 3]),
            image(&[0xf0; 3]),
        ]
    }

    fn vocabulary() -> Vocabulary {
        Vocabulary::create(VocabularyParams::new(4, 2).seed(3), &corpus()).unwrap()
    }

    #[test]
    fn entries_are_numbered_in_order() {
        let db = Database::new(vocabulary(), DatabaseParams::default());
        assert!(db.is_empty());
        for (i, img) in corpus().iter().enumerate() {
            assert_eq!(db.add(img).unwrap(), i as EntryId);
        }
        assert_eq!(db.len(), 4);
    }

    #[test]
    fn untrained_database_refuses_work() {
        let db: Database = Database::new(
            Vocabulary::new(VocabularyParams::default()),
            DatabaseParams::default(),
        );
        assert!(matches!(db.add(&image(&[1])), Err(BowErr::NotTrained)));
        assert!(matches!(db.query(&image(&[1]), 1), Err(BowErr::NotTrained)));
        assert!(matches!(
            db.query_bow(&BowVector::new(), 1, None),
            Err(BowErr::NotTrained)
        ));
    }

    #[test]
    fn query_scores_match_vocabulary_scores() {
        let voc = Arc::new(vocabulary());
        let db = Database::with_shared(voc.clone(), DatabaseParams::default());
        let bows: Vec<BowVector> = corpus().iter().map(|i| voc.transform(i).unwrap()).collect();
        for bow in &bows {
            db.add_bow(bow, None).unwrap();
        }
        let query = voc.transform(&image(&[0x00, 0x70, 0x78])).unwrap();
        for r in db.query_bow(&query, 0, None).unwrap() {
            let expected = voc.score(&query, &bows[r.entry_id as usize]).unwrap();
            assert_eq!(r.score, expected);
        }
    }

    #[test]
    fn own_image_ranks_first() {
        let db = Database::new(vocabulary(), DatabaseParams::default());
        let corpus = corpus();
        for img in &corpus {
            db.add(img).unwrap();
        }
        for (i, img) in corpus.iter().enumerate() {
            let results = db.query(img, 4).unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].entry_id, i as EntryId);
            assert_relative_eq!(results[0].score, 1., epsilon = 1e-9);
        }
    }

    #[test]
    fn max_results_and_max_id() {
        let db = Database::new(vocabulary(), DatabaseParams::default());
        let img = image(&[0x00, 0x01, 0x03]);
        for _ in 0..5 {
            db.add(&img).unwrap();
        }
        let all = db.query(&img, 0).unwrap();
        assert_eq!(all.len(), 5);
        // identical scores rank by entry id
        let ids: Vec<EntryId> = all.iter().map(|r| r.entry_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(db.query(&img, 2).unwrap().len(), 2);

        let bow = db.vocabulary().transform(&img).unwrap();
        let capped = db.query_bow(&bow, 0, Some(2)).unwrap();
        assert_eq!(capped.iter().map(|r| r.entry_id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn foreign_words_are_rejected() {
        let db = Database::new(vocabulary(), DatabaseParams::default());
        let bow: BowVector = vec![(100_000, 1.)].into_iter().collect();
        assert!(matches!(db.add_bow(&bow, None), Err(BowErr::InvalidInput(_))));
        assert!(db.is_empty());
    }

    #[test]
    fn direct_index_is_kept_per_entry() {
        let db = Database::new(vocabulary(), DatabaseParams::with_direct_index(1));
        let img = image(&[0x00, 0x70, 0xfc]);
        let id = db.add(&img).unwrap();
        let fv = db.features(id).unwrap();
        assert_eq!(fv.pairs().count(), img.len());
        assert!(db.features(id + 1).is_none());

        let plain = Database::new(vocabulary(), DatabaseParams::default());
        let id = plain.add(&img).unwrap();
        assert!(plain.features(id).is_none());
    }

    #[cfg(feature = "bincode")]
    fn write_snapshot(path: &std::path::Path, params: DatabaseParams, index: &Index) {
        let vocabulary = vocabulary().to_bytes().unwrap();
        let bytes = bincode::serialize(&SnapshotRef {
            vocabulary: &vocabulary,
            params: &params,
            index,
        })
        .unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[cfg(feature = "bincode")]
    fn two_entries() -> Index {
        let mut index = Index::new(vocabulary().word_count());
        index.inverted[0] = vec![
            Posting { entry: 0, value: 1. },
            Posting { entry: 1, value: 1. },
        ];
        index.next_entry = 2;
        index
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn inconsistent_snapshots_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.db");
        let load = |params: DatabaseParams, index: &Index| {
            write_snapshot(&path, params, index);
            Database::<Orb>::load(&path)
        };

        let plain = DatabaseParams::default();
        assert!(load(plain, &two_entries()).is_ok());

        let mut out_of_order = two_entries();
        out_of_order.inverted[0].reverse();
        assert!(matches!(load(plain, &out_of_order), Err(BowErr::Format(_))));

        let mut duplicated = two_entries();
        duplicated.inverted[0][1].entry = 0;
        assert!(matches!(load(plain, &duplicated), Err(BowErr::Format(_))));

        let mut dangling = two_entries();
        dangling.inverted[1] = vec![Posting { entry: 2, value: 1. }];
        assert!(matches!(load(plain, &dangling), Err(BowErr::Format(_))));

        let mut not_finite = two_entries();
        not_finite.inverted[0][0].value = f64::NAN;
        assert!(matches!(load(plain, &not_finite), Err(BowErr::Format(_))));

        let mut missing_word = two_entries();
        missing_word.inverted.pop();
        assert!(matches!(load(plain, &missing_word), Err(BowErr::Format(_))));

        let direct = DatabaseParams::with_direct_index(1);
        let mut with_direct = two_entries();
        with_direct.direct = vec![FeatureVector::new(), FeatureVector::new()];
        assert!(load(direct, &with_direct).is_ok());
        // one direct index per entry
        with_direct.direct.pop();
        assert!(matches!(load(direct, &with_direct), Err(BowErr::Format(_))));

        let mut foreign_node = two_entries();
        let mut fv = FeatureVector::new();
        fv.add_feature(10_000, 0);
        foreign_node.direct = vec![FeatureVector::new(), fv];
        assert!(matches!(load(direct, &foreign_node), Err(BowErr::Format(_))));
    }

    #[test]
    fn posting_lists_follow_entries() {
        let voc = vocabulary();
        let (word, _) = voc.word_of(&[0x70; 32]).unwrap();
        let db = Database::new(voc, DatabaseParams::default());
        db.add(&image(&[0x70, 0x78, 0x7c])).unwrap();
        db.add(&image(&[0x00])).unwrap();
        db.add(&image(&[0x70])).unwrap();
        let entries: Vec<EntryId> = db.posting_list(word).iter().map(|p| p.entry).collect();
        assert_eq!(entries, vec![0, 2]);
    }
}
