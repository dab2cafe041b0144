//! Incremental bag-of-binary-words vocabulary for place recognition.
//!
//! Unlike a pre-trained DBoW2 tree, this vocabulary grows with the map:
//! a descriptor that is not within `match_radius` of an existing word
//! becomes a new word. Words and their inverted-index entries are only
//! ever appended, so a query that matched a keyframe once keeps matching
//! it after any number of further insertions.
//!
//! # Key Types
//!
//! - [`BowVector`]: word id -> L1-normalized TF-IDF weight
//! - [`Vocabulary`]: words, LSH tables for candidate lookup, inverted index
//!
//! # Word assignment
//!
//! Candidate words are the ones sharing at least one LSH bucket with the
//! descriptor. Among candidates within the radius, the lowest word id wins.
//! Since new words always get higher ids and buckets are append-only, the
//! assignment of a descriptor never changes once its word exists.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::map::KeyFrameId;
use crate::error::{Result, SlamError};
use crate::tracking::frame::orb::DESCRIPTOR_LENGTHS;
use crate::tracking::frame::Descriptors;
use crate::tracking::matching::{hamming, scaled_threshold};

/// Visual word identifier. Dense, assigned in creation order.
pub type WordId = u32;

/// Bag-of-Words vector: word_id -> TF-IDF weight, L1-normalized.
pub type BowVector = BTreeMap<WordId, f64>;

/// Vocabulary parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VocabularyConfig {
    /// Hamming radius (per 256 bits) within which a descriptor maps to an
    /// existing word.
    /// Default: 40
    pub match_radius: u32,

    /// Number of LSH tables.
    /// Default: 16
    pub lsh_tables: usize,

    /// Sampled bits per LSH key (at most 32).
    /// Default: 10
    pub lsh_bits: usize,

    /// Seed for the LSH bit selection.
    /// Default: 11
    pub seed: u64,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            match_radius: 40,
            lsh_tables: 16,
            lsh_bits: 10,
            seed: 11,
        }
    }
}

impl VocabularyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.match_radius == 0 || self.match_radius >= 128 {
            return Err(SlamError::Config(format!(
                "vocabulary.match_radius must be in 1..128, got {}",
                self.match_radius
            )));
        }
        if self.lsh_tables == 0 {
            return Err(SlamError::Config("vocabulary.lsh_tables must be positive".into()));
        }
        if self.lsh_bits == 0 || self.lsh_bits > 32 {
            return Err(SlamError::Config("vocabulary.lsh_bits must be in 1..=32".into()));
        }
        Ok(())
    }
}

/// One locality-sensitive hash table over sampled descriptor bits.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LshTable {
    bits: Vec<u16>,
    buckets: HashMap<u32, Vec<WordId>>,
}

impl LshTable {
    fn key(&self, desc: &[u8]) -> u32 {
        self.bits.iter().enumerate().fold(0u32, |key, (i, &bit)| {
            let byte = desc[bit as usize / 8];
            let set = (byte >> (bit % 8)) & 1;
            key | ((set as u32) << i)
        })
    }
}

/// A keyframe's word histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    words: BTreeMap<WordId, u32>,
}

/// Incremental visual vocabulary with an inverted index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    config: VocabularyConfig,
    /// Word representatives (the descriptor that created each word).
    words: Descriptors,
    tables: Vec<LshTable>,
    /// word id -> keyframes containing it, in insertion order.
    inverted: Vec<Vec<KeyFrameId>>,
    documents: BTreeMap<KeyFrameId, Document>,
    /// Keyframe ids in insertion order, for temporal exclusion.
    insertion_order: Vec<KeyFrameId>,
    /// Keyframes removed from the map. Their entries stay, but they are
    /// never returned by a query.
    retired: HashSet<KeyFrameId>,
}

impl Vocabulary {
    /// Empty vocabulary for descriptors of `descriptor_len` bytes.
    pub fn new(config: VocabularyConfig, descriptor_len: usize) -> Result<Self> {
        config.validate()?;
        if !DESCRIPTOR_LENGTHS.contains(&descriptor_len) {
            return Err(SlamError::Config(format!(
                "unsupported descriptor length {}",
                descriptor_len
            )));
        }
        let n_bits = descriptor_len * 8;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let tables = (0..config.lsh_tables)
            .map(|_| LshTable {
                bits: sample(&mut rng, n_bits, config.lsh_bits.min(n_bits))
                    .into_iter()
                    .map(|b| b as u16)
                    .collect(),
                buckets: HashMap::new(),
            })
            .collect();
        Ok(Self {
            config,
            words: Descriptors::new(descriptor_len),
            tables,
            inverted: Vec::new(),
            documents: BTreeMap::new(),
            insertion_order: Vec::new(),
            retired: HashSet::new(),
        })
    }

    pub fn descriptor_len(&self) -> usize {
        self.words.descriptor_len()
    }

    /// Total number of visual words. Never decreases.
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Number of keyframes ever added.
    pub fn num_documents(&self) -> usize {
        self.documents.len()
    }

    pub fn contains(&self, kf: KeyFrameId) -> bool {
        self.documents.contains_key(&kf) && !self.retired.contains(&kf)
    }

    fn check_len(&self, descriptors: &Descriptors) -> Result<()> {
        if !descriptors.is_empty() && descriptors.descriptor_len() != self.descriptor_len() {
            return Err(SlamError::DescriptorLengthMismatch {
                expected: self.descriptor_len(),
                found: descriptors.descriptor_len(),
            });
        }
        Ok(())
    }

    fn radius(&self) -> u32 {
        scaled_threshold(self.config.match_radius, self.descriptor_len())
    }

    /// Word for a descriptor, without creating one.
    pub fn quantize(&self, desc: &[u8]) -> Option<WordId> {
        let radius = self.radius();
        let mut best: Option<WordId> = None;
        for table in &self.tables {
            let Some(bucket) = table.buckets.get(&table.key(desc)) else {
                continue;
            };
            for &w in bucket {
                if best.map_or(false, |b| w >= b) {
                    continue;
                }
                if hamming(desc, self.words.row(w as usize)) <= radius {
                    best = Some(w);
                }
            }
        }
        best
    }

    fn create_word(&mut self, desc: &[u8]) -> Result<WordId> {
        let id = self.words.len() as WordId;
        self.words.push(desc)?;
        for table in &mut self.tables {
            let key = table.key(desc);
            table.buckets.entry(key).or_default().push(id);
        }
        self.inverted.push(Vec::new());
        Ok(id)
    }

    /// Incorporate a keyframe's descriptors.
    ///
    /// Fails before touching any state if the descriptor length differs from
    /// the vocabulary's. Returns the number of words created.
    pub fn add_descriptors(&mut self, kf: KeyFrameId, descriptors: &Descriptors) -> Result<usize> {
        self.check_len(descriptors)?;
        let before = self.num_words();
        let mut counts: BTreeMap<WordId, u32> = BTreeMap::new();
        for desc in descriptors.iter() {
            let w = match self.quantize(desc) {
                Some(w) => w,
                None => self.create_word(desc)?,
            };
            *counts.entry(w).or_insert(0) += 1;
        }

        let is_new = !self.documents.contains_key(&kf);
        let doc = self.documents.entry(kf).or_insert_with(|| Document {
            words: BTreeMap::new(),
        });
        for (w, c) in counts {
            let slot = doc.words.entry(w).or_insert(0);
            if *slot == 0 {
                self.inverted[w as usize].push(kf);
            }
            *slot += c;
        }
        if is_new {
            self.insertion_order.push(kf);
        }
        let created = self.num_words() - before;
        debug!(
            "vocabulary: {} +{} words ({} total, {} keyframes)",
            kf,
            created,
            self.num_words(),
            self.num_documents()
        );
        Ok(created)
    }

    /// Exclude a keyframe from future query results.
    pub fn retire(&mut self, kf: KeyFrameId) {
        if self.documents.contains_key(&kf) {
            self.retired.insert(kf);
        }
    }

    fn idf(&self, w: WordId) -> f64 {
        let n = self.documents.len().max(1) as f64;
        let df = self.inverted[w as usize].len().max(1) as f64;
        (1.0 + n / df).ln()
    }

    fn normalize(mut bow: BowVector) -> BowVector {
        let sum: f64 = bow.values().map(|v| v.abs()).sum();
        if sum > 0.0 {
            bow.values_mut().for_each(|v| *v /= sum);
        }
        bow
    }

    fn weigh(&self, counts: &BTreeMap<WordId, u32>) -> BowVector {
        let bow = counts
            .iter()
            .map(|(&w, &c)| (w, c as f64 * self.idf(w)))
            .collect();
        Self::normalize(bow)
    }

    /// TF-IDF vector of a descriptor set. Unknown descriptors are ignored.
    pub fn transform(&self, descriptors: &Descriptors) -> Result<BowVector> {
        self.check_len(descriptors)?;
        let mut counts = BTreeMap::new();
        for desc in descriptors.iter() {
            if let Some(w) = self.quantize(desc) {
                *counts.entry(w).or_insert(0u32) += 1;
            }
        }
        Ok(self.weigh(&counts))
    }

    /// TF-IDF vector of a stored keyframe.
    pub fn bow_of(&self, kf: KeyFrameId) -> Option<BowVector> {
        self.documents.get(&kf).map(|doc| self.weigh(&doc.words))
    }

    /// Keyframes whose histogram overlaps the query, best first.
    ///
    /// The `exclude_recent` most recently added keyframes are skipped. An
    /// empty vocabulary yields an empty list.
    pub fn query(&self, descriptors: &Descriptors, exclude_recent: usize) -> Result<Vec<(KeyFrameId, f64)>> {
        if self.documents.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.transform(descriptors)?;
        Ok(self.query_bow(&query, exclude_recent))
    }

    /// Same as [`Vocabulary::query`] for an already weighted vector.
    pub fn query_bow(&self, query: &BowVector, exclude_recent: usize) -> Vec<(KeyFrameId, f64)> {
        let cutoff = self.insertion_order.len().saturating_sub(exclude_recent);
        let recent: HashSet<KeyFrameId> = self.insertion_order[cutoff..].iter().copied().collect();

        let mut candidates: HashSet<KeyFrameId> = HashSet::new();
        for &w in query.keys() {
            for &kf in &self.inverted[w as usize] {
                if !recent.contains(&kf) && !self.retired.contains(&kf) {
                    candidates.insert(kf);
                }
            }
        }

        let mut results: Vec<(KeyFrameId, f64)> = candidates
            .into_iter()
            .filter_map(|kf| {
                let bow = self.bow_of(kf)?;
                let s = Self::score(query, &bow);
                (s > 0.0).then_some((kf, s))
            })
            .collect();
        results.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        results
    }

    /// Compute similarity score between two BowVectors.
    ///
    /// Uses L1 scoring: 1 - 0.5 * ||v1 - v2||_1
    /// Returns a score in [0, 1] where 1 means identical.
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff_sum = 0.0;
        for (word_id, w1) in v1 {
            let w2 = v2.get(word_id).copied().unwrap_or(0.0);
            diff_sum += (w1 - w2).abs();
        }
        for (word_id, w2) in v2 {
            if !v1.contains_key(word_id) {
                diff_sum += w2.abs();
            }
        }
        (1.0 - 0.5 * diff_sum).max(0.0)
    }
}
