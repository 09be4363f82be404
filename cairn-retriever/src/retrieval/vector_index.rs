//! Approximate nearest-neighbour index over unit-length embeddings.
//!
//! The index is a hierarchical navigable small-world graph. Each vector is a node
//! that lives on layer 0 and, with geometrically decreasing probability, on higher
//! layers too. Searches descend greedily from the sparse top layer and then run a
//! best-first beam search of width `ef_search` on layer 0. Results are approximate:
//! the true top-k is usually, but not always, returned.
//!
//! Vectors are addressed by caller-supplied `u64` labels. Distance is squared
//! Euclidean, which for unit vectors equals `2 - 2 * cosine`.
//!
//! ## Capacity
//!
//! The index is created with an expected capacity and refuses insertions beyond it
//! with [`VectorIndexError::CapacityExceeded`]. Growing is an explicit
//! [`VectorIndex::reserve`] call made by the owner.
//!
//! ## Deletion
//!
//! [`VectorIndex::mark_deleted`] tombstones a label: the node keeps routing searches
//! but never appears in results. [`VectorIndex::compacted`] rebuilds a fresh graph
//! from the live vectors, keeping their labels.
//!
//! ## Persistence
//!
//! [`VectorIndex::to_bytes`] produces a self-describing binary image:
//!
//! ```text
//! magic "CAIRNHNS" | version u32 | endian marker u32 | dimension u32 | capacity u64
//! m u32 | ef_construction u32 | ef_search u32 | max_level u32 | entry u64
//! node_count u64
//! per node: label u64 | deleted u8 | level u8 | per layer: count u32, count x u32
//! vectors: node_count x dimension x f32
//! blake3 checksum of everything above (32 bytes)
//! ```
//!
//! All integers and floats are written in native byte order. The endian marker lets
//! a loader on a machine with a different byte order refuse the file cleanly.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;

const MAGIC: &[u8; 8] = b"CAIRNHNS";
const FORMAT_VERSION: u32 = 1;
const ENDIAN_MARKER: u32 = 0x0102_0304;
const CHECKSUM_LEN: usize = 32;
const MAX_LEVEL: usize = 16;
const NO_ENTRY: u64 = u64::MAX;

#[derive(Debug, thiserror::Error)]
pub enum VectorIndexError {
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Label {0} is already present in the index")]
    DuplicateLabel(u64),

    #[error("Index capacity of {capacity} vectors exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("Vector contains non-finite values")]
    NonFiniteVector,

    #[error("Unsupported index format version {0}")]
    UnsupportedVersion(u32),

    #[error("Index file was written with a different byte order")]
    EndiannessMismatch,

    #[error("Index checksum mismatch")]
    ChecksumMismatch,

    #[error("Corrupt index data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VectorIndexError>;

/// Graph construction and search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    /// Links per node on upper layers. Layer 0 allows twice as many.
    pub m: usize,
    /// Beam width while inserting
    pub ef_construction: usize,
    /// Beam width while searching
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
            ef_search: 64,
        }
    }
}

impl HnswParams {
    fn sanitized(self) -> Self {
        Self {
            m: self.m.max(2),
            ef_construction: self.ef_construction.max(1),
            ef_search: self.ef_search.max(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    label: u64,
    deleted: bool,
    /// Neighbour lists, one per layer this node lives on.
    links: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist: f32,
    node: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.node.cmp(&other.node))
    }
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    capacity: usize,
    params: HnswParams,
    nodes: Vec<Node>,
    /// Flat storage, node `i` occupies `[i * dimension, (i + 1) * dimension)`.
    vectors: Vec<f32>,
    label_to_node: HashMap<u64, u32>,
    entry_point: Option<u32>,
    max_level: usize,
    tombstones: usize,
}

impl VectorIndex {
    /// Creates an empty index with default graph parameters.
    pub fn create(dimension: usize, capacity: usize) -> Self {
        Self::with_params(dimension, capacity, HnswParams::default())
    }

    pub fn with_params(dimension: usize, capacity: usize, params: HnswParams) -> Self {
        Self {
            dimension,
            capacity,
            params: params.sanitized(),
            nodes: Vec::new(),
            vectors: Vec::new(),
            label_to_node: HashMap::new(),
            entry_point: None,
            max_level: 0,
            tombstones: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Number of stored vectors, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of vectors that can still be returned by a search.
    pub fn live_count(&self) -> usize {
        self.nodes.len() - self.tombstones
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    /// Fraction of stored vectors that are tombstoned.
    pub fn tombstone_ratio(&self) -> f32 {
        if self.nodes.is_empty() {
            0.0
        } else {
            self.tombstones as f32 / self.nodes.len() as f32
        }
    }

    /// Slots left before [`reserve`](Self::reserve) is needed.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.nodes.len())
    }

    /// Grows capacity by `additional` slots.
    pub fn reserve(&mut self, additional: usize) {
        self.capacity = self.capacity.saturating_add(additional);
        self.vectors
            .reserve(additional.saturating_mul(self.dimension).min(1 << 24));
    }

    /// Whether `label` refers to a live (not tombstoned) vector.
    pub fn contains(&self, label: u64) -> bool {
        self.label_to_node
            .get(&label)
            .is_some_and(|&n| !self.nodes[n as usize].deleted)
    }

    /// Live labels in insertion order.
    pub fn labels(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.iter().filter(|n| !n.deleted).map(|n| n.label)
    }

    /// Stored vector for a live label.
    pub fn vector(&self, label: u64) -> Option<&[f32]> {
        let &node = self.label_to_node.get(&label)?;
        if self.nodes[node as usize].deleted {
            return None;
        }
        Some(self.node_vector(node))
    }

    /// Inserts `vector` under `label`.
    pub fn add(&mut self, vector: &[f32], label: u64) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(VectorIndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(VectorIndexError::NonFiniteVector);
        }
        if self.label_to_node.contains_key(&label) {
            return Err(VectorIndexError::DuplicateLabel(label));
        }
        if self.nodes.len() >= self.capacity {
            return Err(VectorIndexError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let node_id = self.nodes.len() as u32;
        let level = level_for_label(label, self.params.m);
        self.vectors.extend_from_slice(vector);
        self.nodes.push(Node {
            label,
            deleted: false,
            links: vec![Vec::new(); level + 1],
        });
        self.label_to_node.insert(label, node_id);

        let Some(mut entry) = self.entry_point else {
            self.entry_point = Some(node_id);
            self.max_level = level;
            return Ok(());
        };

        for layer in (level + 1..=self.max_level).rev() {
            entry = self.greedy_closest(vector, entry, layer);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(vector, entry, self.params.ef_construction, layer);
            let max_links = self.max_links(layer);
            let selected: Vec<u32> = found
                .iter()
                .filter(|c| c.node != node_id)
                .take(max_links)
                .map(|c| c.node)
                .collect();

            for &neighbour in &selected {
                self.connect(neighbour, node_id, layer);
            }
            self.nodes[node_id as usize].links[layer] = selected;

            if let Some(best) = found.first() {
                entry = best.node;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(node_id);
        }

        Ok(())
    }

    /// Returns up to `k` live labels nearest to `query`, by ascending distance.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.dimension {
            return Err(VectorIndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let Some(mut entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 || self.live_count() == 0 {
            return Ok(Vec::new());
        }

        for layer in (1..=self.max_level).rev() {
            entry = self.greedy_closest(query, entry, layer);
        }

        // Tombstones occupy beam slots, so widen the beam to compensate.
        let ef = self
            .params
            .ef_search
            .max(k)
            .saturating_add(self.tombstones)
            .min(self.nodes.len());
        if ef >= self.nodes.len() {
            return Ok(self.exhaustive_search(query, k));
        }
        let found = self.search_layer(query, entry, ef, 0);

        Ok(found
            .into_iter()
            .filter(|c| !self.nodes[c.node as usize].deleted)
            .take(k)
            .map(|c| (self.nodes[c.node as usize].label, c.dist))
            .collect())
    }

    /// Linear scan, used when the beam would cover the whole index anyway.
    fn exhaustive_search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        let mut scored: Vec<Candidate> = (0..self.nodes.len() as u32)
            .filter(|&n| !self.nodes[n as usize].deleted)
            .map(|n| Candidate {
                dist: self.distance_to(query, n),
                node: n,
            })
            .collect();
        scored.sort();
        scored
            .into_iter()
            .take(k)
            .map(|c| (self.nodes[c.node as usize].label, c.dist))
            .collect()
    }

    /// Tombstones `label`. Returns `false` if it was absent or already deleted.
    pub fn mark_deleted(&mut self, label: u64) -> bool {
        let Some(&node) = self.label_to_node.get(&label) else {
            return false;
        };
        let node = &mut self.nodes[node as usize];
        if node.deleted {
            return false;
        }
        node.deleted = true;
        self.tombstones += 1;
        true
    }

    /// Rebuilds the graph from live vectors only. Labels and capacity are kept.
    pub fn compacted(&self) -> Result<Self> {
        let mut fresh = Self::with_params(self.dimension, self.capacity, self.params);
        for (idx, node) in self.nodes.iter().enumerate() {
            if !node.deleted {
                fresh.add(self.node_vector(idx as u32), node.label)?;
            }
        }
        Ok(fresh)
    }

    /// Writes the binary image to `path`. Callers wanting atomic replacement
    /// should write [`to_bytes`](Self::to_bytes) through a temp file instead.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Reads an index written by [`save`](Self::save).
    ///
    /// Fails if the stored dimension differs from `expected_dimension`. The loaded
    /// capacity is the larger of the stored capacity and `capacity`.
    pub fn load(path: &Path, expected_dimension: usize, capacity: usize) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, expected_dimension, capacity)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            64 + self.nodes.len() * (16 + self.params.m * 8) + self.vectors.len() * 4,
        );
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_ne_bytes());
        out.extend_from_slice(&ENDIAN_MARKER.to_ne_bytes());
        out.extend_from_slice(&(self.dimension as u32).to_ne_bytes());
        out.extend_from_slice(&(self.capacity as u64).to_ne_bytes());
        out.extend_from_slice(&(self.params.m as u32).to_ne_bytes());
        out.extend_from_slice(&(self.params.ef_construction as u32).to_ne_bytes());
        out.extend_from_slice(&(self.params.ef_search as u32).to_ne_bytes());
        out.extend_from_slice(&(self.max_level as u32).to_ne_bytes());
        let entry = self.entry_point.map(u64::from).unwrap_or(NO_ENTRY);
        out.extend_from_slice(&entry.to_ne_bytes());
        out.extend_from_slice(&(self.nodes.len() as u64).to_ne_bytes());

        for node in &self.nodes {
            out.extend_from_slice(&node.label.to_ne_bytes());
            out.push(u8::from(node.deleted));
            out.push((node.links.len() - 1) as u8);
            for layer in &node.links {
                out.extend_from_slice(&(layer.len() as u32).to_ne_bytes());
                for &neighbour in layer {
                    out.extend_from_slice(&neighbour.to_ne_bytes());
                }
            }
        }

        out.extend_from_slice(bytemuck::cast_slice(&self.vectors));

        let checksum = blake3::hash(&out);
        out.extend_from_slice(checksum.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8], expected_dimension: usize, capacity: usize) -> Result<Self> {
        if bytes.len() < MAGIC.len() + CHECKSUM_LEN {
            return Err(VectorIndexError::Corrupt("file too short".to_string()));
        }
        let (body, stored_checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);

        let mut reader = ByteReader::new(body);
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(VectorIndexError::Corrupt("bad magic".to_string()));
        }
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(VectorIndexError::UnsupportedVersion(version));
        }
        if reader.u32()? != ENDIAN_MARKER {
            return Err(VectorIndexError::EndiannessMismatch);
        }
        if blake3::hash(body).as_bytes() != stored_checksum {
            return Err(VectorIndexError::ChecksumMismatch);
        }

        let dimension = reader.u32()? as usize;
        if dimension != expected_dimension {
            return Err(VectorIndexError::DimensionMismatch {
                expected: expected_dimension,
                actual: dimension,
            });
        }
        let stored_capacity = reader.u64()? as usize;
        let params = HnswParams {
            m: reader.u32()? as usize,
            ef_construction: reader.u32()? as usize,
            ef_search: reader.u32()? as usize,
        }
        .sanitized();
        let max_level = reader.u32()? as usize;
        let entry = reader.u64()?;
        let node_count = reader.u64()? as usize;

        if max_level > MAX_LEVEL {
            return Err(VectorIndexError::Corrupt(format!(
                "max level {max_level} out of range"
            )));
        }
        // Each node needs at least 14 bytes, which bounds a hostile node count.
        if node_count > body.len() / 14 {
            return Err(VectorIndexError::Corrupt(format!(
                "node count {node_count} exceeds file size"
            )));
        }

        let mut nodes = Vec::with_capacity(node_count);
        let mut label_to_node = HashMap::with_capacity(node_count);
        let mut tombstones = 0;
        for idx in 0..node_count {
            let label = reader.u64()?;
            let deleted = match reader.u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(VectorIndexError::Corrupt(format!(
                        "invalid deleted flag {other}"
                    )));
                }
            };
            let level = reader.u8()? as usize;
            if level > max_level {
                return Err(VectorIndexError::Corrupt(format!(
                    "node level {level} above max level {max_level}"
                )));
            }
            let mut links = Vec::with_capacity(level + 1);
            for _ in 0..=level {
                let count = reader.u32()? as usize;
                let mut layer = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    let neighbour = reader.u32()?;
                    if neighbour as usize >= node_count {
                        return Err(VectorIndexError::Corrupt(format!(
                            "link {neighbour} out of range"
                        )));
                    }
                    layer.push(neighbour);
                }
                links.push(layer);
            }
            if label_to_node.insert(label, idx as u32).is_some() {
                return Err(VectorIndexError::DuplicateLabel(label));
            }
            if deleted {
                tombstones += 1;
            }
            nodes.push(Node {
                label,
                deleted,
                links,
            });
        }

        let vector_bytes = node_count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| VectorIndexError::Corrupt("vector block too large".to_string()))?;
        let vectors: Vec<f32> = reader
            .take(vector_bytes)?
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if !reader.is_at_end() {
            return Err(VectorIndexError::Corrupt("trailing bytes".to_string()));
        }

        let entry_point = if entry == NO_ENTRY {
            None
        } else if (entry as usize) < node_count {
            Some(entry as u32)
        } else {
            return Err(VectorIndexError::Corrupt(format!(
                "entry point {entry} out of range"
            )));
        };
        if entry_point.is_none() != nodes.is_empty() {
            return Err(VectorIndexError::Corrupt(
                "entry point inconsistent with node count".to_string(),
            ));
        }

        Ok(Self {
            dimension,
            capacity: stored_capacity.max(capacity).max(node_count),
            params,
            nodes,
            vectors,
            label_to_node,
            entry_point,
            max_level,
            tombstones,
        })
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn node_vector(&self, node: u32) -> &[f32] {
        let start = node as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    fn distance_to(&self, query: &[f32], node: u32) -> f32 {
        squared_l2(query, self.node_vector(node))
    }

    fn neighbours(&self, node: u32, layer: usize) -> &[u32] {
        self.nodes[node as usize]
            .links
            .get(layer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn greedy_closest(&self, query: &[f32], entry: u32, layer: usize) -> u32 {
        self.search_layer(query, entry, 1, layer)
            .first()
            .map(|c| c.node)
            .unwrap_or(entry)
    }

    /// Best-first beam search on one layer. Returns candidates by ascending distance.
    fn search_layer(&self, query: &[f32], entry: u32, ef: usize, layer: usize) -> Vec<Candidate> {
        let start = Candidate {
            dist: self.distance_to(query, entry),
            node: entry,
        };
        let mut visited = HashSet::from([entry]);
        let mut frontier = BinaryHeap::from([Reverse(start)]);
        let mut best = BinaryHeap::from([start]);

        while let Some(Reverse(current)) = frontier.pop() {
            let worst = best.peek().map_or(f32::INFINITY, |c| c.dist);
            if current.dist > worst && best.len() >= ef {
                break;
            }
            for &neighbour in self.neighbours(current.node, layer) {
                if !visited.insert(neighbour) {
                    continue;
                }
                let dist = self.distance_to(query, neighbour);
                let worst = best.peek().map_or(f32::INFINITY, |c| c.dist);
                if best.len() < ef || dist < worst {
                    let candidate = Candidate {
                        dist,
                        node: neighbour,
                    };
                    frontier.push(Reverse(candidate));
                    best.push(candidate);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        best.into_sorted_vec()
    }

    /// Adds a back link from `node` to `new_node`, pruning to the closest links.
    fn connect(&mut self, node: u32, new_node: u32, layer: usize) {
        let max_links = self.max_links(layer);
        let Some(links) = self.nodes[node as usize].links.get(layer) else {
            return;
        };
        if links.len() < max_links {
            self.nodes[node as usize].links[layer].push(new_node);
            return;
        }

        let base = self.node_vector(node);
        let mut ranked: Vec<Candidate> = links
            .iter()
            .copied()
            .chain(std::iter::once(new_node))
            .map(|n| Candidate {
                dist: squared_l2(base, self.node_vector(n)),
                node: n,
            })
            .collect();
        ranked.sort();
        ranked.truncate(max_links);
        self.nodes[node as usize].links[layer] = ranked.into_iter().map(|c| c.node).collect();
    }
}

/// Squared Euclidean distance.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Deterministic level assignment: the label's blake3 hash drives an exponential draw.
fn level_for_label(label: u64, m: usize) -> usize {
    let hash = blake3::hash(&label.to_le_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&hash.as_bytes()[..8]);
    // 53 random bits mapped into the open interval (0, 1).
    let uniform = ((u64::from_le_bytes(raw) >> 11) as f64 + 0.5) / (1u64 << 53) as f64;
    let level_mult = 1.0 / (m as f64).ln();
    ((-uniform.ln() * level_mult).floor() as usize).min(MAX_LEVEL)
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| VectorIndexError::Corrupt("unexpected end of data".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.array()?))
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}
