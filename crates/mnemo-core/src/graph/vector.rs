//! Per-Category Vector Indexes
//!
//! One HNSW (USearch) index per node category, created lazily when the first
//! vector of that category arrives; the first insert fixes the category's
//! dimensionality. Node ids map to numeric labels owned by the category:
//! labels freed by removals are recycled before new ones are minted, and
//! capacity is reserved in fixed blocks ahead of inserts (usearch requires
//! room to exist before `add`).

use std::collections::HashMap;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::error::{MemoryError, Result};
use crate::graph::types::NodeCategory;

/// Labels/capacity are reserved in blocks of this size
const CAPACITY_BLOCK: usize = 64;

/// HNSW connectivity parameter
const DEFAULT_CONNECTIVITY: usize = 16;
/// HNSW expansion factor for index building
const DEFAULT_EXPANSION_ADD: usize = 128;
/// HNSW expansion factor for search
const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// Index statistics for one category
#[derive(Debug, Clone)]
pub struct VectorIndexStats {
    pub category: NodeCategory,
    pub total_vectors: usize,
    pub dimensions: usize,
}

struct CategoryIndex {
    index: Index,
    dimensions: usize,
    /// node id -> label
    slots: HashMap<String, u64>,
    /// label -> node id, for mapping search results back
    keys_by_label: HashMap<u64, String>,
    /// Labels returned by removals, recycled before minting new ones
    free_labels: Vec<u64>,
    next_label: u64,
}

impl CategoryIndex {
    fn new(dimensions: usize) -> Result<Self> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
            multi: false,
        };
        let index = Index::new(&options)
            .map_err(|e| MemoryError::Init(format!("Failed to create vector index: {}", e)))?;
        // First block up front so the earliest inserts never race capacity
        index
            .reserve(CAPACITY_BLOCK)
            .map_err(|e| MemoryError::Init(format!("Failed to reserve capacity: {}", e)))?;

        Ok(Self {
            index,
            dimensions,
            slots: HashMap::new(),
            keys_by_label: HashMap::new(),
            free_labels: Vec::new(),
            next_label: 0,
        })
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(MemoryError::InvalidInput(format!(
                "embedding dimension mismatch: index has {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        Ok(())
    }

    /// Grow capacity to the next block boundary when the index is full
    fn ensure_room(&self) -> Result<()> {
        let needed = self.index.size() + 1;
        if needed > self.index.capacity() {
            let target = needed.div_ceil(CAPACITY_BLOCK) * CAPACITY_BLOCK;
            self.index
                .reserve(target)
                .map_err(|e| MemoryError::Init(format!("Failed to reserve capacity: {}", e)))?;
        }
        Ok(())
    }

    /// Insert or replace a node's vector
    ///
    /// A replaced node keeps its label; the stale vector is dropped first so
    /// the index never holds two vectors for one node. Mappings for a new
    /// node land only after the insert succeeds.
    fn upsert(&mut self, key: &str, vector: &[f32]) -> Result<()> {
        self.check_dimensions(vector)?;

        let (label, fresh) = match self.slots.get(key) {
            Some(&label) => {
                self.index
                    .remove(label)
                    .map_err(|e| MemoryError::Init(format!("Failed to replace vector: {}", e)))?;
                (label, false)
            }
            None => {
                let label = self.free_labels.pop().unwrap_or_else(|| {
                    let minted = self.next_label;
                    self.next_label += 1;
                    minted
                });
                (label, true)
            }
        };

        self.ensure_room()?;
        if let Err(e) = self.index.add(label, vector) {
            if fresh {
                self.free_labels.push(label);
            }
            return Err(MemoryError::Init(format!("Failed to add vector: {}", e)));
        }
        if fresh {
            self.slots.insert(key.to_string(), label);
            self.keys_by_label.insert(label, key.to_string());
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let Some(label) = self.slots.remove(key) else {
            return Ok(false);
        };
        self.keys_by_label.remove(&label);
        self.index
            .remove(label)
            .map_err(|e| MemoryError::Init(format!("Failed to remove vector: {}", e)))?;
        self.free_labels.push(label);
        Ok(true)
    }

    fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        self.check_dimensions(query)?;
        if self.slots.is_empty() {
            return Ok(vec![]);
        }

        let matches = self
            .index
            .search(query, limit)
            .map_err(|e| MemoryError::Init(format!("Vector search failed: {}", e)))?;

        let hits = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(label, distance)| {
                // A label missing from the map was removed mid-search; drop it
                let key = self.keys_by_label.get(label)?;
                let similarity = (1.0 - *distance).clamp(-1.0, 1.0);
                Some((key.clone(), similarity))
            })
            .collect();
        Ok(hits)
    }
}

/// Vector indexes for all searchable categories
///
/// Indexes are created lazily when the first vector of a category arrives,
/// fixing the dimensionality for the category from then on.
pub struct CategoryVectorIndex {
    indexes: HashMap<NodeCategory, CategoryIndex>,
}

impl Default for CategoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CategoryVectorIndex {
    /// Create an empty set of indexes
    pub fn new() -> Self {
        Self {
            indexes: HashMap::new(),
        }
    }

    /// Insert or replace a vector for a node
    pub fn add(&mut self, category: NodeCategory, key: &str, vector: &[f32]) -> Result<()> {
        if !self.indexes.contains_key(&category) {
            self.indexes.insert(category, CategoryIndex::new(vector.len())?);
        }
        self.indexes
            .get_mut(&category)
            .expect("index inserted above")
            .upsert(key, vector)
    }

    /// Remove a node's vector; returns whether anything was removed
    pub fn remove(&mut self, category: NodeCategory, key: &str) -> Result<bool> {
        match self.indexes.get_mut(&category) {
            Some(index) => index.remove(key),
            None => Ok(false),
        }
    }

    /// Nearest-neighbour search within one category
    pub fn search(
        &self,
        category: NodeCategory,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        match self.indexes.get(&category) {
            Some(index) => index.search(query, limit),
            None => Ok(vec![]),
        }
    }

    /// Dimensions of a category's index, when it exists
    pub fn dimensions(&self, category: NodeCategory) -> Option<usize> {
        self.indexes.get(&category).map(|i| i.dimensions)
    }

    /// Statistics for every live index
    pub fn stats(&self) -> Vec<VectorIndexStats> {
        self.indexes
            .iter()
            .map(|(category, index)| VectorIndexStats {
                category: *category,
                total_vectors: index.slots.len(),
                dimensions: index.dimensions,
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_search() {
        let mut index = CategoryVectorIndex::new();
        index
            .add(NodeCategory::Statement, "s1", &[1.0, 0.0, 0.0])
            .unwrap();
        index
            .add(NodeCategory::Statement, "s2", &[0.0, 1.0, 0.0])
            .unwrap();

        let hits = index
            .search(NodeCategory::Statement, &[1.0, 0.0, 0.0], 2)
            .unwrap();
        assert_eq!(hits[0].0, "s1");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = CategoryVectorIndex::new();
        index
            .add(NodeCategory::Statement, "s1", &[1.0, 0.0, 0.0])
            .unwrap();
        assert!(index
            .add(NodeCategory::Statement, "s2", &[1.0, 0.0])
            .is_err());
    }

    #[test]
    fn test_categories_are_isolated() {
        let mut index = CategoryVectorIndex::new();
        index
            .add(NodeCategory::Statement, "s1", &[1.0, 0.0])
            .unwrap();
        index
            .add(NodeCategory::Entity, "e1", &[0.0, 1.0, 0.0])
            .unwrap();

        // Different dimensions per category are fine
        assert_eq!(index.dimensions(NodeCategory::Statement), Some(2));
        assert_eq!(index.dimensions(NodeCategory::Entity), Some(3));

        let hits = index.search(NodeCategory::Entity, &[0.0, 1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "e1");
    }

    #[test]
    fn test_search_empty_category_returns_nothing() {
        let index = CategoryVectorIndex::new();
        let hits = index.search(NodeCategory::Summary, &[1.0], 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut index = CategoryVectorIndex::new();
        index.add(NodeCategory::Entity, "e1", &[1.0, 0.0]).unwrap();
        assert!(index.remove(NodeCategory::Entity, "e1").unwrap());
        assert!(!index.remove(NodeCategory::Entity, "e1").unwrap());
        let hits = index.search(NodeCategory::Entity, &[1.0, 0.0], 5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut index = CategoryVectorIndex::new();
        index.add(NodeCategory::Summary, "m1", &[1.0, 0.0]).unwrap();
        index.add(NodeCategory::Summary, "m1", &[0.0, 1.0]).unwrap();

        let hits = index.search(NodeCategory::Summary, &[0.0, 1.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "m1");
        assert!(hits[0].1 > 0.99);
    }

    #[test]
    fn test_removed_labels_are_recycled() {
        let mut index = CategoryVectorIndex::new();
        index.add(NodeCategory::Entity, "e1", &[1.0, 0.0]).unwrap();
        index.remove(NodeCategory::Entity, "e1").unwrap();
        index.add(NodeCategory::Entity, "e2", &[0.0, 1.0]).unwrap();

        // The recycled slot belongs to the new key only
        let hits = index.search(NodeCategory::Entity, &[0.0, 1.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "e2");
    }

    #[test]
    fn test_growth_past_initial_block() {
        let mut index = CategoryVectorIndex::new();
        for i in 0..(CAPACITY_BLOCK + 10) {
            let angle = i as f32;
            index
                .add(NodeCategory::Statement, &format!("s{i}"), &[angle.cos(), angle.sin()])
                .unwrap();
        }
        let hits = index
            .search(NodeCategory::Statement, &[1.0, 0.0], 3)
            .unwrap();
        assert_eq!(hits.len(), 3);
    }
}
