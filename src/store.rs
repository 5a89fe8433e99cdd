//! Flat read-only vector store backing the reference corpus.
//!
//! Row-major `f32` vectors in a raw little-endian file, with a JSON manifest
//! recording the dimension, row count, and the embedding model that produced
//! the vectors. Row `i` embeds the rendered text of catalog row `i`.

use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Vector file name inside a store directory.
pub const VECTORS_FILE: &str = "vectors.f32";
/// Manifest file name inside a store directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Errors raised while loading or querying a vector store.
#[derive(Debug)]
pub enum StoreError {
    /// Filesystem failure while reading or writing store files.
    Io(PathBuf, std::io::Error),
    /// The manifest could not be parsed.
    Manifest(PathBuf, serde_json::Error),
    /// The vector file length disagrees with the manifest.
    SizeMismatch {
        /// Bytes the manifest implies.
        expected: u64,
        /// Bytes actually on disk.
        actual: u64,
    },
    /// A query vector's dimension disagrees with the store.
    DimMismatch {
        /// Store dimension.
        expected: usize,
        /// Query dimension.
        actual: usize,
    },
    /// The manifest declares a zero dimension or row stride.
    EmptyManifest,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, err) => write!(f, "store i/o failure at {}: {}", path.display(), err),
            Self::Manifest(path, err) => {
                write!(f, "invalid store manifest {}: {}", path.display(), err)
            }
            Self::SizeMismatch { expected, actual } => write!(
                f,
                "vector file holds {actual} bytes but the manifest implies {expected}"
            ),
            Self::DimMismatch { expected, actual } => write!(
                f,
                "query vector has {actual} dimensions but the store uses {expected}"
            ),
            Self::EmptyManifest => write!(f, "store manifest declares a zero dimension"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Sidecar manifest describing a vector file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreManifest {
    /// Vector dimension.
    pub dim: usize,
    /// Number of rows in the vector file.
    pub rows: usize,
    /// Identifier of the embedding model that produced the vectors.
    ///
    /// Queries embedded with a different model yield meaningless
    /// similarities, so the matcher checks this against its embedder.
    pub embedding_model: String,
}

/// A corpus row that passed the similarity threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Row index shared with the metadata catalog.
    pub index: usize,
    /// Dot-product similarity against the query vector.
    pub similarity: f32,
}

/// Read-only flat vector store held in memory.
pub struct VectorStore {
    manifest: StoreManifest,
    vecs: Vec<f32>,
}

impl VectorStore {
    /// Loads a store directory, validating the vector file against its manifest.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest_bytes =
            fs::read(&manifest_path).map_err(|e| StoreError::Io(manifest_path.clone(), e))?;
        let manifest: StoreManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| StoreError::Manifest(manifest_path, e))?;
        if manifest.dim == 0 {
            return Err(StoreError::EmptyManifest);
        }

        let vec_path = dir.join(VECTORS_FILE);
        let bytes = fs::read(&vec_path).map_err(|e| StoreError::Io(vec_path, e))?;
        let expected = (manifest.dim * manifest.rows * 4) as u64;
        if bytes.len() as u64 != expected {
            return Err(StoreError::SizeMismatch {
                expected,
                actual: bytes.len() as u64,
            });
        }

        let mut vecs = Vec::with_capacity(manifest.dim * manifest.rows);
        for chunk in bytes.chunks_exact(4) {
            let mut b = [0u8; 4];
            b.copy_from_slice(chunk);
            vecs.push(f32::from_le_bytes(b));
        }
        Ok(Self { manifest, vecs })
    }

    /// Number of rows in the store.
    pub fn len(&self) -> usize {
        self.manifest.rows
    }

    /// True when the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.manifest.rows == 0
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.manifest.dim
    }

    /// Embedding model recorded when the store was built.
    pub fn embedding_model(&self) -> &str {
        &self.manifest.embedding_model
    }

    #[inline]
    fn row(&self, i: usize) -> &[f32] {
        let start = i * self.manifest.dim;
        &self.vecs[start..start + self.manifest.dim]
    }

    /// Similarity of row `i` against a query vector.
    pub fn similarity(&self, i: usize, query: &[f32]) -> f32 {
        dot(self.row(i), query)
    }

    /// Scans every row and returns those with similarity at or above `threshold`.
    ///
    /// Vectors are stored pre-normalized, so the dot product equals cosine
    /// similarity. Candidates come back in ascending row order.
    pub fn candidates_above(
        &self,
        query: &[f32],
        threshold: f32,
    ) -> Result<Vec<Candidate>, StoreError> {
        if query.len() != self.manifest.dim {
            return Err(StoreError::DimMismatch {
                expected: self.manifest.dim,
                actual: query.len(),
            });
        }
        let mut out = Vec::new();
        for i in 0..self.len() {
            let similarity = dot(self.row(i), query);
            if similarity >= threshold {
                out.push(Candidate {
                    index: i,
                    similarity,
                });
            }
        }
        Ok(out)
    }
}

/// Streaming writer used by the corpus ingest binary.
pub struct VectorStoreWriter {
    dir: PathBuf,
    writer: BufWriter<fs::File>,
    dim: usize,
    rows: usize,
    embedding_model: String,
}

impl VectorStoreWriter {
    /// Creates a store directory and opens its vector file for appending.
    pub fn create(dir: &Path, dim: usize, embedding_model: &str) -> Result<Self, StoreError> {
        if dim == 0 {
            return Err(StoreError::EmptyManifest);
        }
        fs::create_dir_all(dir).map_err(|e| StoreError::Io(dir.to_path_buf(), e))?;
        let vec_path = dir.join(VECTORS_FILE);
        let file = fs::File::create(&vec_path).map_err(|e| StoreError::Io(vec_path, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            writer: BufWriter::new(file),
            dim,
            rows: 0,
            embedding_model: embedding_model.to_string(),
        })
    }

    /// Appends one vector as the next row.
    pub fn append(&mut self, vec: &[f32]) -> Result<(), StoreError> {
        if vec.len() != self.dim {
            return Err(StoreError::DimMismatch {
                expected: self.dim,
                actual: vec.len(),
            });
        }
        for &f in vec {
            self.writer
                .write_all(&f.to_le_bytes())
                .map_err(|e| StoreError::Io(self.dir.join(VECTORS_FILE), e))?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flushes the vector file and writes the manifest.
    pub fn finish(mut self) -> Result<StoreManifest, StoreError> {
        self.writer
            .flush()
            .map_err(|e| StoreError::Io(self.dir.join(VECTORS_FILE), e))?;
        let manifest = StoreManifest {
            dim: self.dim,
            rows: self.rows,
            embedding_model: self.embedding_model,
        };
        let manifest_path = self.dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StoreError::Manifest(manifest_path.clone(), e))?;
        fs::write(&manifest_path, bytes).map_err(|e| StoreError::Io(manifest_path, e))?;
        Ok(manifest)
    }
}

/// Dot product of two equal-length vectors.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut s = 0.0f32;
    for i in 0..a.len() {
        s += a[i] * b[i];
    }
    s
}

/// Scales a vector to unit L2 norm in place. Zero vectors are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        for f in v.iter_mut() {
            *f /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn build_store(dir: &Path, rows: &[&[f32]]) -> StoreManifest {
        let mut writer = VectorStoreWriter::create(dir, rows[0].len(), "test-model").unwrap();
        for row in rows {
            writer.append(row).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn roundtrips_rows_through_disk() {
        let dir = tempdir().unwrap();
        build_store(dir.path(), &[&[1.0, 0.0], &[0.0, 1.0], &[0.6, 0.8]]);

        let store = VectorStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.dim(), 2);
        assert_eq!(store.embedding_model(), "test-model");
        assert_eq!(store.similarity(2, &[1.0, 0.0]), 0.6);
    }

    #[test]
    fn threshold_scan_matches_brute_force() {
        let dir = tempdir().unwrap();
        let rows: &[&[f32]] = &[&[1.0, 0.0], &[0.0, 1.0], &[0.6, 0.8]];
        build_store(dir.path(), rows);
        let store = VectorStore::open(dir.path()).unwrap();
        let query = [0.8f32, 0.6];

        for threshold in (0..=10).map(|t| t as f32 / 10.0) {
            let got: Vec<usize> = store
                .candidates_above(&query, threshold)
                .unwrap()
                .iter()
                .map(|c| c.index)
                .collect();
            let want: Vec<usize> = rows
                .iter()
                .enumerate()
                .filter(|(_, row)| dot(row, &query) >= threshold)
                .map(|(i, _)| i)
                .collect();
            assert_eq!(got, want, "threshold {threshold}");
        }
    }

    #[test]
    fn raising_threshold_never_grows_candidates() {
        let dir = tempdir().unwrap();
        build_store(dir.path(), &[&[1.0, 0.0], &[0.0, 1.0], &[0.6, 0.8]]);
        let store = VectorStore::open(dir.path()).unwrap();
        let query = [0.8f32, 0.6];

        let mut last = usize::MAX;
        for threshold in (0..=20).map(|t| t as f32 / 20.0) {
            let count = store.candidates_above(&query, threshold).unwrap().len();
            assert!(count <= last, "candidate set grew at threshold {threshold}");
            last = count;
        }
    }

    #[test]
    fn rejects_truncated_vector_file() {
        let dir = tempdir().unwrap();
        build_store(dir.path(), &[&[1.0, 0.0], &[0.0, 1.0]]);
        let vec_path = dir.path().join(VECTORS_FILE);
        let bytes = fs::read(&vec_path).unwrap();
        fs::write(&vec_path, &bytes[..bytes.len() - 4]).unwrap();

        match VectorStore::open(dir.path()) {
            Err(StoreError::SizeMismatch { expected, actual }) => {
                assert_eq!(expected, 16);
                assert_eq!(actual, 12);
            }
            Err(other) => panic!("expected size mismatch, got {other}"),
            Ok(_) => panic!("expected size mismatch, load succeeded"),
        }
    }

    #[test]
    fn rejects_query_with_wrong_dimension() {
        let dir = tempdir().unwrap();
        build_store(dir.path(), &[&[1.0, 0.0]]);
        let store = VectorStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.candidates_above(&[1.0, 0.0, 0.0], 0.5),
            Err(StoreError::DimMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = [3.0f32, 4.0];
        normalize(&mut v);
        assert!((dot(&v, &v) - 1.0).abs() < 1e-6);

        let mut zero = [0.0f32, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, [0.0, 0.0]);
    }
}
