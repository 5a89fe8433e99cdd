//! Reference metadata catalog stored in SQLite.
//!
//! Rows are keyed by the same integer index as the vector store. The catalog
//! is read-only at query time; concurrent workers must each open their own
//! connection rather than share a cursor across threads.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

/// Maximum number of indexes bound into a single `IN (...)` query.
const IN_CHUNK: usize = 512;

/// One reference corpus row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrandedFood {
    /// Row index shared with the vector store.
    pub index: usize,
    /// GTIN or UPC product code.
    pub gtin_upc: String,
    /// Vendor name.
    pub vendor: String,
    /// Brand name.
    pub brand: String,
    /// Product name.
    pub product: String,
    /// Ingredient list text.
    pub ingredients: String,
}

impl BrandedFood {
    /// Text rendering used for embedding and for choice deduplication.
    pub fn rendered_text(&self) -> String {
        format!("{} {} {}", self.vendor, self.brand, self.product)
            .trim()
            .to_string()
    }

    /// Content identity ignoring the row index.
    ///
    /// Distinct indexes can carry identical content; emission dedupes on
    /// this key rather than on the index alone.
    pub fn content_key(&self) -> (String, String, String, String, String) {
        (
            self.gtin_upc.clone(),
            self.vendor.clone(),
            self.brand.clone(),
            self.product.clone(),
            self.ingredients.clone(),
        )
    }
}

/// Connection to the branded-food catalog.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens the catalog file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open catalog {}", path.display()))?;
        Ok(Self { conn })
    }

    /// Opens an in-memory catalog, used by tests and as an ingest scratch target.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory catalog")?;
        Ok(Self { conn })
    }

    /// Creates the branded-food table, dropping any prior contents.
    pub fn create_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "DROP TABLE IF EXISTS branded_food;
                 CREATE TABLE branded_food (
                     row_index   INTEGER PRIMARY KEY,
                     gtin_upc    TEXT NOT NULL,
                     vendor      TEXT NOT NULL,
                     brand       TEXT NOT NULL,
                     product     TEXT NOT NULL,
                     ingredients TEXT NOT NULL
                 );",
            )
            .context("failed to create branded_food schema")
    }

    /// Inserts a batch of rows inside one transaction.
    pub fn insert_rows(&mut self, rows: &[BrandedFood]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to begin insert transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO branded_food
                     (row_index, gtin_upc, vendor, brand, product, ingredients)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .context("failed to prepare insert")?;
            for row in rows {
                stmt.execute(params![
                    row.index as i64,
                    row.gtin_upc,
                    row.vendor,
                    row.brand,
                    row.product,
                    row.ingredients,
                ])
                .with_context(|| format!("failed to insert catalog row {}", row.index))?;
            }
        }
        tx.commit().context("failed to commit insert transaction")
    }

    /// Fetches rows for the given indexes, preserving the request order.
    ///
    /// Indexes missing from the catalog are skipped rather than erroring;
    /// the vector store and catalog are built together, so a gap indicates
    /// a stale store pairing and surfaces downstream as a shorter result.
    pub fn fetch_by_indexes(&self, indexes: &[usize]) -> Result<Vec<BrandedFood>> {
        let mut by_index = std::collections::HashMap::with_capacity(indexes.len());
        for chunk in indexes.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT row_index, gtin_upc, vendor, brand, product, ingredients
                 FROM branded_food WHERE row_index IN ({placeholders})"
            );
            let mut stmt = self
                .conn
                .prepare(&sql)
                .context("failed to prepare catalog lookup")?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(chunk.iter().map(|&i| i as i64)),
                    |row| {
                        Ok(BrandedFood {
                            index: row.get::<_, i64>(0)? as usize,
                            gtin_upc: row.get(1)?,
                            vendor: row.get(2)?,
                            brand: row.get(3)?,
                            product: row.get(4)?,
                            ingredients: row.get(5)?,
                        })
                    },
                )
                .context("failed to query catalog rows")?;
            for row in rows {
                let row = row.context("failed to read catalog row")?;
                by_index.insert(row.index, row);
            }
        }

        Ok(indexes
            .iter()
            .filter_map(|i| by_index.remove(i))
            .collect())
    }

    /// Number of rows in the catalog.
    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM branded_food", [], |row| row.get(0))
            .context("failed to count catalog rows")?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_row(index: usize, vendor: &str, brand: &str, product: &str) -> BrandedFood {
        BrandedFood {
            index,
            gtin_upc: format!("0000{index}"),
            vendor: vendor.to_string(),
            brand: brand.to_string(),
            product: product.to_string(),
            ingredients: "WATER, SALT".to_string(),
        }
    }

    fn seeded_catalog() -> Catalog {
        let mut catalog = Catalog::open_in_memory().unwrap();
        catalog.create_schema().unwrap();
        catalog
            .insert_rows(&[
                sample_row(0, "A Co", "Widget", "Foo"),
                sample_row(1, "A Co", "Widget", "Foo"),
                sample_row(2, "B Co", "Gadget", "Bar"),
            ])
            .unwrap();
        catalog
    }

    #[test]
    fn fetch_preserves_request_order() {
        let catalog = seeded_catalog();
        let rows = catalog.fetch_by_indexes(&[2, 0]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].index, 2);
        assert_eq!(rows[1].index, 0);
    }

    #[test]
    fn fetch_skips_unknown_indexes() {
        let catalog = seeded_catalog();
        let rows = catalog.fetch_by_indexes(&[1, 99]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].index, 1);
    }

    #[test]
    fn rendered_text_trims_blank_fields() {
        let row = BrandedFood {
            index: 0,
            gtin_upc: String::new(),
            vendor: String::new(),
            brand: "Widget".to_string(),
            product: "Foo".to_string(),
            ingredients: String::new(),
        };
        assert_eq!(row.rendered_text(), "Widget Foo");
    }

    #[test]
    fn content_key_ignores_index() {
        let a = sample_row(0, "A Co", "Widget", "Foo");
        let mut b = sample_row(1, "A Co", "Widget", "Foo");
        b.gtin_upc = a.gtin_upc.clone();
        assert_eq!(a.content_key(), b.content_key());
    }
}
