//! Relational metadata store backed by SQLite.
//!
//! Text fields carry a sibling `*_terms` column holding their tokenized form
//! padded with spaces (`' q3 finance '`), so `text` conditions become
//! `LIKE '% term %'` matches on whole terms. Text fields holding a `lon,lat`
//! point also get `*_lon`/`*_lat` columns, parsed on write with the same
//! [`GeoPoint::parse`] the search index uses.

use super::{MetadataStore, Page, QueryPage};
use crate::models::blob::BlobRecord;
use crate::services::error::{BlobError, BlobResult};
use crate::services::query::{
    Condition, Exact, GeoPoint, Predicate, PredicateSet, METERS_PER_DEGREE, tokenize,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    QueryBuilder, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, sync::Arc};
use tracing::debug;

const COLUMNS: &str = "id, name, description, categories, tags, content_type, size, path, \
                       content_hash, upload_time, author_id, is_public";

#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Connect to a database URL such as `sqlite://./data/meta/blob_store.db`,
    /// creating the file and its parent directory when missing.
    pub async fn connect(url: &str) -> BlobResult<Self> {
        let db_path = url.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
        if !db_path.starts_with(":memory:") {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|err| BlobError::Sqlx(sqlx::Error::Io(err)))?;
                    debug!("Created missing directory {:?}", parent);
                }
            }
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// A private in-memory database. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> BlobResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the embedded migrations in `migrations/`.
    pub async fn migrate(&self) -> BlobResult<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.db)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, id: &str) -> BlobResult<BlobRecord> {
        sqlx::query_as::<_, BlobRecord>(&format!("SELECT {} FROM blobs WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| BlobError::NotFound(id.to_string()))
    }

    async fn put(&self, record: &BlobRecord) -> BlobResult<()> {
        // author_id is never updated; ownership is fixed by the first insert.
        let mut query = sqlx::query(
            r#"
            INSERT INTO blobs (
                id, name, description, categories, tags, content_type, size, path,
                content_hash, upload_time, author_id, is_public,
                name_terms, description_terms, categories_terms, tags_terms,
                name_lon, name_lat, description_lon, description_lat,
                categories_lon, categories_lat, tags_lon, tags_lat
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                categories = excluded.categories,
                tags = excluded.tags,
                content_type = excluded.content_type,
                size = excluded.size,
                path = excluded.path,
                content_hash = excluded.content_hash,
                upload_time = excluded.upload_time,
                is_public = excluded.is_public,
                name_terms = excluded.name_terms,
                description_terms = excluded.description_terms,
                categories_terms = excluded.categories_terms,
                tags_terms = excluded.tags_terms,
                name_lon = excluded.name_lon,
                name_lat = excluded.name_lat,
                description_lon = excluded.description_lon,
                description_lat = excluded.description_lat,
                categories_lon = excluded.categories_lon,
                categories_lat = excluded.categories_lat,
                tags_lon = excluded.tags_lon,
                tags_lat = excluded.tags_lat
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.categories)
        .bind(&record.tags)
        .bind(&record.content_type)
        .bind(record.size)
        .bind(&record.path)
        .bind(&record.content_hash)
        .bind(record.upload_time)
        .bind(&record.author_id)
        .bind(record.is_public)
        .bind(term_list(&record.name))
        .bind(term_list(&record.description))
        .bind(term_list(&record.categories))
        .bind(term_list(&record.tags));
        for text in [&record.name, &record.description, &record.categories, &record.tags] {
            let point = GeoPoint::parse(text);
            query = query.bind(point.map(|p| p.lon)).bind(point.map(|p| p.lat));
        }
        query.execute(&*self.db).await?;

        debug!("stored metadata for {}", record.id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        let result = sqlx::query("DELETE FROM blobs WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BlobError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn query(&self, predicates: &PredicateSet, page: Page) -> BlobResult<QueryPage> {
        // Count and page are read in one transaction so they agree.
        let mut tx = self.db.begin().await?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM blobs");
        push_conditions(&mut count, predicates);
        let total: i64 = count.build_query_scalar().fetch_one(&mut *tx).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM blobs", COLUMNS));
        push_conditions(&mut select, predicates);
        // NULL upload times sort last under DESC in SQLite.
        select.push(" ORDER BY upload_time DESC, id DESC LIMIT ");
        select.push_bind(page.limit as i64);
        select.push(" OFFSET ");
        select.push_bind(page.offset as i64);
        let records: Vec<BlobRecord> = select.build_query_as().fetch_all(&mut *tx).await?;

        tx.commit().await?;
        Ok(QueryPage {
            records,
            total: total.max(0) as u64,
        })
    }

    async fn ping(&self) -> BlobResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(BlobError::Index(format!("unexpected ping result: {}", one)));
        }
        Ok(())
    }
}

/// `' term1 term2 '`
fn term_list(text: &str) -> String {
    format!(" {} ", tokenize(text).join(" "))
}

fn push_conditions(builder: &mut QueryBuilder<'_, Sqlite>, predicates: &PredicateSet) {
    for (i, condition) in predicates.conditions().iter().enumerate() {
        builder.push(if i == 0 { " WHERE " } else { " AND " });
        push_condition(builder, condition);
    }
}

fn push_condition(builder: &mut QueryBuilder<'_, Sqlite>, condition: &Condition) {
    let column = condition.field.column();
    match &condition.predicate {
        Predicate::Exact(Exact::Text(value)) => {
            builder.push(column).push(" = ").push_bind(value.clone());
        }
        Predicate::Exact(Exact::Number(value)) => {
            builder.push(column).push(" = ").push_bind(*value);
        }
        Predicate::Exact(Exact::Flag(value)) => {
            builder.push(column).push(" = ").push_bind(*value);
        }
        Predicate::Text(terms) => {
            let Some(terms_column) = condition.field.terms_column().filter(|_| !terms.is_empty())
            else {
                builder.push("0 = 1");
                return;
            };
            builder.push("(");
            for (i, term) in terms.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder
                    .push(terms_column)
                    .push(" LIKE ")
                    .push_bind(format!("% {} %", term));
            }
            builder.push(")");
        }
        Predicate::Range { min, max } => {
            builder
                .push(column)
                .push(" BETWEEN ")
                .push_bind(*min)
                .push(" AND ")
                .push_bind(*max);
        }
        Predicate::Time { start, end } => {
            builder
                .push(column)
                .push(" BETWEEN ")
                .push_bind::<DateTime<Utc>>(*start)
                .push(" AND ")
                .push_bind::<DateTime<Utc>>(*end);
        }
        Predicate::Geo { center, radius_m } => {
            let Some((lon, lat)) = condition.field.point_columns() else {
                builder.push("0 = 1");
                return;
            };
            // Same equirectangular formula as GeoPoint::distance_m, compared
            // in squared degrees.
            let cos_lat = center.lat.to_radians().cos();
            let radius_deg = radius_m / METERS_PER_DEGREE;
            builder
                .push(format!("({lon} IS NOT NULL AND (({lon} - ", lon = lon))
                .push_bind(center.lon)
                .push(") * ")
                .push_bind(cos_lat)
                .push(format!(") * (({} - ", lon))
                .push_bind(center.lon)
                .push(") * ")
                .push_bind(cos_lat)
                .push(format!(") + ({} - ", lat))
                .push_bind(center.lat)
                .push(format!(") * ({} - ", lat))
                .push_bind(center.lat)
                .push(") <= ")
                .push_bind(radius_deg * radius_deg)
                .push(")");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_lists_are_padded() {
        assert_eq!(term_list("Finance, Q3"), " finance q3 ");
        assert_eq!(term_list(""), "  ");
    }

    #[test]
    fn conditions_are_joined_with_and() {
        let predicates = PredicateSet::decode([
            ("name", "kw", "a.txt"),
            ("size", "range", "1,2"),
            ("tags", "text", "x y"),
        ])
        .unwrap();
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM blobs");
        push_conditions(&mut builder, &predicates);
        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM blobs WHERE name = ? AND size BETWEEN ? AND ? \
             AND (tags_terms LIKE ? OR tags_terms LIKE ?)"
        );
    }

    #[test]
    fn geo_conditions_use_parsed_point_columns() {
        let predicates = PredicateSet::decode([("categories", "geo", "13.4,52.5,5km")]).unwrap();
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM blobs");
        push_conditions(&mut builder, &predicates);
        let sql = builder.sql();
        assert!(
            sql.starts_with("SELECT COUNT(*) FROM blobs WHERE (categories_lon IS NOT NULL AND"),
            "{}",
            sql
        );
        assert!(!sql.contains("CAST"), "{}", sql);
    }

    #[test]
    fn empty_predicates_add_no_where_clause() {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM blobs");
        push_conditions(&mut builder, &PredicateSet::all());
        assert_eq!(builder.sql(), "SELECT COUNT(*) FROM blobs");
    }
}
