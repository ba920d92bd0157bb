//! Inverted-index metadata store.
//!
//! Records are held in memory alongside postings for text terms, whole
//! keyword values, sizes and upload times. Every mutation is appended to a
//! JSON-lines journal and synced before it becomes visible; opening the store
//! replays the journal and rewrites it compacted.

use super::{MetadataStore, Page, QueryPage};
use crate::models::blob::BlobRecord;
use crate::services::error::{BlobError, BlobResult};
use crate::services::query::{Condition, Exact, Field, GeoPoint, Predicate, PredicateSet, tokenize};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::RwLock,
};
use tracing::{debug, error, info, warn};

const JOURNAL_FILE: &str = "journal.jsonl";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum JournalEntry {
    Put { record: BlobRecord },
    Delete { id: String },
}

type Postings = BTreeSet<String>;

#[derive(Default)]
struct Index {
    docs: HashMap<String, BlobRecord>,
    terms: HashMap<(Field, String), Postings>,
    keywords: HashMap<(Field, String), Postings>,
    sizes: BTreeMap<i64, Postings>,
    times: BTreeMap<DateTime<Utc>, Postings>,
}

impl Index {
    fn insert(&mut self, record: BlobRecord) {
        self.remove(&record.id);
        let id = record.id.clone();

        for field in Field::TEXT {
            if let Some(value) = field.string_value(&record) {
                for term in tokenize(value) {
                    self.terms.entry((field, term)).or_default().insert(id.clone());
                }
            }
        }
        for field in Field::KEYWORD {
            if let Some(value) = field.string_value(&record) {
                self.keywords
                    .entry((field, value.to_string()))
                    .or_default()
                    .insert(id.clone());
            }
        }
        if let Some(size) = record.size {
            self.sizes.entry(size).or_default().insert(id.clone());
        }
        if let Some(time) = record.upload_time {
            self.times.entry(time).or_default().insert(id.clone());
        }
        self.docs.insert(id, record);
    }

    fn remove(&mut self, id: &str) -> Option<BlobRecord> {
        let record = self.docs.remove(id)?;

        for field in Field::TEXT {
            if let Some(value) = field.string_value(&record) {
                for term in tokenize(value) {
                    self.terms.unpost((field, term), id);
                }
            }
        }
        for field in Field::KEYWORD {
            if let Some(value) = field.string_value(&record) {
                self.keywords.unpost((field, value.to_string()), id);
            }
        }
        if let Some(size) = record.size {
            self.sizes.unpost(size, id);
        }
        if let Some(time) = record.upload_time {
            self.times.unpost(time, id);
        }
        Some(record)
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Put { record } => self.insert(record),
            JournalEntry::Delete { id } => {
                self.remove(&id);
            }
        }
    }

    /// Ids matched by a condition, from postings where they exist. `None`
    /// means the condition has no postings and must be checked per record.
    fn candidates(&self, condition: &Condition) -> Option<Postings> {
        let field = condition.field;
        match &condition.predicate {
            Predicate::Exact(Exact::Text(value)) => Some(
                self.keywords
                    .get(&(field, value.clone()))
                    .cloned()
                    .unwrap_or_default(),
            ),
            Predicate::Text(terms) => Some(
                terms
                    .iter()
                    .filter_map(|term| self.terms.get(&(field, term.clone())))
                    .flatten()
                    .cloned()
                    .collect(),
            ),
            Predicate::Range { min, max } => {
                let (lo, hi) = (min.ceil(), max.floor());
                if lo > hi || hi < i64::MIN as f64 || lo > i64::MAX as f64 {
                    return Some(Postings::new());
                }
                Some(
                    self.sizes
                        .range(lo as i64..=hi as i64)
                        .flat_map(|(_, ids)| ids.iter().cloned())
                        .collect(),
                )
            }
            Predicate::Time { start, end } if start <= end => Some(
                self.times
                    .range(*start..=*end)
                    .flat_map(|(_, ids)| ids.iter().cloned())
                    .collect(),
            ),
            Predicate::Time { .. } => Some(Postings::new()),
            Predicate::Exact(_) | Predicate::Geo { .. } => None,
        }
    }

    fn search(&self, predicates: &PredicateSet) -> Vec<&BlobRecord> {
        let mut narrowed: Option<Postings> = None;
        let mut unindexed = Vec::new();
        for condition in predicates.conditions() {
            match self.candidates(condition) {
                Some(ids) => {
                    narrowed = Some(match narrowed {
                        Some(acc) => acc.intersection(&ids).cloned().collect(),
                        None => ids,
                    });
                }
                None => unindexed.push(condition),
            }
        }

        let keep = |record: &&BlobRecord| unindexed.iter().all(|c| matches(record, c));
        match narrowed {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.docs.get(id))
                .filter(keep)
                .collect(),
            None => self.docs.values().filter(keep).collect(),
        }
    }
}

/// Remove one id from a posting list, dropping the list when it empties.
trait PostingMap<K> {
    fn unpost(&mut self, key: K, id: &str);
}

impl<K: std::hash::Hash + Eq> PostingMap<K> for HashMap<K, Postings> {
    fn unpost(&mut self, key: K, id: &str) {
        if let Some(ids) = self.get_mut(&key) {
            ids.remove(id);
            if ids.is_empty() {
                self.remove(&key);
            }
        }
    }
}

impl<K: Ord> PostingMap<K> for BTreeMap<K, Postings> {
    fn unpost(&mut self, key: K, id: &str) {
        if let Some(ids) = self.get_mut(&key) {
            ids.remove(id);
            if ids.is_empty() {
                self.remove(&key);
            }
        }
    }
}

/// Evaluate one condition against a record without postings.
fn matches(record: &BlobRecord, condition: &Condition) -> bool {
    let field = condition.field;
    match &condition.predicate {
        Predicate::Exact(Exact::Text(value)) => field.string_value(record) == Some(value.as_str()),
        Predicate::Exact(Exact::Number(value)) => {
            field == Field::Size && record.size.is_some_and(|size| size as f64 == *value)
        }
        Predicate::Exact(Exact::Flag(value)) => field == Field::IsPublic && record.is_public == *value,
        Predicate::Text(terms) => field
            .string_value(record)
            .is_some_and(|text| tokenize(text).iter().any(|t| terms.contains(t))),
        Predicate::Range { min, max } => record
            .size
            .is_some_and(|size| (*min..=*max).contains(&(size as f64))),
        Predicate::Time { start, end } => record
            .upload_time
            .is_some_and(|time| *start <= time && time <= *end),
        Predicate::Geo { center, radius_m } => field
            .string_value(record)
            .and_then(GeoPoint::parse)
            .is_some_and(|point| center.distance_m(&point) <= *radius_m),
    }
}

/// Number of query terms a record matches across its text fields.
fn score(record: &BlobRecord, predicates: &PredicateSet) -> usize {
    let mut by_field: HashMap<Field, Vec<String>> = HashMap::new();
    predicates
        .text_terms()
        .filter(|(field, term)| {
            let tokens = by_field.entry(*field).or_insert_with(|| {
                field.string_value(record).map(tokenize).unwrap_or_default()
            });
            tokens.iter().any(|t| t == term)
        })
        .count()
}

/// Newest upload first, records without content last, then id descending.
fn recency(a: &BlobRecord, b: &BlobRecord) -> Ordering {
    match (a.upload_time, b.upload_time) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| b.id.cmp(&a.id))
}

pub struct IndexMetadataStore {
    journal_path: Option<PathBuf>,
    state: RwLock<State>,
}

struct State {
    index: Index,
    journal: Option<Journal>,
}

/// Append handle on the journal file.
///
/// `len` is the length of the last durable entry boundary. A failed append is
/// truncated back to it; if that fails too the journal is poisoned and every
/// later append fails until the store is reopened.
struct Journal {
    file: File,
    len: u64,
    poisoned: Option<String>,
}

impl Journal {
    async fn open(path: &Path) -> BlobResult<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|err| index_error(path, err))?;
        let len = file
            .metadata()
            .await
            .map_err(|err| index_error(path, err))?
            .len();
        Ok(Self {
            file,
            len,
            poisoned: None,
        })
    }

    async fn append(&mut self, line: &[u8]) -> BlobResult<()> {
        if let Some(cause) = &self.poisoned {
            return Err(BlobError::Index(format!(
                "journal unusable after failed append ({}); reopen the store",
                cause
            )));
        }

        let written = async {
            self.file.write_all(line).await?;
            self.file.flush().await?;
            self.file.sync_data().await
        }
        .await;

        match written {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(err) => {
                warn!("journal append failed, truncating to {} bytes: {}", self.len, err);
                if let Err(rollback) = self.truncate().await {
                    error!("truncating journal failed: {}", rollback);
                    self.poisoned = Some(format!("{}; truncate: {}", err, rollback));
                }
                Err(BlobError::Index(format!("appending to journal: {}", err)))
            }
        }
    }

    async fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.len).await?;
        self.file.sync_data().await
    }
}

impl IndexMetadataStore {
    /// Open or create an index persisted under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> BlobResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .map_err(|err| index_error(dir, err))?;
        let journal_path = dir.join(JOURNAL_FILE);

        let mut index = Index::default();
        let replayed = match fs::read_to_string(&journal_path).await {
            Ok(contents) => replay(&mut index, &contents),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(index_error(&journal_path, err)),
        };

        compact(&journal_path, &index).await?;
        let journal = Journal::open(&journal_path).await?;

        info!(
            "Opened search index at {} ({} records from {} journal entries)",
            dir.display(),
            index.docs.len(),
            replayed
        );
        Ok(Self {
            journal_path: Some(journal_path),
            state: RwLock::new(State {
                index,
                journal: Some(journal),
            }),
        })
    }

    /// A non-persistent index.
    pub fn in_memory() -> Self {
        Self {
            journal_path: None,
            state: RwLock::new(State {
                index: Index::default(),
                journal: None,
            }),
        }
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.index.docs.len()
    }
}

impl State {
    /// Make `entry` durable, then visible.
    async fn commit(&mut self, entry: JournalEntry) -> BlobResult<()> {
        if let Some(journal) = self.journal.as_mut() {
            let mut line = serde_json::to_vec(&entry)
                .map_err(|err| BlobError::Index(format!("encoding journal entry: {}", err)))?;
            line.push(b'\n');
            journal.append(&line).await?;
        }
        self.index.apply(entry);
        Ok(())
    }
}

/// Apply every readable journal entry, returning how many were applied.
///
/// An append torn by a crash or a failed write is dropped. When later entries
/// were appended onto the fragment, the entry after it is still recovered.
fn replay(index: &mut Index, contents: &str) -> usize {
    let mut applied = 0;
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => entry,
            Err(err) => match recover_tail(line) {
                Some(entry) => {
                    warn!("journal line {}: dropped torn prefix ({})", n + 1, err);
                    entry
                }
                None => {
                    warn!("journal line {}: skipping torn entry ({})", n + 1, err);
                    continue;
                }
            },
        };
        index.apply(entry);
        applied += 1;
    }
    applied
}

/// The last complete entry on a line that starts with a torn fragment.
/// Quotes inside JSON strings are escaped, so `{"op":` only ever opens an entry.
fn recover_tail(line: &str) -> Option<JournalEntry> {
    let start = line.rfind("{\"op\":").filter(|&at| at > 0)?;
    serde_json::from_str(&line[start..]).ok()
}

/// Rewrite the journal as one `put` per live record.
async fn compact(journal_path: &Path, index: &Index) -> BlobResult<()> {
    let tmp_path = journal_path.with_extension("jsonl.tmp");
    let mut records: Vec<&BlobRecord> = index.docs.values().collect();
    records.sort_by(|a, b| a.id.cmp(&b.id));

    let mut buf = Vec::new();
    for record in records {
        let entry = JournalEntry::Put {
            record: record.clone(),
        };
        serde_json::to_writer(&mut buf, &entry)
            .map_err(|err| BlobError::Index(format!("encoding journal entry: {}", err)))?;
        buf.push(b'\n');
    }

    let mut file = File::create(&tmp_path)
        .await
        .map_err(|err| index_error(&tmp_path, err))?;
    file.write_all(&buf)
        .await
        .map_err(|err| index_error(&tmp_path, err))?;
    file.sync_all()
        .await
        .map_err(|err| index_error(&tmp_path, err))?;
    fs::rename(&tmp_path, journal_path)
        .await
        .map_err(|err| index_error(journal_path, err))?;
    debug!("compacted journal {}", journal_path.display());
    Ok(())
}

fn index_error(path: &Path, err: std::io::Error) -> BlobError {
    BlobError::Index(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl MetadataStore for IndexMetadataStore {
    fn kind(&self) -> &'static str {
        "index"
    }

    async fn get(&self, id: &str) -> BlobResult<BlobRecord> {
        self.state
            .read()
            .await
            .index
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(id.to_string()))
    }

    async fn put(&self, record: &BlobRecord) -> BlobResult<()> {
        let mut state = self.state.write().await;
        let mut record = record.clone();
        if let Some(existing) = state.index.docs.get(&record.id) {
            record.author_id = existing.author_id.clone();
        }
        let id = record.id.clone();
        state.commit(JournalEntry::Put { record }).await?;
        debug!("indexed {}", id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        let mut state = self.state.write().await;
        if !state.index.docs.contains_key(id) {
            return Err(BlobError::NotFound(id.to_string()));
        }
        state
            .commit(JournalEntry::Delete { id: id.to_string() })
            .await
    }

    async fn query(&self, predicates: &PredicateSet, page: Page) -> BlobResult<QueryPage> {
        let state = self.state.read().await;
        let mut hits: Vec<(usize, &BlobRecord)> = state
            .index
            .search(predicates)
            .into_iter()
            .map(|record| (score(record, predicates), record))
            .collect();
        hits.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| recency(a, b)));

        let total = hits.len() as u64;
        let records = hits
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .map(|(_, record)| record.clone())
            .collect();
        Ok(QueryPage { records, total })
    }

    async fn ping(&self) -> BlobResult<()> {
        let _state = self.state.read().await;
        if let Some(path) = &self.journal_path {
            fs::metadata(path)
                .await
                .map_err(|err| index_error(path, err))?;
        }
        Ok(())
    }
}
