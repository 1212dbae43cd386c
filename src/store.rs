//! Durable per-workspace store for entities, packs, embeddings, evidence
//!
//! One SQLite database per workspace under `.repofacts/store.db`, with the
//! lease file sitting next to it. Mutating sessions go through
//! `Store::initialize`, which takes the lease before any readiness check;
//! readers use `Store::open_read_only` and never touch the lease.
//!
//! Path rule: any absolute path provably inside the currently open
//! workspace root is rewritten workspace-relative at write time; absolute
//! paths outside that root are preserved verbatim.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info};

use crate::error::{RepoFactsError, Result};
use crate::lock::{acquire_workspace_lock, AcquireOptions, WorkspaceLock};
use crate::paths;
use crate::schema::{
    CodeSnippet, ContextPack, EmbeddingRecord, EntityType, EvidenceEntry, FunctionRecord,
    ModuleRecord, WorkspaceMetadata, SCHEMA_VERSION,
};

/// Options for opening a mutating session
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub acquire: AcquireOptions,
}

/// Query options for similarity search
#[derive(Debug, Clone)]
pub struct SimilarityQuery {
    pub model_id: String,
    pub limit: usize,
    pub min_similarity: f32,
    /// Restrict to these entity kinds; None = all
    pub entity_types: Option<Vec<EntityType>>,
    /// Structural filter: only entities whose path falls under this
    /// workspace-relative prefix. Applied before top-K selection.
    pub path_prefix: Option<String>,
}

impl SimilarityQuery {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            limit: 10,
            min_similarity: 0.0,
            entity_types: None,
            path_prefix: None,
        }
    }
}

/// One similarity search result
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityHit {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub similarity: f32,
}

/// Query options for context-pack retrieval
#[derive(Debug, Clone, Default)]
pub struct ContextPackQuery {
    pub target_id: Option<String>,
    pub pack_type: Option<String>,
    /// Exact membership test against stored (relative) related_files
    pub related_file: Option<String>,
    /// Prefix match against stored (relative) related_files
    pub related_file_prefix: Option<String>,
}

/// Open handle to a workspace store
pub struct Store {
    conn: Connection,
    workspace: PathBuf,
    lock: Option<WorkspaceLock>,
    read_only: bool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("workspace", &self.workspace)
            .field("read_only", &self.read_only)
            .field("holds_lease", &self.lock.is_some())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open a mutating session.
    ///
    /// Acquires the workspace lease before any readiness check; a live
    /// competing owner yields `storage_locked` carrying the owner's pid
    /// and start time. Then runs migrations and, if the recorded workspace
    /// root differs from `workspace`, performs the portability rebind
    /// once, transactionally.
    pub fn initialize(workspace: &Path, options: &StoreOptions) -> Result<Self> {
        let workspace = paths::canonicalize_path(workspace);

        let lock = match acquire_workspace_lock(&workspace, &options.acquire) {
            Ok(lock) => lock,
            Err(RepoFactsError::LeaseConflict {
                owner_pid,
                owner_started_at,
                ..
            }) => {
                return Err(RepoFactsError::StorageLocked {
                    owner_pid,
                    owner_started_at,
                })
            }
            Err(err) => return Err(err),
        };

        let conn = Connection::open(paths::store_db_path(&workspace))?;
        let mut store = Self {
            conn,
            workspace,
            lock: Some(lock),
            read_only: false,
        };
        store.migrate()?;
        store.sync_workspace_root()?;
        Ok(store)
    }

    /// Open a read-only session. Never touches the lease, so readers can
    /// proceed while another process holds it. No cross-call point-in-time
    /// consistency is guaranteed within the session.
    pub fn open_read_only(workspace: &Path) -> Result<Self> {
        let workspace = paths::canonicalize_path(workspace);
        let db_path = paths::store_db_path(&workspace);
        if !db_path.exists() {
            return Err(RepoFactsError::FileNotFound {
                path: db_path.display().to_string(),
            });
        }
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            workspace,
            lock: None,
            read_only: true,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Release the lease early (otherwise released on drop)
    pub fn close(mut self) -> Result<()> {
        if let Some(mut lock) = self.lock.take() {
            lock.release()?;
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(RepoFactsError::Workspace {
                message: "mutating call on a read-only session".to_string(),
            });
        }
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS functions (
                file_path TEXT NOT NULL,
                name TEXT NOT NULL,
                signature TEXT NOT NULL DEFAULT '',
                purpose TEXT NOT NULL DEFAULT '',
                start_line INTEGER NOT NULL DEFAULT 0,
                end_line INTEGER NOT NULL DEFAULT 0,
                confidence REAL NOT NULL DEFAULT 0,
                is_pure INTEGER NOT NULL DEFAULT 0,
                has_side_effects INTEGER NOT NULL DEFAULT 0,
                modifies_params INTEGER NOT NULL DEFAULT 0,
                throws INTEGER NOT NULL DEFAULT 0,
                return_depends_on_inputs INTEGER NOT NULL DEFAULT 0,
                access_count INTEGER NOT NULL DEFAULT 0,
                outcome_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (file_path, name)
            );

            CREATE TABLE IF NOT EXISTS modules (
                file_path TEXT PRIMARY KEY,
                language TEXT NOT NULL,
                exports TEXT NOT NULL DEFAULT '[]',
                dependencies TEXT NOT NULL DEFAULT '[]',
                partially_indexed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS context_packs (
                target_id TEXT NOT NULL,
                pack_type TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                key_facts TEXT NOT NULL DEFAULT '[]',
                code_snippets TEXT NOT NULL DEFAULT '[]',
                related_files TEXT NOT NULL DEFAULT '[]',
                invalidation_triggers TEXT NOT NULL DEFAULT '[]',
                schema_version TEXT NOT NULL DEFAULT '',
                content_hash TEXT NOT NULL DEFAULT '',
                access_count INTEGER NOT NULL DEFAULT 0,
                workspace_root TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (target_id, pack_type)
            );

            CREATE TABLE IF NOT EXISTS embeddings (
                entity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                model_id TEXT NOT NULL,
                dims INTEGER NOT NULL,
                vector BLOB NOT NULL,
                PRIMARY KEY (entity_id, model_id)
            );

            CREATE TABLE IF NOT EXISTS evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                claim TEXT NOT NULL DEFAULT '',
                confidence TEXT NOT NULL DEFAULT '',
                file_path TEXT NOT NULL,
                line INTEGER NOT NULL DEFAULT 0,
                end_line INTEGER NOT NULL DEFAULT 0,
                snippet TEXT NOT NULL DEFAULT '',
                content_hash TEXT NOT NULL DEFAULT '',
                stale INTEGER NOT NULL DEFAULT 0,
                verified_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_evidence_entity
                ON evidence(entity_id, entity_type);
            "#,
        )?;
        Ok(())
    }

    /// Compare the recorded workspace root with the one being opened now;
    /// on mismatch, rebind every stored reference in one transaction.
    fn sync_workspace_root(&mut self) -> Result<()> {
        let current = self.workspace.to_string_lossy().to_string();
        let recorded: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'workspace'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match recorded {
            None => {
                self.conn.execute(
                    "INSERT OR REPLACE INTO metadata (key, value) VALUES ('workspace', ?1)",
                    params![current],
                )?;
                self.conn.execute(
                    "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION],
                )?;
                Ok(())
            }
            Some(recorded) if recorded == current => Ok(()),
            Some(recorded) => self.rebind_workspace(&recorded, &current),
        }
    }

    /// Rewrite stored old-root absolute references to relative and update
    /// the recorded root. Runs once, at open time, transactionally.
    fn rebind_workspace(&mut self, old_root: &str, new_root: &str) -> Result<()> {
        info!(old_root, new_root, "rebinding relocated store");
        let old = PathBuf::from(old_root);

        let tx = self.conn.transaction()?;

        rebind_column(&tx, "functions", "file_path", &old)?;
        rebind_column(&tx, "modules", "file_path", &old)?;
        rebind_column(&tx, "evidence", "file_path", &old)?;
        rebind_column(&tx, "evidence", "entity_id", &old)?;
        rebind_column(&tx, "embeddings", "entity_id", &old)?;
        rebind_column(&tx, "context_packs", "target_id", &old)?;

        // Packs also carry path lists and a workspace_root field in their
        // persisted form; rewrite those as JSON.
        {
            let mut select = tx.prepare(
                "SELECT target_id, pack_type, key_facts, code_snippets, related_files,
                        invalidation_triggers
                 FROM context_packs",
            )?;
            let rows: Vec<(String, String, String, String, String, String)> = select
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .collect::<std::result::Result<_, _>>()?;
            drop(select);

            for (target_id, pack_type, _key_facts, snippets, related, triggers) in rows {
                let snippets: Vec<CodeSnippet> = serde_json::from_str(&snippets)?;
                let related: Vec<String> = serde_json::from_str(&related)?;
                let triggers: Vec<String> = serde_json::from_str(&triggers)?;

                let snippets: Vec<CodeSnippet> = snippets
                    .into_iter()
                    .map(|mut s| {
                        s.file_path = paths::to_workspace_relative(&s.file_path, &old);
                        s
                    })
                    .collect();
                let related: Vec<String> = related
                    .iter()
                    .map(|p| paths::to_workspace_relative(p, &old))
                    .collect();
                let triggers: Vec<String> = triggers
                    .iter()
                    .map(|p| paths::to_workspace_relative(p, &old))
                    .collect();

                tx.execute(
                    "UPDATE context_packs
                     SET code_snippets = ?1, related_files = ?2,
                         invalidation_triggers = ?3, workspace_root = ?4
                     WHERE target_id = ?5 AND pack_type = ?6",
                    params![
                        serde_json::to_string(&snippets)?,
                        serde_json::to_string(&related)?,
                        serde_json::to_string(&triggers)?,
                        new_root,
                        target_id,
                        pack_type
                    ],
                )?;
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('workspace', ?1)",
            params![new_root],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn metadata(&self) -> Result<WorkspaceMetadata> {
        let workspace: String = self.conn.query_row(
            "SELECT value FROM metadata WHERE key = 'workspace'",
            [],
            |row| row.get(0),
        )?;
        let schema_version: String = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap_or_else(|_| SCHEMA_VERSION.to_string());
        Ok(WorkspaceMetadata {
            workspace,
            schema_version,
        })
    }

    fn relative(&self, path: &str) -> String {
        paths::to_workspace_relative(path, &self.workspace)
    }

    // ------------------------------------------------------------------
    // Functions and modules
    // ------------------------------------------------------------------

    /// Idempotent full replace keyed by (file_path, name); a single
    /// statement, so the record is never partially visible.
    pub fn upsert_function(&mut self, record: &FunctionRecord) -> Result<()> {
        self.ensure_writable()?;
        let file_path = self.relative(&record.file_path);
        self.conn.execute(
            "INSERT OR REPLACE INTO functions
             (file_path, name, signature, purpose, start_line, end_line, confidence,
              is_pure, has_side_effects, modifies_params, throws, return_depends_on_inputs,
              access_count, outcome_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                file_path,
                record.name,
                record.signature,
                record.purpose,
                record.start_line,
                record.end_line,
                record.confidence,
                record.flags.is_pure,
                record.flags.has_side_effects,
                record.flags.modifies_params,
                record.flags.throws,
                record.flags.return_depends_on_inputs,
                record.access_count,
                record.outcome_count,
            ],
        )?;
        Ok(())
    }

    pub fn get_function(&self, file_path: &str, name: &str) -> Result<Option<FunctionRecord>> {
        let file_path = self.relative(file_path);
        let mut stmt = self.conn.prepare(
            "SELECT file_path, name, signature, purpose, start_line, end_line, confidence,
                    is_pure, has_side_effects, modifies_params, throws,
                    return_depends_on_inputs, access_count, outcome_count
             FROM functions WHERE file_path = ?1 AND name = ?2",
        )?;
        let mut rows = stmt.query_map(params![file_path, name], function_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn upsert_module(&mut self, record: &ModuleRecord) -> Result<()> {
        self.ensure_writable()?;
        let file_path = self.relative(&record.file_path);
        self.conn.execute(
            "INSERT OR REPLACE INTO modules
             (file_path, language, exports, dependencies, partially_indexed)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file_path,
                record.language,
                serde_json::to_string(&record.exports)?,
                serde_json::to_string(&record.dependencies)?,
                record.partially_indexed,
            ],
        )?;
        Ok(())
    }

    pub fn get_module(&self, file_path: &str) -> Result<Option<ModuleRecord>> {
        let file_path = self.relative(file_path);
        let mut stmt = self.conn.prepare(
            "SELECT file_path, language, exports, dependencies, partially_indexed
             FROM modules WHERE file_path = ?1",
        )?;
        let mut rows = stmt.query_map(params![file_path], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;
        match rows.next() {
            Some(row) => {
                let (file_path, language, exports, dependencies, partially_indexed) = row?;
                Ok(Some(ModuleRecord {
                    file_path,
                    language,
                    exports: serde_json::from_str(&exports)?,
                    dependencies: serde_json::from_str(&dependencies)?,
                    partially_indexed,
                }))
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Embeddings and similarity search
    // ------------------------------------------------------------------

    /// Full replace of one entity's vector under one model. The caller
    /// must pass unit-normalized vectors; the store never renormalizes.
    pub fn set_embedding(
        &mut self,
        entity_id: &str,
        vector: &[f32],
        model_id: &str,
        entity_type: EntityType,
    ) -> Result<()> {
        self.ensure_writable()?;

        // Fixed dimension per model: reject mismatches against whatever
        // the model already stored
        let existing: Option<usize> = self
            .conn
            .query_row(
                "SELECT dims FROM embeddings WHERE model_id = ?1 LIMIT 1",
                params![model_id],
                |row| row.get::<_, i64>(0).map(|d| d as usize),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if let Some(dims) = existing {
            if dims != vector.len() {
                return Err(RepoFactsError::DimensionMismatch {
                    expected: dims,
                    got: vector.len(),
                });
            }
        }

        let entity_id = self.relative_entity_id(entity_id);
        self.conn.execute(
            "INSERT OR REPLACE INTO embeddings (entity_id, entity_type, model_id, dims, vector)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entity_id,
                entity_type.as_str(),
                model_id,
                vector.len() as i64,
                encode_vector(vector),
            ],
        )?;
        Ok(())
    }

    pub fn get_embedding(&self, entity_id: &str, model_id: &str) -> Result<Option<EmbeddingRecord>> {
        let entity_id = self.relative_entity_id(entity_id);
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, entity_type, model_id, vector
             FROM embeddings WHERE entity_id = ?1 AND model_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![entity_id, model_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;
        match rows.next() {
            Some(row) => {
                let (entity_id, entity_type, model_id, blob) = row?;
                Ok(Some(EmbeddingRecord {
                    entity_id,
                    entity_type: EntityType::parse(&entity_type).unwrap_or(EntityType::Function),
                    model_id,
                    vector: decode_vector(&blob),
                }))
            }
            None => Ok(None),
        }
    }

    /// Rank stored embeddings by cosine similarity (dot product on
    /// normalized vectors), ties broken by entity_id ascending.
    ///
    /// Structural filters (entity_types, path_prefix) are applied before
    /// top-K selection: a filtered-out entity can never crowd out a
    /// filter-matching one, however popular it is globally.
    pub fn find_similar_by_embedding(
        &self,
        query: &[f32],
        options: &SimilarityQuery,
    ) -> Result<Vec<SimilarityHit>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, entity_type, dims, vector
             FROM embeddings WHERE model_id = ?1",
        )?;
        let rows: Vec<(String, String, i64, Vec<u8>)> = stmt
            .query_map(params![options.model_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut hits: Vec<SimilarityHit> = Vec::new();
        for (entity_id, entity_type, dims, blob) in rows {
            if dims as usize != query.len() {
                return Err(RepoFactsError::DimensionMismatch {
                    expected: dims as usize,
                    got: query.len(),
                });
            }
            let Some(entity_type) = EntityType::parse(&entity_type) else {
                continue;
            };

            // Filters first, similarity second: pushdown, not post-filter
            if let Some(ref types) = options.entity_types {
                if !types.contains(&entity_type) {
                    continue;
                }
            }
            if let Some(ref prefix) = options.path_prefix {
                let prefix = self.relative(prefix);
                if !paths::path_has_prefix(entity_path(&entity_id), &prefix) {
                    continue;
                }
            }

            let vector = decode_vector(&blob);
            let similarity = dot(query, &vector);
            if similarity >= options.min_similarity {
                hits.push(SimilarityHit {
                    entity_id,
                    entity_type,
                    similarity,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        hits.truncate(options.limit);
        Ok(hits)
    }

    // ------------------------------------------------------------------
    // Context packs
    // ------------------------------------------------------------------

    /// Normalize paths, then compute schema_version/content_hash over the
    /// semantic fields, then persist. Returns the stored form.
    pub fn upsert_context_pack(&mut self, pack: &ContextPack) -> Result<ContextPack> {
        self.ensure_writable()?;

        let mut stored = pack.clone();
        stored.target_id = self.relative_entity_id(&stored.target_id);
        for snippet in &mut stored.code_snippets {
            snippet.file_path = self.relative(&snippet.file_path);
        }
        stored.related_files = stored.related_files.iter().map(|p| self.relative(p)).collect();
        stored.invalidation_triggers = stored
            .invalidation_triggers
            .iter()
            .map(|p| self.relative(p))
            .collect();

        // Hash after normalization: absolute and relative spellings of
        // the same pack converge on the same content hash
        stored.schema_version = SCHEMA_VERSION.to_string();
        stored.content_hash = stored.compute_content_hash();

        self.conn.execute(
            "INSERT OR REPLACE INTO context_packs
             (target_id, pack_type, summary, key_facts, code_snippets, related_files,
              invalidation_triggers, schema_version, content_hash, access_count, workspace_root)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                stored.target_id,
                stored.pack_type,
                stored.summary,
                serde_json::to_string(&stored.key_facts)?,
                serde_json::to_string(&stored.code_snippets)?,
                serde_json::to_string(&stored.related_files)?,
                serde_json::to_string(&stored.invalidation_triggers)?,
                stored.schema_version,
                stored.content_hash,
                stored.access_count,
                self.workspace.to_string_lossy().to_string(),
            ],
        )?;
        debug!(target = %stored.target_id, pack_type = %stored.pack_type, "context pack upserted");
        Ok(stored)
    }

    pub fn get_context_packs(&self, query: &ContextPackQuery) -> Result<Vec<ContextPack>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_id, pack_type, summary, key_facts, code_snippets, related_files,
                    invalidation_triggers, schema_version, content_hash, access_count
             FROM context_packs ORDER BY target_id, pack_type",
        )?;
        let rows: Vec<ContextPack> = stmt
            .query_map([], pack_from_row)?
            .collect::<std::result::Result<_, _>>()?;

        let related_file = query.related_file.as_ref().map(|p| self.relative(p));
        let related_prefix = query.related_file_prefix.as_ref().map(|p| self.relative(p));

        Ok(rows
            .into_iter()
            .filter(|pack| {
                if let Some(ref target) = query.target_id {
                    if &pack.target_id != target {
                        return false;
                    }
                }
                if let Some(ref pack_type) = query.pack_type {
                    if &pack.pack_type != pack_type {
                        return false;
                    }
                }
                if let Some(ref file) = related_file {
                    if !pack.related_files.iter().any(|f| f == file) {
                        return false;
                    }
                }
                if let Some(ref prefix) = related_prefix {
                    if !pack
                        .related_files
                        .iter()
                        .any(|f| paths::path_has_prefix(f, prefix))
                    {
                        return false;
                    }
                }
                true
            })
            .collect())
    }

    /// Lookup one pack by key, bumping its access counter (skipped on
    /// read-only sessions).
    pub fn get_context_pack_for_target(
        &mut self,
        target_id: &str,
        pack_type: &str,
    ) -> Result<Option<ContextPack>> {
        let target_id = self.relative_entity_id(target_id);
        let mut stmt = self.conn.prepare(
            "SELECT target_id, pack_type, summary, key_facts, code_snippets, related_files,
                    invalidation_triggers, schema_version, content_hash, access_count
             FROM context_packs WHERE target_id = ?1 AND pack_type = ?2",
        )?;
        let mut rows = stmt.query_map(params![target_id, pack_type], pack_from_row)?;
        let pack = match rows.next() {
            Some(row) => row?,
            None => return Ok(None),
        };
        drop(rows);
        drop(stmt);

        if !self.read_only {
            self.conn.execute(
                "UPDATE context_packs SET access_count = access_count + 1
                 WHERE target_id = ?1 AND pack_type = ?2",
                params![target_id, pack_type],
            )?;
        }
        Ok(Some(pack))
    }

    // ------------------------------------------------------------------
    // Evidence rows (verification logic lives in `evidence`)
    // ------------------------------------------------------------------

    pub fn record_evidence(&mut self, entry: &EvidenceEntry) -> Result<i64> {
        self.ensure_writable()?;
        let file_path = self.relative(&entry.file_path);
        let entity_id = self.relative_entity_id(&entry.entity_id);
        self.conn.execute(
            "INSERT INTO evidence
             (entity_id, entity_type, claim, confidence, file_path, line, end_line,
              snippet, content_hash, stale, verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entity_id,
                entry.entity_type,
                entry.claim,
                entry.confidence,
                file_path,
                entry.line,
                entry.end_line,
                entry.snippet,
                entry.content_hash,
                entry.stale,
                entry.verified_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub(crate) fn evidence_for_entity(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Vec<EvidenceEntry>> {
        let entity_id = self.relative_entity_id(entity_id);
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_id, entity_type, claim, confidence, file_path, line,
                    end_line, snippet, content_hash, stale, verified_at
             FROM evidence WHERE entity_id = ?1 AND entity_type = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![entity_id, entity_type], evidence_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    pub(crate) fn all_evidence(&self) -> Result<Vec<EvidenceEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_id, entity_type, claim, confidence, file_path, line,
                    end_line, snippet, content_hash, stale, verified_at
             FROM evidence ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], evidence_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    /// Verification updates anchoring fields only; the claim and its
    /// confidence label pass through untouched. Entries are never deleted.
    ///
    /// On a read-only session the re-anchor is computed in memory and not
    /// persisted; the next writable session's read settles it.
    pub(crate) fn update_evidence_anchor(&self, entry: &EvidenceEntry) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.conn.execute(
            "UPDATE evidence
             SET line = ?1, end_line = ?2, content_hash = ?3, stale = ?4, verified_at = ?5
             WHERE id = ?6",
            params![
                entry.line,
                entry.end_line,
                entry.content_hash,
                entry.stale,
                entry.verified_at,
                entry.id,
            ],
        )?;
        Ok(())
    }

    /// Entity ids embed paths (`src/lib.rs::name`); normalize the path part
    fn relative_entity_id(&self, entity_id: &str) -> String {
        match entity_id.split_once("::") {
            Some((path, name)) => format!("{}::{}", self.relative(path), name),
            None => self.relative(entity_id),
        }
    }
}

/// Path component of an entity id (`src/lib.rs::name` → `src/lib.rs`)
fn entity_path(entity_id: &str) -> &str {
    entity_id
        .split_once("::")
        .map(|(path, _)| path)
        .unwrap_or(entity_id)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Vectors persist as little-endian f32 BLOBs
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn rebind_column(tx: &rusqlite::Transaction, table: &str, column: &str, old_root: &Path) -> Result<()> {
    let sql = format!("SELECT DISTINCT {column} FROM {table}");
    let mut stmt = tx.prepare(&sql)?;
    let values: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    for value in values {
        let rewritten = match value.split_once("::") {
            Some((path, name)) => {
                format!("{}::{}", paths::to_workspace_relative(path, old_root), name)
            }
            None => paths::to_workspace_relative(&value, old_root),
        };
        if rewritten != value {
            let sql = format!("UPDATE {table} SET {column} = ?1 WHERE {column} = ?2");
            tx.execute(&sql, params![rewritten, value])?;
        }
    }
    Ok(())
}

fn function_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FunctionRecord> {
    Ok(FunctionRecord {
        file_path: row.get(0)?,
        name: row.get(1)?,
        signature: row.get(2)?,
        purpose: row.get(3)?,
        start_line: row.get::<_, i64>(4)? as usize,
        end_line: row.get::<_, i64>(5)? as usize,
        confidence: row.get(6)?,
        flags: crate::schema::BehaviorFlags {
            is_pure: row.get(7)?,
            has_side_effects: row.get(8)?,
            modifies_params: row.get(9)?,
            throws: row.get(10)?,
            return_depends_on_inputs: row.get(11)?,
        },
        access_count: row.get::<_, i64>(12)? as u64,
        outcome_count: row.get::<_, i64>(13)? as u64,
    })
}

fn pack_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextPack> {
    let key_facts: String = row.get(3)?;
    let code_snippets: String = row.get(4)?;
    let related_files: String = row.get(5)?;
    let invalidation_triggers: String = row.get(6)?;
    Ok(ContextPack {
        target_id: row.get(0)?,
        pack_type: row.get(1)?,
        summary: row.get(2)?,
        key_facts: serde_json::from_str(&key_facts).unwrap_or_default(),
        code_snippets: serde_json::from_str(&code_snippets).unwrap_or_default(),
        related_files: serde_json::from_str(&related_files).unwrap_or_default(),
        invalidation_triggers: serde_json::from_str(&invalidation_triggers).unwrap_or_default(),
        schema_version: row.get(7)?,
        content_hash: row.get(8)?,
        access_count: row.get::<_, i64>(9)? as u64,
    })
}

fn evidence_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvidenceEntry> {
    Ok(EvidenceEntry {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        entity_type: row.get(2)?,
        claim: row.get(3)?,
        confidence: row.get(4)?,
        file_path: row.get(5)?,
        line: row.get::<_, i64>(6)? as usize,
        end_line: row.get::<_, i64>(7)? as usize,
        snippet: row.get(8)?,
        content_hash: row.get(9)?,
        stale: row.get(10)?,
        verified_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Store {
        Store::initialize(dir.path(), &StoreOptions::default()).unwrap()
    }

    fn unit(v: &[f32]) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    #[test]
    fn test_function_upsert_is_full_replace() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        let mut record = FunctionRecord {
            file_path: "src/lib.rs".to_string(),
            name: "parse".to_string(),
            signature: "fn parse(input: &str)".to_string(),
            purpose: "first version".to_string(),
            start_line: 1,
            end_line: 5,
            confidence: 0.9,
            ..Default::default()
        };
        store.upsert_function(&record).unwrap();

        record.purpose = String::new();
        record.end_line = 9;
        store.upsert_function(&record).unwrap();

        let stored = store.get_function("src/lib.rs", "parse").unwrap().unwrap();
        // whole-record replace: the old purpose is gone, not merged
        assert_eq!(stored.purpose, "");
        assert_eq!(stored.end_line, 9);
    }

    #[test]
    fn test_absolute_inside_root_stored_relative() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let abs = store.workspace().join("src/lib.rs");

        let record = FunctionRecord {
            file_path: abs.to_string_lossy().to_string(),
            name: "f".to_string(),
            ..Default::default()
        };
        store.upsert_function(&record).unwrap();

        let stored = store.get_function("src/lib.rs", "f").unwrap().unwrap();
        assert_eq!(stored.file_path, "src/lib.rs");

        // outside-root absolutes are preserved verbatim
        let outside = FunctionRecord {
            file_path: "/etc/passwd".to_string(),
            name: "g".to_string(),
            ..Default::default()
        };
        store.upsert_function(&outside).unwrap();
        let stored = store.get_function("/etc/passwd", "g").unwrap().unwrap();
        assert_eq!(stored.file_path, "/etc/passwd");
    }

    #[test]
    fn test_module_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        let record = ModuleRecord {
            file_path: "src/mod.py".to_string(),
            language: "python".to_string(),
            exports: vec!["visible".to_string()],
            dependencies: vec!["os".to_string()],
            partially_indexed: false,
        };
        store.upsert_module(&record).unwrap();
        let stored = store.get_module("src/mod.py").unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn test_similarity_ranking_and_tie_break() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        store
            .set_embedding("a.rs::near", &unit(&[1.0, 0.1]), "m1", EntityType::Function)
            .unwrap();
        store
            .set_embedding("b.rs::far", &unit(&[0.0, 1.0]), "m1", EntityType::Function)
            .unwrap();
        // exact duplicate vectors to exercise the tie-break
        store
            .set_embedding("z.rs::dup", &unit(&[1.0, 0.0]), "m1", EntityType::Function)
            .unwrap();
        store
            .set_embedding("a.rs::dup", &unit(&[1.0, 0.0]), "m1", EntityType::Function)
            .unwrap();

        let hits = store
            .find_similar_by_embedding(&unit(&[1.0, 0.0]), &SimilarityQuery::new("m1"))
            .unwrap();
        assert_eq!(hits[0].entity_id, "a.rs::dup");
        assert_eq!(hits[1].entity_id, "z.rs::dup");
        assert!(hits[0].similarity >= hits[2].similarity);
    }

    #[test]
    fn test_path_prefix_filter_applies_before_top_k() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        // globally dominant entity outside the prefix
        store
            .set_embedding(
                "vendor/big.rs::popular",
                &unit(&[1.0, 0.0]),
                "m1",
                EntityType::Function,
            )
            .unwrap();
        // weaker match inside the prefix
        store
            .set_embedding(
                "src/small.rs::relevant",
                &unit(&[0.8, 0.6]),
                "m1",
                EntityType::Function,
            )
            .unwrap();

        let mut query = SimilarityQuery::new("m1");
        query.limit = 1;
        query.path_prefix = Some("src".to_string());

        let hits = store
            .find_similar_by_embedding(&unit(&[1.0, 0.0]), &query)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity_id, "src/small.rs::relevant");
    }

    #[test]
    fn test_entity_type_filter() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        store
            .set_embedding("src/a.rs::f", &unit(&[1.0, 0.0]), "m1", EntityType::Function)
            .unwrap();
        store
            .set_embedding("src/a.rs", &unit(&[1.0, 0.0]), "m1", EntityType::Module)
            .unwrap();

        let mut query = SimilarityQuery::new("m1");
        query.entity_types = Some(vec![EntityType::Module]);
        let hits = store
            .find_similar_by_embedding(&unit(&[1.0, 0.0]), &query)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity_type, EntityType::Module);
    }

    #[test]
    fn test_embedding_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        store
            .set_embedding("a::f", &[1.0, 0.0, 0.0], "m1", EntityType::Function)
            .unwrap();
        let err = store
            .set_embedding("b::g", &[1.0, 0.0], "m1", EntityType::Function)
            .unwrap_err();
        assert_eq!(err.code(), "dimension_mismatch");
    }

    #[test]
    fn test_context_pack_hash_identical_for_abs_and_rel_inputs() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let root = store.workspace().to_path_buf();

        let relative = ContextPack {
            target_id: "src/lib.rs::parse".to_string(),
            pack_type: "overview".to_string(),
            summary: "parses input".to_string(),
            related_files: vec!["src/lib.rs".to_string()],
            code_snippets: vec![CodeSnippet {
                file_path: "src/lib.rs".to_string(),
                start_line: 1,
                end_line: 3,
                content: "fn parse() {}".to_string(),
            }],
            ..Default::default()
        };
        let stored_rel = store.upsert_context_pack(&relative).unwrap();

        let mut absolute = relative.clone();
        absolute.related_files = vec![root.join("src/lib.rs").to_string_lossy().to_string()];
        absolute.code_snippets[0].file_path =
            root.join("src/lib.rs").to_string_lossy().to_string();
        let stored_abs = store.upsert_context_pack(&absolute).unwrap();

        assert_eq!(stored_rel.content_hash, stored_abs.content_hash);
        assert_eq!(stored_abs.related_files, vec!["src/lib.rs".to_string()]);
        assert_eq!(stored_abs.code_snippets[0].file_path, "src/lib.rs");
    }

    #[test]
    fn test_context_pack_queries() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);

        for (target, file) in [("a::f", "src/a.rs"), ("b::g", "lib/b.rs")] {
            store
                .upsert_context_pack(&ContextPack {
                    target_id: target.to_string(),
                    pack_type: "overview".to_string(),
                    summary: "s".to_string(),
                    related_files: vec![file.to_string()],
                    ..Default::default()
                })
                .unwrap();
        }

        let by_file = store
            .get_context_packs(&ContextPackQuery {
                related_file: Some("src/a.rs".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_file.len(), 1);
        assert_eq!(by_file[0].target_id, "a::f");

        let by_prefix = store
            .get_context_packs(&ContextPackQuery {
                related_file_prefix: Some("lib".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_prefix.len(), 1);
        assert_eq!(by_prefix[0].target_id, "b::g");
    }

    #[test]
    fn test_pack_lookup_bumps_access_count() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        store
            .upsert_context_pack(&ContextPack {
                target_id: "a::f".to_string(),
                pack_type: "overview".to_string(),
                summary: "s".to_string(),
                ..Default::default()
            })
            .unwrap();

        store.get_context_pack_for_target("a::f", "overview").unwrap();
        let pack = store
            .get_context_pack_for_target("a::f", "overview")
            .unwrap()
            .unwrap();
        assert_eq!(pack.access_count, 1);
    }

    #[test]
    fn test_store_debug_reports_session_state() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let rendered = format!("{:?}", store);
        assert!(rendered.contains("workspace"));
        assert!(rendered.contains("holds_lease: true"));
    }

    #[test]
    fn test_initialize_conflict_reports_storage_locked() {
        let dir = TempDir::new().unwrap();

        // Simulate a distinct live owner
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let owner_pid = child.id();
        let owner_start = crate::lock::process_start_time(owner_pid).unwrap();
        std::fs::create_dir_all(paths::store_dir(dir.path())).unwrap();
        std::fs::write(
            paths::lease_path(dir.path()),
            serde_json::to_vec(&crate::schema::LeaseInfo {
                pid: owner_pid,
                started_at: chrono::Utc::now().to_rfc3339(),
                process_started_at: owner_start,
            })
            .unwrap(),
        )
        .unwrap();

        let options = StoreOptions {
            acquire: AcquireOptions {
                timeout_ms: 200,
                poll_interval_ms: 20,
            },
        };
        let err = Store::initialize(dir.path(), &options).unwrap_err();
        assert_eq!(err.code(), "storage_locked");

        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    fn test_read_only_rejects_mutation_but_allows_reads() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open(&dir);
            store
                .upsert_module(&ModuleRecord {
                    file_path: "src/a.rs".to_string(),
                    language: "rust".to_string(),
                    ..Default::default()
                })
                .unwrap();
            store.close().unwrap();
        }

        let mut reader = Store::open_read_only(dir.path()).unwrap();
        assert!(reader.get_module("src/a.rs").unwrap().is_some());
        let err = reader
            .upsert_module(&ModuleRecord::default())
            .unwrap_err();
        assert_eq!(err.code(), "workspace");
    }

    #[test]
    fn test_reads_proceed_while_lease_is_held() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(&dir);
        writer
            .upsert_module(&ModuleRecord {
                file_path: "src/a.rs".to_string(),
                language: "rust".to_string(),
                ..Default::default()
            })
            .unwrap();

        // reader opens while the writer still holds the lease
        let reader = Store::open_read_only(dir.path()).unwrap();
        assert!(reader.get_module("src/a.rs").unwrap().is_some());
    }
}
