use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use revlink_core::{
    group_links, new_touched, plan_table_inline, BranchId, ContainerAssignment, Link, ObjectId,
    Revision, RowOp, TablePlan, VersionedRow,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// Logical destination tables share one physical table keyed by table_name;
// the migration resolves destination types once per run, so no dynamic DDL
// is ever needed.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS versioned_rows (
  table_name TEXT NOT NULL,
  branch INTEGER NOT NULL,
  id INTEGER NOT NULL,
  rev_min INTEGER NOT NULL CHECK (rev_min >= 1),
  rev_max INTEGER NOT NULL,
  rev_create INTEGER NOT NULL,
  container_id INTEGER,
  container_type TEXT,
  container_reference INTEGER,
  sort_order INTEGER,
  attributes_json TEXT NOT NULL,
  PRIMARY KEY (table_name, branch, id, rev_min)
);

CREATE TABLE IF NOT EXISTS link_rows (
  branch INTEGER NOT NULL,
  id INTEGER NOT NULL,
  rev_min INTEGER NOT NULL,
  rev_max INTEGER NOT NULL,
  reference_id INTEGER NOT NULL,
  source_table TEXT NOT NULL,
  src_id INTEGER NOT NULL,
  src_type TEXT NOT NULL,
  dest_id INTEGER NOT NULL,
  dest_type TEXT NOT NULL,
  sort_order INTEGER,
  PRIMARY KEY (branch, id, rev_min)
);

CREATE TABLE IF NOT EXISTS revision_xref (
  branch INTEGER NOT NULL,
  rev INTEGER NOT NULL,
  table_name TEXT NOT NULL,
  PRIMARY KEY (branch, rev, table_name)
);

CREATE INDEX IF NOT EXISTS idx_link_rows_source ON link_rows(reference_id, source_table, src_id);
CREATE INDEX IF NOT EXISTS idx_link_rows_dest ON link_rows(dest_type, dest_id, rev_min);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Selects the link rows one migration pass inlines: one reference attribute,
/// one branch, one source table, optionally restricted to specific sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InlineRequest {
    pub branch: BranchId,
    pub reference_id: ObjectId,
    pub source_table: String,
    /// Empty means every source object of `source_table`.
    pub source_ids: Vec<ObjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSummary {
    pub table: String,
    pub rows_updated: usize,
    pub rows_inserted: usize,
    pub touched_recorded: usize,
    pub touched_deduped: usize,
    pub skipped_dest_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationSummary {
    pub dry_run: bool,
    pub links_matched: usize,
    pub links_deleted: usize,
    pub tables: Vec<TableSummary>,
}

impl SqliteStore {
    /// Open a SQLite-backed versioned store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one versioned row of a logical destination table.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_row(&mut self, table: &str, row: &VersionedRow) -> Result<()> {
        let attributes_json =
            serde_json::to_string(&row.attributes).context("failed to serialize row attributes")?;
        let container = row.container.as_ref();

        self.conn
            .execute(
                "INSERT INTO versioned_rows(
                    table_name, branch, id, rev_min, rev_max, rev_create,
                    container_id, container_type, container_reference, sort_order, attributes_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    table,
                    row.branch.0,
                    row.id.0,
                    row.rev_min,
                    row.rev_max,
                    row.rev_create,
                    container.map(|c| c.container_id.0),
                    container.map(|c| c.container_type.as_str()),
                    container.and_then(|c| c.container_reference.map(|id| id.0)),
                    container.and_then(|c| c.sort_order),
                    attributes_json,
                ],
            )
            .context("failed to insert versioned row")?;
        Ok(())
    }

    /// Persist one link-table row for a migrating reference attribute.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_link(
        &mut self,
        reference_id: ObjectId,
        source_table: &str,
        link: &Link,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO link_rows(
                    branch, id, rev_min, rev_max, reference_id, source_table,
                    src_id, src_type, dest_id, dest_type, sort_order
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    link.branch.0,
                    link.id.0,
                    link.rev_min,
                    link.rev_max,
                    reference_id.0,
                    source_table,
                    link.src_id.0,
                    link.src_type,
                    link.dest_id.0,
                    link.dest_type,
                    link.sort_order,
                ],
            )
            .context("failed to insert link row")?;
        Ok(())
    }

    /// Load a logical table's rows on one branch, ordered `(id, rev_min)`,
    /// optionally restricted to a single object.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_rows(
        &self,
        table: &str,
        branch: BranchId,
        id: Option<ObjectId>,
    ) -> Result<Vec<VersionedRow>> {
        match id {
            Some(id) => fetch_rows_where(
                &self.conn,
                "table_name = ?1 AND branch = ?2 AND id = ?3",
                params![table, branch.0, id.0].to_vec(),
            ),
            None => fetch_rows_where(
                &self.conn,
                "table_name = ?1 AND branch = ?2",
                params![table, branch.0].to_vec(),
            ),
        }
    }

    /// Load the link rows a request selects, ordered `(dest_type, dest_id, rev_min)`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn fetch_links(&self, request: &InlineRequest) -> Result<Vec<Link>> {
        let mut sql = String::from(
            "SELECT branch, id, rev_min, rev_max, src_id, src_type, dest_id, dest_type, sort_order
             FROM link_rows
             WHERE branch = ?1 AND reference_id = ?2 AND source_table = ?3",
        );
        let mut bind: Vec<Value> = vec![
            Value::Integer(request.branch.0),
            Value::Integer(request.reference_id.0),
            Value::Text(request.source_table.clone()),
        ];
        if !request.source_ids.is_empty() {
            sql.push_str(" AND src_id IN (");
            sql.push_str(&placeholders(bind.len() + 1, request.source_ids.len()));
            sql.push(')');
            bind.extend(request.source_ids.iter().map(|id| Value::Integer(id.0)));
        }
        sql.push_str(" ORDER BY dest_type ASC, dest_id ASC, rev_min ASC");

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare link query")?;
        let rows = stmt.query_map(params_from_iter(bind), |row| {
            Ok(Link {
                branch: BranchId(row.get(0)?),
                id: ObjectId(row.get(1)?),
                rev_min: row.get(2)?,
                rev_max: row.get(3)?,
                src_id: ObjectId(row.get(4)?),
                src_type: row.get(5)?,
                dest_id: ObjectId(row.get(6)?),
                dest_type: row.get(7)?,
                sort_order: row.get(8)?,
            })
        })?;

        let mut links = Vec::new();
        for row in rows {
            links.push(row.context("failed to read link row")?);
        }
        Ok(links)
    }

    /// Touched-revision index entries for one branch and logical table.
    ///
    /// # Errors
    /// Returns an error when the index cannot be read.
    pub fn list_touched(&self, branch: BranchId, table: &str) -> Result<Vec<Revision>> {
        let existing = existing_touched(&self.conn, branch, table)?;
        Ok(existing.into_iter().collect())
    }

    /// Run one inline migration pass end to end: fetch the selected links,
    /// overlay them onto each destination table's row histories inside a
    /// per-table transaction, record newly introduced boundaries in the
    /// consistency index, then delete the inlined links. With `dry_run` the
    /// pass plans and summarizes without writing anything.
    ///
    /// # Errors
    /// Returns an error when any history violates the contiguity invariant,
    /// links overlap, or any read/write fails; the failing table's transaction
    /// is rolled back and no later table is attempted.
    pub fn run_inline(&mut self, request: &InlineRequest, dry_run: bool) -> Result<MigrationSummary> {
        let links = self.fetch_links(request)?;
        let links_matched = links.len();
        let groups = group_links(links);

        tracing::info!(
            branch = request.branch.0,
            reference_id = request.reference_id.0,
            source_table = %request.source_table,
            links = links_matched,
            tables = groups.by_table.len(),
            dry_run,
            "starting inline migration pass"
        );

        let mut tables = Vec::new();
        for (table, by_dest) in &groups.by_table {
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start transaction for table {table}"))?;

            let dest_ids: Vec<ObjectId> = by_dest.keys().copied().collect();
            let rows = fetch_dest_rows(&tx, table, request.branch, &dest_ids)?;
            let plan = plan_table_inline(table, &rows, by_dest, Some(request.reference_id))
                .with_context(|| format!("inline planning failed for table {table}"))?;

            let existing = existing_touched(&tx, request.branch, table)?;
            let fresh = new_touched(&plan.touched, &existing);
            let touched_deduped = plan.touched.len() - fresh.len();

            // A dry run leaves the transaction to drop uncommitted.
            let mut touched_recorded = fresh.len();
            if !dry_run {
                apply_ops(&tx, table, &plan.ops)?;
                touched_recorded = record_touched(&tx, request.branch, table, &fresh)?;
                tx.commit()
                    .with_context(|| format!("failed to commit migration of table {table}"))?;
            }

            tables.push(summarize_table(&plan, touched_recorded, touched_deduped));
        }

        let links_deleted = if dry_run { 0 } else { self.delete_links(request)? };

        Ok(MigrationSummary { dry_run, links_matched, links_deleted, tables })
    }

    /// Delete the link rows a request selects; they are fully represented by
    /// inlined container fields after a successful pass.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_links(&mut self, request: &InlineRequest) -> Result<usize> {
        let mut sql = String::from(
            "DELETE FROM link_rows WHERE branch = ?1 AND reference_id = ?2 AND source_table = ?3",
        );
        let mut bind: Vec<Value> = vec![
            Value::Integer(request.branch.0),
            Value::Integer(request.reference_id.0),
            Value::Text(request.source_table.clone()),
        ];
        if !request.source_ids.is_empty() {
            sql.push_str(" AND src_id IN (");
            sql.push_str(&placeholders(bind.len() + 1, request.source_ids.len()));
            sql.push(')');
            bind.extend(request.source_ids.iter().map(|id| Value::Integer(id.0)));
        }

        let deleted = self
            .conn
            .execute(&sql, params_from_iter(bind))
            .context("failed to delete inlined link rows")?;
        tracing::info!(deleted, "removed inlined link rows");
        Ok(deleted)
    }
}

fn summarize_table(plan: &TablePlan, touched_recorded: usize, touched_deduped: usize) -> TableSummary {
    TableSummary {
        table: plan.table.clone(),
        rows_updated: plan.updates(),
        rows_inserted: plan.inserts(),
        touched_recorded,
        touched_deduped,
        skipped_dest_ids: plan.skipped_dest_ids.iter().map(|id| id.0).collect(),
    }
}

/// `?N, ?N+1, ...` placeholder list for a dynamic IN clause.
fn placeholders(first: usize, count: usize) -> String {
    let mut out = String::new();
    for index in 0..count {
        if index > 0 {
            out.push_str(", ");
        }
        out.push('?');
        out.push_str(&(first + index).to_string());
    }
    out
}

fn fetch_rows_where(
    conn: &Connection,
    predicate: &str,
    bind: Vec<&dyn rusqlite::ToSql>,
) -> Result<Vec<VersionedRow>> {
    let sql = format!(
        "SELECT branch, id, rev_min, rev_max, rev_create,
                container_id, container_type, container_reference, sort_order, attributes_json
         FROM versioned_rows
         WHERE {predicate}
         ORDER BY branch ASC, id ASC, rev_min ASC"
    );
    let mut stmt = conn.prepare(&sql).context("failed to prepare row query")?;
    let raw = stmt.query_map(&bind[..], read_raw_row)?;

    let mut rows = Vec::new();
    for row in raw {
        rows.push(decode_row(row.context("failed to read versioned row")?)?);
    }
    Ok(rows)
}

fn fetch_dest_rows(
    tx: &Transaction<'_>,
    table: &str,
    branch: BranchId,
    dest_ids: &[ObjectId],
) -> Result<Vec<VersionedRow>> {
    if dest_ids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT branch, id, rev_min, rev_max, rev_create,
                container_id, container_type, container_reference, sort_order, attributes_json
         FROM versioned_rows
         WHERE table_name = ?1 AND branch = ?2 AND id IN ({})
         ORDER BY branch ASC, id ASC, rev_min ASC",
        placeholders(3, dest_ids.len())
    );
    let mut bind: Vec<Value> = vec![Value::Text(table.to_string()), Value::Integer(branch.0)];
    bind.extend(dest_ids.iter().map(|id| Value::Integer(id.0)));

    let mut stmt = tx.prepare(&sql).context("failed to prepare destination row query")?;
    let raw = stmt.query_map(params_from_iter(bind), read_raw_row)?;

    let mut rows = Vec::new();
    for row in raw {
        rows.push(decode_row(row.context("failed to read versioned row")?)?);
    }
    Ok(rows)
}

type RawRow =
    (i64, i64, i64, i64, i64, Option<i64>, Option<String>, Option<i64>, Option<i64>, String);

fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode_row(raw: RawRow) -> Result<VersionedRow> {
    let (
        branch,
        id,
        rev_min,
        rev_max,
        rev_create,
        container_id,
        container_type,
        container_reference,
        sort_order,
        attributes_json,
    ) = raw;

    let container = match (container_id, container_type) {
        (Some(container_id), Some(container_type)) => Some(ContainerAssignment {
            container_id: ObjectId(container_id),
            container_type,
            container_reference: container_reference.map(ObjectId),
            sort_order,
        }),
        (None, None) => None,
        _ => {
            return Err(anyhow!(
                "versioned row {id} on branch {branch} has a half-populated container"
            ))
        }
    };

    Ok(VersionedRow {
        branch: BranchId(branch),
        id: ObjectId(id),
        rev_min,
        rev_max,
        rev_create,
        container,
        attributes: serde_json::from_str(&attributes_json)
            .context("failed to deserialize row attributes")?,
    })
}

// Updates run before inserts: until its lower bound moves, a split row still
// occupies the rev_min values its inserted segments will take over, and
// versioned_rows keys on (table_name, branch, id, rev_min). A row's final
// rev_min always lies above its inserted segments', so updates-first never
// collides.
fn apply_ops(tx: &Transaction<'_>, table: &str, ops: &[RowOp]) -> Result<()> {
    for op in ops {
        if let RowOp::Update(update) = op {
            let container = update.container.as_ref();
            let affected = tx
                .execute(
                    "UPDATE versioned_rows
                     SET rev_min = ?1, container_id = ?2, container_type = ?3,
                         container_reference = ?4, sort_order = ?5
                     WHERE table_name = ?6 AND branch = ?7 AND id = ?8 AND rev_max = ?9",
                    params![
                        update.new_rev_min,
                        container.map(|c| c.container_id.0),
                        container.map(|c| c.container_type.as_str()),
                        container.and_then(|c| c.container_reference.map(|id| id.0)),
                        container.and_then(|c| c.sort_order),
                        table,
                        update.branch.0,
                        update.id.0,
                        update.rev_max,
                    ],
                )
                .context("failed to update versioned row")?;
            if affected != 1 {
                return Err(revlink_core::EngineError::UnknownRow {
                    branch: update.branch,
                    id: update.id,
                    rev_max: update.rev_max,
                }
                .into());
            }
        }
    }

    for op in ops {
        if let RowOp::Insert(row) = op {
            let attributes_json =
                serde_json::to_string(&row.attributes).context("failed to serialize row attributes")?;
            let container = row.container.as_ref();
            tx.execute(
                "INSERT INTO versioned_rows(
                    table_name, branch, id, rev_min, rev_max, rev_create,
                    container_id, container_type, container_reference, sort_order,
                    attributes_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    table,
                    row.branch.0,
                    row.id.0,
                    row.rev_min,
                    row.rev_max,
                    row.rev_create,
                    container.map(|c| c.container_id.0),
                    container.map(|c| c.container_type.as_str()),
                    container.and_then(|c| c.container_reference.map(|id| id.0)),
                    container.and_then(|c| c.sort_order),
                    attributes_json,
                ],
            )
            .context("failed to insert split row")?;
        }
    }
    Ok(())
}

fn existing_touched(
    conn: &Connection,
    branch: BranchId,
    table: &str,
) -> Result<BTreeSet<Revision>> {
    let mut stmt = conn
        .prepare(
            "SELECT rev FROM revision_xref WHERE branch = ?1 AND table_name = ?2 ORDER BY rev ASC",
        )
        .context("failed to prepare revision index query")?;
    let rows = stmt.query_map(params![branch.0, table], |row| row.get::<_, i64>(0))?;

    let mut revisions = BTreeSet::new();
    for row in rows {
        revisions.insert(row.context("failed to read revision index row")?);
    }
    Ok(revisions)
}

fn record_touched(
    tx: &Transaction<'_>,
    branch: BranchId,
    table: &str,
    revisions: &BTreeSet<Revision>,
) -> Result<usize> {
    let mut recorded = 0_usize;
    for rev in revisions {
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO revision_xref(branch, rev, table_name) VALUES (?1, ?2, ?3)",
                params![branch.0, rev, table],
            )
            .context("failed to record touched revision")?;
        if inserted == 1 {
            recorded += 1;
        } else {
            // Deduped against the pre-read set already; a residual conflict
            // means a concurrent writer got there first.
            tracing::warn!(branch = branch.0, table, rev, "touched revision already indexed");
        }
    }
    Ok(recorded)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    const REF: ObjectId = ObjectId(900);

    fn open_store() -> SqliteStore {
        let mut store = match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("opening in-memory store should succeed: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("migration should succeed: {err}");
        }
        store
    }

    fn mk_row(id: i64, rev_min: Revision, rev_max: Revision) -> VersionedRow {
        let mut attributes = BTreeMap::new();
        attributes.insert("name".to_string(), json!(format!("child-{id}")));
        VersionedRow {
            branch: BranchId::TRUNK,
            id: ObjectId(id),
            rev_min,
            rev_max,
            rev_create: rev_min,
            container: None,
            attributes,
        }
    }

    fn mk_link(id: i64, rev_min: Revision, rev_max: Revision, src_id: i64, dest_id: i64) -> Link {
        Link {
            branch: BranchId::TRUNK,
            id: ObjectId(id),
            rev_min,
            rev_max,
            src_id: ObjectId(src_id),
            src_type: "containers".to_string(),
            dest_id: ObjectId(dest_id),
            dest_type: "children".to_string(),
            sort_order: Some(0),
        }
    }

    fn request() -> InlineRequest {
        InlineRequest {
            branch: BranchId::TRUNK,
            reference_id: REF,
            source_table: "containers".to_string(),
            source_ids: Vec::new(),
        }
    }

    fn seed(store: &mut SqliteStore) {
        let fixtures = [
            ("children", mk_row(100, 10, 50)),
            ("children", mk_row(101, 1, 100)),
        ];
        for (table, row) in fixtures {
            if let Err(err) = store.insert_row(table, &row) {
                panic!("seeding rows should succeed: {err}");
            }
        }
        let links = [mk_link(5000, 20, 30, 7, 100), mk_link(5001, 1, 40, 9, 101)];
        for link in links {
            if let Err(err) = store.insert_link(REF, "containers", &link) {
                panic!("seeding links should succeed: {err}");
            }
        }
    }

    fn run(store: &mut SqliteStore, dry_run: bool) -> MigrationSummary {
        match store.run_inline(&request(), dry_run) {
            Ok(summary) => summary,
            Err(err) => panic!("inline run should succeed: {err}"),
        }
    }

    fn rows(store: &SqliteStore, id: i64) -> Vec<VersionedRow> {
        match store.list_rows("children", BranchId::TRUNK, Some(ObjectId(id))) {
            Ok(rows) => rows,
            Err(err) => panic!("listing rows should succeed: {err}"),
        }
    }

    #[test]
    fn fresh_database_migrates_to_latest_schema() {
        let store = open_store();
        let status = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should succeed: {err}"),
        };
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
    }

    #[test]
    fn inline_run_splits_histories_and_deletes_links() {
        let mut store = open_store();
        seed(&mut store);

        let summary = run(&mut store, false);

        assert!(!summary.dry_run);
        assert_eq!(summary.links_matched, 2);
        assert_eq!(summary.links_deleted, 2);
        assert_eq!(summary.tables.len(), 1);
        assert_eq!(summary.tables[0].table, "children");
        assert_eq!(summary.tables[0].rows_inserted, 3);
        assert_eq!(summary.tables[0].rows_updated, 2);
        assert_eq!(summary.tables[0].touched_recorded, 3);

        let history = rows(&store, 100);
        assert_eq!(
            history.iter().map(|row| (row.rev_min, row.rev_max)).collect::<Vec<_>>(),
            vec![(10, 19), (20, 30), (31, 50)]
        );
        assert_eq!(
            history[1].container.as_ref().map(|c| c.container_id),
            Some(ObjectId(7))
        );
        assert_eq!(history[1].container.as_ref().and_then(|c| c.container_reference), Some(REF));
        assert!(history[0].container.is_none());
        assert!(history[2].container.is_none());
        assert!(history.iter().all(|row| row.rev_create == 10));

        let touched = match store.list_touched(BranchId::TRUNK, "children") {
            Ok(touched) => touched,
            Err(err) => panic!("listing touched revisions should succeed: {err}"),
        };
        assert_eq!(touched, vec![20, 31, 41]);

        let leftover = match store.fetch_links(&request()) {
            Ok(leftover) => leftover,
            Err(err) => panic!("fetching links should succeed: {err}"),
        };
        assert!(leftover.is_empty());
    }

    // The split segments of one row reuse rev_min values the original row
    // held, so the insert pass must not race the primary key on
    // (table_name, branch, id, rev_min).
    #[test]
    fn splitting_one_row_survives_the_rev_min_uniqueness_key() {
        let mut store = open_store();
        if let Err(err) = store.insert_row("children", &mk_row(100, 10, 50)) {
            panic!("seeding row should succeed: {err}");
        }
        if let Err(err) = store.insert_link(REF, "containers", &mk_link(5000, 20, 30, 7, 100)) {
            panic!("seeding link should succeed: {err}");
        }

        let summary = run(&mut store, false);
        assert_eq!(summary.tables[0].rows_inserted, 2);
        assert_eq!(summary.tables[0].rows_updated, 1);

        let history = rows(&store, 100);
        assert_eq!(
            history.iter().map(|row| (row.rev_min, row.rev_max)).collect::<Vec<_>>(),
            vec![(10, 19), (20, 30), (31, 50)]
        );
    }

    #[test]
    fn touched_boundaries_already_indexed_are_deduplicated() {
        let mut store = open_store();
        seed(&mut store);
        if let Err(err) = store.conn.execute(
            "INSERT INTO revision_xref(branch, rev, table_name) VALUES (?1, ?2, ?3)",
            params![BranchId::TRUNK.0, 31_i64, "children"],
        ) {
            panic!("seeding revision index should succeed: {err}");
        }

        let summary = run(&mut store, false);
        assert_eq!(summary.tables[0].touched_deduped, 1);
        assert_eq!(summary.tables[0].touched_recorded, 2);

        let touched = match store.list_touched(BranchId::TRUNK, "children") {
            Ok(touched) => touched,
            Err(err) => panic!("listing touched revisions should succeed: {err}"),
        };
        assert_eq!(touched, vec![20, 31, 41]);
    }

    #[test]
    fn dry_run_plans_without_writing() {
        let mut store = open_store();
        seed(&mut store);

        let summary = run(&mut store, true);

        assert!(summary.dry_run);
        assert_eq!(summary.links_matched, 2);
        assert_eq!(summary.links_deleted, 0);
        assert_eq!(summary.tables[0].rows_inserted, 3);

        assert_eq!(rows(&store, 100).len(), 1);
        let remaining = match store.fetch_links(&request()) {
            Ok(remaining) => remaining,
            Err(err) => panic!("fetching links should succeed: {err}"),
        };
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn second_run_after_migration_is_a_no_op() {
        let mut store = open_store();
        seed(&mut store);
        run(&mut store, false);

        let summary = run(&mut store, false);
        assert_eq!(summary.links_matched, 0);
        assert!(summary.tables.is_empty());
        assert_eq!(summary.links_deleted, 0);
        assert_eq!(rows(&store, 100).len(), 3);
    }

    #[test]
    fn links_without_destination_rows_are_skipped_not_fatal() {
        let mut store = open_store();
        seed(&mut store);
        if let Err(err) = store.insert_link(REF, "containers", &mk_link(5002, 5, 9, 7, 999)) {
            panic!("seeding orphan link should succeed: {err}");
        }

        let summary = run(&mut store, false);
        assert_eq!(summary.tables[0].skipped_dest_ids, vec![999]);
        // Orphan links are still part of the selected set and get cleaned up.
        assert_eq!(summary.links_deleted, 3);
    }

    #[test]
    fn broken_history_aborts_the_run_without_partial_writes() {
        let mut store = open_store();
        let gapped = [mk_row(100, 1, 5), mk_row(100, 7, 9)];
        for row in &gapped {
            if let Err(err) = store.insert_row("children", row) {
                panic!("seeding rows should succeed: {err}");
            }
        }
        if let Err(err) = store.insert_link(REF, "containers", &mk_link(5000, 2, 3, 7, 100)) {
            panic!("seeding link should succeed: {err}");
        }

        assert!(store.run_inline(&request(), false).is_err());

        assert_eq!(rows(&store, 100).len(), 2);
        let remaining = match store.fetch_links(&request()) {
            Ok(remaining) => remaining,
            Err(err) => panic!("fetching links should succeed: {err}"),
        };
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn source_id_filter_restricts_the_pass() {
        let mut store = open_store();
        seed(&mut store);

        let mut narrowed = request();
        narrowed.source_ids = vec![ObjectId(7)];
        let summary = match store.run_inline(&narrowed, false) {
            Ok(summary) => summary,
            Err(err) => panic!("inline run should succeed: {err}"),
        };

        assert_eq!(summary.links_matched, 1);
        assert_eq!(summary.links_deleted, 1);
        assert_eq!(rows(&store, 100).len(), 3);
        // The other source's link is untouched.
        assert_eq!(rows(&store, 101).len(), 1);
    }
}
