use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// A point on a branch's revision axis. Revisions start at 1 and only grow.
pub type Revision = i64;

/// Sentinel upper bound for a row that is still current.
pub const CURRENT_REV: Revision = i64::MAX;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BranchId(pub i64);

impl BranchId {
    pub const TRUNK: Self = Self(1);
}

impl Display for BranchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectId(pub i64);

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("object {id} on branch {branch} has invalid interval [{rev_min},{rev_max}]")]
    InvalidInterval { branch: BranchId, id: ObjectId, rev_min: Revision, rev_max: Revision },
    #[error(
        "row history of object {id} on branch {branch} is not contiguous: \
         a row ending at {prev_max} is followed by a row starting at {next_min}"
    )]
    BrokenHistory { branch: BranchId, id: ObjectId, prev_max: Revision, next_min: Revision },
    #[error(
        "links targeting object {dest_id} overlap: \
         a link ending at {prev_max} is followed by a link starting at {next_min}"
    )]
    OverlappingLinks { dest_id: ObjectId, prev_max: Revision, next_min: Revision },
    #[error("update addresses unknown row: object {id} on branch {branch} ending at {rev_max}")]
    UnknownRow { branch: BranchId, id: ObjectId, rev_max: Revision },
}

/// Inlined container fields owned by the migration engine. `None` on a row
/// means the row has no container for its whole lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContainerAssignment {
    pub container_id: ObjectId,
    pub container_type: String,
    pub container_reference: Option<ObjectId>,
    pub sort_order: Option<i64>,
}

impl ContainerAssignment {
    #[must_use]
    pub fn from_link(link: &Link, reference_id: Option<ObjectId>) -> Self {
        Self {
            container_id: link.src_id,
            container_type: link.src_type.clone(),
            container_reference: reference_id,
            sort_order: link.sort_order,
        }
    }
}

/// One version of a "child belongs to container" fact, extracted from the
/// link table that is being inlined.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Link {
    pub branch: BranchId,
    pub id: ObjectId,
    pub rev_min: Revision,
    pub rev_max: Revision,
    pub src_id: ObjectId,
    pub src_type: String,
    pub dest_id: ObjectId,
    pub dest_type: String,
    pub sort_order: Option<i64>,
}

/// One version of an object's attributes in the versioned store.
///
/// For a fixed `(branch, id)` the rows form a contiguous partition of the
/// revision axis: sorted by `rev_min`, each row's `rev_max + 1` equals the
/// next row's `rev_min`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedRow {
    pub branch: BranchId,
    pub id: ObjectId,
    pub rev_min: Revision,
    pub rev_max: Revision,
    pub rev_create: Revision,
    pub container: Option<ContainerAssignment>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl VersionedRow {
    /// Clone this row into a split segment with adjusted bounds and
    /// substituted container fields. `rev_create` is carried over unchanged.
    #[must_use]
    pub fn split_clone(
        &self,
        rev_min: Revision,
        rev_max: Revision,
        container: Option<ContainerAssignment>,
    ) -> Self {
        Self {
            branch: self.branch,
            id: self.id,
            rev_min,
            rev_max,
            rev_create: self.rev_create,
            container,
            attributes: self.attributes.clone(),
        }
    }
}

/// Rewrites the lower bound and container fields of one existing row.
///
/// The addressed row is identified by `(branch, id, rev_max)`: the engine
/// never moves a row's upper bound, so it stays a stable address across all
/// splits applied to the same history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowUpdate {
    pub branch: BranchId,
    pub id: ObjectId,
    pub rev_max: Revision,
    pub new_rev_min: Revision,
    pub container: Option<ContainerAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum RowOp {
    Update(RowUpdate),
    Insert(VersionedRow),
}

/// Planned operations for one destination object, plus every `rev_min`
/// boundary the split introduced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InlinePlan {
    pub ops: Vec<RowOp>,
    pub touched: BTreeSet<Revision>,
}

/// Planned operations for one destination table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TablePlan {
    pub table: String,
    pub ops: Vec<RowOp>,
    pub touched: BTreeSet<Revision>,
    /// Destinations referenced by links but absent from the fetched row set.
    pub skipped_dest_ids: Vec<ObjectId>,
}

impl TablePlan {
    #[must_use]
    pub fn updates(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, RowOp::Update(_))).count()
    }

    #[must_use]
    pub fn inserts(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, RowOp::Insert(_))).count()
    }
}

/// Link facts grouped by destination table, then destination object, each
/// group sorted by `rev_min`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkGroups {
    pub by_table: BTreeMap<String, BTreeMap<ObjectId, Vec<Link>>>,
}

impl LinkGroups {
    #[must_use]
    pub fn tables(&self) -> Vec<&str> {
        self.by_table.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn dest_ids(&self, table: &str) -> Vec<ObjectId> {
        self.by_table.get(table).map(|group| group.keys().copied().collect()).unwrap_or_default()
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.by_table.values().flat_map(BTreeMap::values).map(Vec::len).sum()
    }
}

/// Group raw link facts by destination table and destination object and
/// order each destination's links by `rev_min`. Pure; overlap is checked
/// later, when a destination is planned.
#[must_use]
pub fn group_links(links: Vec<Link>) -> LinkGroups {
    let mut by_table: BTreeMap<String, BTreeMap<ObjectId, Vec<Link>>> = BTreeMap::new();
    for link in links {
        by_table
            .entry(link.dest_type.clone())
            .or_default()
            .entry(link.dest_id)
            .or_default()
            .push(link);
    }

    for group in by_table.values_mut() {
        for links in group.values_mut() {
            links.sort_by_key(|link| link.rev_min);
        }
    }

    LinkGroups { by_table }
}

/// Iterates a table's row set one object history at a time. Rows must
/// already be ordered by `(branch, id, rev_min)`, the order the store
/// fetches them in.
#[derive(Debug, Clone, Copy)]
pub struct ObjectHistories<'a> {
    rows: &'a [VersionedRow],
}

impl<'a> ObjectHistories<'a> {
    #[must_use]
    pub fn new(rows: &'a [VersionedRow]) -> Self {
        Self { rows }
    }

    pub fn iter(self) -> impl Iterator<Item = (ObjectId, &'a [VersionedRow])> {
        self.rows
            .chunk_by(|lhs, rhs| lhs.branch == rhs.branch && lhs.id == rhs.id)
            .map(|history| (history[0].id, history))
    }
}

/// Check the contiguity invariant for one ordered row history.
///
/// # Errors
/// Returns [`EngineError::InvalidInterval`] for an inverted row interval and
/// [`EngineError::BrokenHistory`] when consecutive rows of the same object
/// leave a gap or overlap.
pub fn validate_history(rows: &[VersionedRow]) -> Result<(), EngineError> {
    for row in rows {
        if row.rev_min > row.rev_max {
            return Err(EngineError::InvalidInterval {
                branch: row.branch,
                id: row.id,
                rev_min: row.rev_min,
                rev_max: row.rev_max,
            });
        }
    }

    for pair in rows.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.branch != next.branch || prev.id != next.id {
            continue;
        }
        if prev.rev_max.checked_add(1) != Some(next.rev_min) {
            return Err(EngineError::BrokenHistory {
                branch: prev.branch,
                id: prev.id,
                prev_max: prev.rev_max,
                next_min: next.rev_min,
            });
        }
    }

    Ok(())
}

/// Check that one destination's ordered links never overlap.
///
/// # Errors
/// Returns [`EngineError::InvalidInterval`] for an inverted link interval and
/// [`EngineError::OverlappingLinks`] when two links cover a shared revision.
pub fn validate_links(links: &[Link]) -> Result<(), EngineError> {
    for link in links {
        if link.rev_min > link.rev_max {
            return Err(EngineError::InvalidInterval {
                branch: link.branch,
                id: link.id,
                rev_min: link.rev_min,
                rev_max: link.rev_max,
            });
        }
    }

    for pair in links.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.rev_max >= next.rev_min {
            return Err(EngineError::OverlappingLinks {
                dest_id: next.dest_id,
                prev_max: prev.rev_max,
                next_min: next.rev_min,
            });
        }
    }

    Ok(())
}

/// Overlay one destination object's link timeline onto its row history.
///
/// Walks rows and links in a single forward pass with two cursors. The link
/// cursor carries over from row to row: rows are contiguous and links are
/// sorted, so the pass is linear in `|rows| + |links|`. Produces the minimal
/// set of updates and inserts that gives every revision of the history the
/// container valid at that revision, plus the set of newly introduced
/// `rev_min` boundaries. A segment whose container already matches produces
/// no operation, which makes replanning over the engine's own output a no-op.
///
/// # Errors
/// Returns an [`EngineError`] when the row history is not contiguous or the
/// links overlap; no operations are produced in that case.
pub fn plan_object_inline(
    rows: &[VersionedRow],
    links: &[Link],
    reference_id: Option<ObjectId>,
) -> Result<InlinePlan, EngineError> {
    validate_history(rows)?;
    validate_links(links)?;

    let mut ops = Vec::new();
    let mut touched = BTreeSet::new();
    let mut l = 0_usize;

    for row in rows {
        let mut row_min = row.rev_min;
        let row_max = row.rev_max;
        // Becomes true once the live row lost a prefix to an inserted
        // segment; the final update must then be emitted unconditionally.
        let mut shrunk = false;

        loop {
            let link = match links.get(l) {
                Some(link) if link.rev_min <= row_max => link,
                _ => {
                    // No link covers the remainder [row_min, row_max].
                    if shrunk || row.container.is_some() {
                        ops.push(RowOp::Update(RowUpdate {
                            branch: row.branch,
                            id: row.id,
                            rev_max: row_max,
                            new_rev_min: row_min,
                            container: None,
                        }));
                    }
                    break;
                }
            };

            if link.rev_min <= row_min {
                if link.rev_max < row_min {
                    // Link ended before this row started.
                    l += 1;
                    continue;
                }
                if link.rev_max < row_max {
                    // Link covers only the prefix [row_min, link.rev_max].
                    ops.push(RowOp::Insert(row.split_clone(
                        row_min,
                        link.rev_max,
                        Some(ContainerAssignment::from_link(link, reference_id)),
                    )));
                    row_min = link.rev_max + 1;
                    touched.insert(row_min);
                    shrunk = true;
                    l += 1;
                    continue;
                }
                // Link covers the rest of the row.
                let assignment = ContainerAssignment::from_link(link, reference_id);
                if shrunk || row.container.as_ref() != Some(&assignment) {
                    ops.push(RowOp::Update(RowUpdate {
                        branch: row.branch,
                        id: row.id,
                        rev_max: row_max,
                        new_rev_min: row_min,
                        container: Some(assignment),
                    }));
                }
                if link.rev_max == row_max {
                    l += 1;
                }
                break;
            }

            // row_min < link.rev_min <= row_max: a container-less prefix
            // exists before the link takes effect.
            ops.push(RowOp::Insert(row.split_clone(row_min, link.rev_min - 1, None)));
            if link.rev_max < row_max {
                ops.push(RowOp::Insert(row.split_clone(
                    link.rev_min,
                    link.rev_max,
                    Some(ContainerAssignment::from_link(link, reference_id)),
                )));
                touched.insert(link.rev_min);
                row_min = link.rev_max + 1;
                touched.insert(row_min);
                shrunk = true;
                l += 1;
                continue;
            }
            ops.push(RowOp::Update(RowUpdate {
                branch: row.branch,
                id: row.id,
                rev_max: row_max,
                new_rev_min: link.rev_min,
                container: Some(ContainerAssignment::from_link(link, reference_id)),
            }));
            touched.insert(link.rev_min);
            if link.rev_max == row_max {
                l += 1;
            }
            break;
        }
    }

    Ok(InlinePlan { ops, touched })
}

/// Overlay every destination object of one table.
///
/// Link groups whose destination has no rows in the fetched set are skipped
/// with a warning and reported in the plan; this is a data-integrity gap in
/// the link table, not a reason to fail the table.
///
/// # Errors
/// Returns the first [`EngineError`] raised by any destination's planning
/// pass; the table must then be treated as not migrated at all.
pub fn plan_table_inline(
    table: &str,
    rows: &[VersionedRow],
    links_by_dest: &BTreeMap<ObjectId, Vec<Link>>,
    reference_id: Option<ObjectId>,
) -> Result<TablePlan, EngineError> {
    let mut histories: BTreeMap<(BranchId, ObjectId), &[VersionedRow]> = BTreeMap::new();
    for (id, history) in ObjectHistories::new(rows).iter() {
        histories.insert((history[0].branch, id), history);
    }

    let mut plan = TablePlan {
        table: table.to_string(),
        ops: Vec::new(),
        touched: BTreeSet::new(),
        skipped_dest_ids: Vec::new(),
    };

    for (dest_id, links) in links_by_dest {
        let Some(branch) = links.first().map(|link| link.branch) else {
            continue;
        };
        let Some(history) = histories.get(&(branch, *dest_id)) else {
            tracing::warn!(
                table,
                dest_id = dest_id.0,
                links = links.len(),
                "links target an object with no rows; skipping"
            );
            plan.skipped_dest_ids.push(*dest_id);
            continue;
        };

        let object_plan = plan_object_inline(history, links, reference_id)?;
        plan.ops.extend(object_plan.ops);
        plan.touched.extend(object_plan.touched);
    }

    Ok(plan)
}

/// Apply planned operations to an owned row set.
///
/// Updates mutate the addressed row's lower bound and container fields,
/// inserts append split segments; the result is re-sorted by
/// `(branch, id, rev_min)`. `rev_create` is never modified and no row is
/// ever removed.
///
/// Plan order is safe here because the owned set has no uniqueness index. A
/// store that enforces one on `(branch, id, rev_min)` must run all updates
/// before all inserts: a split row keeps its old lower bound until its update
/// lands, and that bound is reused by one of the inserted segments.
///
/// # Errors
/// Returns [`EngineError::UnknownRow`] when an update addresses a row that
/// is not present.
pub fn apply_plan(
    mut rows: Vec<VersionedRow>,
    ops: &[RowOp],
) -> Result<Vec<VersionedRow>, EngineError> {
    for op in ops {
        match op {
            RowOp::Update(update) => {
                let target = rows.iter_mut().find(|row| {
                    row.branch == update.branch
                        && row.id == update.id
                        && row.rev_max == update.rev_max
                });
                let Some(row) = target else {
                    return Err(EngineError::UnknownRow {
                        branch: update.branch,
                        id: update.id,
                        rev_max: update.rev_max,
                    });
                };
                row.rev_min = update.new_rev_min;
                row.container = update.container.clone();
            }
            RowOp::Insert(row) => rows.push(row.clone()),
        }
    }

    rows.sort_by(|lhs, rhs| {
        (lhs.branch, lhs.id, lhs.rev_min).cmp(&(rhs.branch, rhs.id, rhs.rev_min))
    });
    Ok(rows)
}

/// Boundaries that still need a consistency-index entry: planned boundaries
/// minus those the index already records for the branch/table.
#[must_use]
pub fn new_touched(
    planned: &BTreeSet<Revision>,
    existing: &BTreeSet<Revision>,
) -> BTreeSet<Revision> {
    planned.difference(existing).copied().collect()
}
