//! Structural Mutation Engine
//!
//! Turns a [`Proposal`] (or a [`ReorganizationPlan`]) into collection and
//! tag writes. Rule violations are collected per record; only infrastructure
//! errors abort the transaction.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backup::BackupManager;
use crate::catalog::{Catalog, CatalogConnection, CatalogWriter};
use crate::error::{ClerkError, Result, ValidationError};
use crate::models::{
    Collection, CollectionPath, CollectionTree, Placement, Proposal, Record, RecordKey,
    ReorganizationPlan,
};

/// Structural rules applied to every proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub max_depth: usize,
    pub min_tags: usize,
    pub max_tags: usize,
    /// Members a new subcollection needs in the batch that creates it.
    pub min_new_collection_support: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_tags: 2,
            max_tags: 5,
            min_new_collection_support: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Applied {
        path: CollectionPath,
        tags: Vec<String>,
        /// `false` if the record was already in the collection
        newly_linked: bool,
    },
    Rejected(ValidationError),
}

impl RecordOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RecordOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub outcomes: BTreeMap<RecordKey, RecordOutcome>,
    pub created_collections: Vec<CollectionPath>,
    pub backup: Option<PathBuf>,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_applied()).count()
    }

    pub fn rejected(&self) -> impl Iterator<Item = (&RecordKey, &ValidationError)> {
        self.outcomes.iter().filter_map(|(k, o)| match o {
            RecordOutcome::Rejected(e) => Some((k, e)),
            RecordOutcome::Applied { .. } => None,
        })
    }

    pub fn outcome(&self, key: &RecordKey) -> Option<&RecordOutcome> {
        self.outcomes.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved {
        from: CollectionPath,
        to: CollectionPath,
    },
    Rejected(ValidationError),
}

#[derive(Debug, Clone, Default)]
pub struct MoveReport {
    pub outcomes: Vec<(RecordKey, MoveOutcome)>,
    pub created_collections: Vec<CollectionPath>,
    pub backup: Option<PathBuf>,
}

impl MoveReport {
    pub fn moved(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, MoveOutcome::Moved { .. }))
            .count()
    }
}

/// One group of same-named siblings folded into its oldest member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedGroup {
    pub path: String,
    pub kept_id: i64,
    pub removed_ids: Vec<i64>,
    pub moved_items: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub groups: Vec<MergedGroup>,
    pub backup: Option<PathBuf>,
}

pub struct StructureEngine {
    policy: Policy,
}

impl StructureEngine {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Full write session for a proposal. An empty proposal opens nothing
    /// and creates no backup.
    pub fn apply_session(
        &self,
        catalog: &Catalog,
        backups: &BackupManager,
        proposal: &Proposal,
    ) -> Result<ApplyReport> {
        if proposal.is_empty() {
            info!("Empty proposal, nothing to apply");
            return Ok(ApplyReport::default());
        }
        let mut conn = catalog.open_write(backups)?;
        self.apply(&mut conn, proposal)
    }

    /// Apply `proposal` in one transaction on an open write connection.
    pub fn apply(&self, conn: &mut CatalogConnection, proposal: &Proposal) -> Result<ApplyReport> {
        if proposal.is_empty() {
            return Ok(ApplyReport::default());
        }
        let mut report = conn.with_transaction(|tx| self.apply_in(tx, proposal))?;
        report.backup = conn.backup_path().map(Path::to_path_buf);
        info!(
            "Applied {} of {} placement(s), {} new collection(s)",
            report.applied(),
            proposal.len(),
            report.created_collections.len()
        );
        Ok(report)
    }

    /// The mutation itself, against any writer already inside a transaction.
    pub fn apply_in<W: CatalogWriter + ?Sized>(
        &self,
        writer: &W,
        proposal: &Proposal,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        let mut tree = writer.hierarchy()?;

        // stable order so collisions resolve the same way every time
        let mut ordered: Vec<(&RecordKey, &Placement)> = proposal.iter().collect();
        ordered.sort_by(|a, b| a.1.path.folded().cmp(&b.1.path.folded()).then(a.0.cmp(b.0)));

        let mut accepted: Vec<(&RecordKey, Record, &CollectionPath, Vec<String>)> = Vec::new();
        for (key, placement) in ordered {
            match self.check_placement(writer, key, placement)? {
                Ok((record, tags)) => accepted.push((key, record, &placement.path, tags)),
                Err(reason) => {
                    debug!("Rejected {}: {}", key, reason);
                    report.outcomes.insert(key.clone(), RecordOutcome::Rejected(reason));
                }
            }
        }

        let mut support: HashMap<Vec<String>, usize> = HashMap::new();
        for (_, _, path, _) in &accepted {
            *support.entry(path.folded()).or_default() += 1;
        }

        for (key, record, path, tags) in accepted {
            if let Err(reason) = self.check_support(&tree, path, &support) {
                debug!("Rejected {}: {}", key, reason);
                report.outcomes.insert(key.clone(), RecordOutcome::Rejected(reason));
                continue;
            }

            let (leaf, realized) =
                realize_path(writer, &mut tree, path, &mut report.created_collections)?;
            let newly_linked = writer.link_record(&record, leaf)?;
            writer.add_tags(&record, &new_tags(&record, &tags))?;

            report.outcomes.insert(
                key.clone(),
                RecordOutcome::Applied {
                    path: realized,
                    tags,
                    newly_linked,
                },
            );
        }

        Ok(report)
    }

    /// Per-record rules that do not depend on the rest of the batch.
    fn check_placement<W: CatalogWriter + ?Sized>(
        &self,
        writer: &W,
        key: &RecordKey,
        placement: &Placement,
    ) -> Result<std::result::Result<(Record, Vec<String>), ValidationError>> {
        let Some(record) = writer.record(key)? else {
            return Ok(Err(ValidationError::RecordNotFound));
        };
        if !record.is_categorizable() {
            return Ok(Err(ValidationError::RecordIsAttachment));
        }
        if let Err(reason) = self.check_depth(&placement.path) {
            return Ok(Err(reason));
        }

        // the proposal must stand on its own, and the record must stay
        // within bounds once its existing tags are counted too
        let tags = normalize_tags(&placement.tags);
        let resulting = normalize_tags(&record.tags).len() + new_tags(&record, &tags).len();
        for count in [tags.len(), resulting] {
            if count < self.policy.min_tags || count > self.policy.max_tags {
                return Ok(Err(ValidationError::TagCountInvalid {
                    count,
                    min: self.policy.min_tags,
                    max: self.policy.max_tags,
                }));
            }
        }

        Ok(Ok((record, tags)))
    }

    fn check_depth(&self, path: &CollectionPath) -> std::result::Result<(), ValidationError> {
        if path.depth() > self.policy.max_depth {
            return Err(ValidationError::DepthExceeded {
                path: path.to_string(),
                depth: path.depth(),
                max: self.policy.max_depth,
            });
        }
        Ok(())
    }

    /// A leaf that does not exist yet and sits below the top level needs
    /// enough members in this batch. Reusing an existing leaf is always fine.
    fn check_support(
        &self,
        tree: &CollectionTree,
        path: &CollectionPath,
        support: &HashMap<Vec<String>, usize>,
    ) -> std::result::Result<(), ValidationError> {
        if path.depth() < 2 || tree.find(path).is_some() {
            return Ok(());
        }
        let count = support.get(&path.folded()).copied().unwrap_or(0);
        if count < self.policy.min_new_collection_support {
            return Err(ValidationError::InsufficientSupport {
                path: path.to_string(),
                support: count,
                required: self.policy.min_new_collection_support,
            });
        }
        Ok(())
    }

    pub fn reorganize_session(
        &self,
        catalog: &Catalog,
        backups: &BackupManager,
        plan: &ReorganizationPlan,
    ) -> Result<MoveReport> {
        if plan.is_empty() {
            info!("Empty reorganization plan, nothing to apply");
            return Ok(MoveReport::default());
        }
        let mut conn = catalog.open_write(backups)?;
        let mut report = conn.with_transaction(|tx| self.reorganize_in(tx, plan))?;
        report.backup = conn.backup_path().map(Path::to_path_buf);
        info!("Moved {} of {} record(s)", report.moved(), plan.len());
        Ok(report)
    }

    /// Move filed records. Link to the new leaf and unlink from the old one
    /// happen in the same step; no support minimum applies.
    pub fn reorganize_in<W: CatalogWriter + ?Sized>(
        &self,
        writer: &W,
        plan: &ReorganizationPlan,
    ) -> Result<MoveReport> {
        let mut report = MoveReport::default();
        let mut tree = writer.hierarchy()?;

        let mut ordered: Vec<_> = plan.moves.iter().collect();
        ordered.sort_by(|a, b| a.target.folded().cmp(&b.target.folded()).then(a.key.cmp(&b.key)));

        for mv in ordered {
            let record = match writer.record(&mv.key)? {
                Some(r) if r.is_categorizable() => r,
                Some(_) => {
                    report
                        .outcomes
                        .push((mv.key.clone(), MoveOutcome::Rejected(ValidationError::RecordIsAttachment)));
                    continue;
                }
                None => {
                    report
                        .outcomes
                        .push((mv.key.clone(), MoveOutcome::Rejected(ValidationError::RecordNotFound)));
                    continue;
                }
            };

            if let Err(reason) = self.check_depth(&mv.target) {
                report.outcomes.push((mv.key.clone(), MoveOutcome::Rejected(reason)));
                continue;
            }

            let Some(current) = tree.find(&mv.current).map(|c| c.id) else {
                report.outcomes.push((
                    mv.key.clone(),
                    MoveOutcome::Rejected(ValidationError::CurrentCollectionMissing(
                        mv.current.to_string(),
                    )),
                ));
                continue;
            };
            let from = tree.path_of(current).unwrap_or_else(|| mv.current.clone());

            if !writer.membership(&record)?.contains(&current) {
                warn!("{} is not in {}; linking to the new collection only", mv.key, from);
            }

            let (target, to) =
                realize_path(writer, &mut tree, &mv.target, &mut report.created_collections)?;
            if target != current {
                writer.link_record(&record, target)?;
                writer.unlink_record(&record, current)?;
            }

            report.outcomes.push((mv.key.clone(), MoveOutcome::Moved { from, to }));
        }

        Ok(report)
    }

    /// Merge case-insensitive sibling duplicates in one write session.
    /// Opens nothing for writing when the tree has no duplicates.
    pub fn merge_duplicates_session(
        &self,
        catalog: &Catalog,
        backups: &BackupManager,
    ) -> Result<MergeReport> {
        let tree = catalog.open_read_only()?.collections()?;
        if find_duplicates(&tree).is_empty() {
            info!("No duplicate collections found");
            return Ok(MergeReport::default());
        }

        let mut conn = catalog.open_write(backups)?;
        let mut report = conn.with_transaction(|tx| self.merge_duplicates_in(tx))?;
        report.backup = conn.backup_path().map(Path::to_path_buf);
        Ok(report)
    }

    /// Repeats until no collision remains, since re-parenting children
    /// can expose new duplicates one level down.
    pub fn merge_duplicates_in<W: CatalogWriter + ?Sized>(&self, writer: &W) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        loop {
            let tree = writer.hierarchy()?;
            let groups = find_duplicates(&tree);
            if groups.is_empty() {
                break;
            }

            for group in groups {
                let keeper = &group[0];
                let path = tree
                    .path_of(keeper.id)
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| keeper.name.clone());

                let mut merged = MergedGroup {
                    path,
                    kept_id: keeper.id,
                    removed_ids: Vec::new(),
                    moved_items: 0,
                };
                for dup in &group[1..] {
                    merged.moved_items += writer.move_members(dup.id, keeper.id)?;
                    writer.reparent_children(dup.id, keeper.id)?;
                    writer.delete_collection(dup.id)?;
                    merged.removed_ids.push(dup.id);
                }

                info!(
                    "Merged {} duplicate(s) of {} into collection {}",
                    merged.removed_ids.len(),
                    merged.path,
                    merged.kept_id
                );
                report.groups.push(merged);
            }
        }

        Ok(report)
    }
}

/// Walk `path` root to leaf, reusing siblings case-insensitively and creating
/// whatever is missing. Returns the leaf id and the path as actually named.
fn realize_path<W: CatalogWriter + ?Sized>(
    writer: &W,
    tree: &mut CollectionTree,
    path: &CollectionPath,
    created: &mut Vec<CollectionPath>,
) -> Result<(i64, CollectionPath)> {
    let mut parent: Option<i64> = None;
    let mut names = Vec::with_capacity(path.depth());

    for segment in path.segments() {
        let node = match tree.find_child(parent, segment) {
            Some(existing) => existing.clone(),
            None => {
                let node = writer.create_collection(segment, parent)?;
                tree.insert(node.clone());
                let mut new_path = names.clone();
                new_path.push(node.name.clone());
                let new_path = CollectionPath::from_names(new_path);
                info!("Created collection {}", new_path);
                created.push(new_path);
                node
            }
        };
        names.push(node.name.clone());
        parent = Some(node.id);
    }

    let leaf = parent.ok_or_else(|| ClerkError::InvalidPath(path.to_string()))?;
    Ok((leaf, CollectionPath::from_names(names)))
}

/// Groups of siblings whose names collide case-insensitively, oldest id first
/// within each group.
pub fn find_duplicates(tree: &CollectionTree) -> Vec<Vec<Collection>> {
    let mut groups: BTreeMap<(Option<i64>, String), Vec<Collection>> = BTreeMap::new();
    for collection in tree.iter() {
        let parent = collection.parent_id.filter(|p| tree.get(*p).is_some());
        groups
            .entry((parent, collection.name.trim().to_lowercase()))
            .or_default()
            .push(collection.clone());
    }

    groups
        .into_values()
        .filter(|g| g.len() > 1)
        .map(|mut g| {
            g.sort_by_key(|c| c.id);
            g
        })
        .collect()
}

/// Trim, drop blanks and collapse case-insensitive repeats (first spelling wins).
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Tags the record does not carry yet, compared case-insensitively.
fn new_tags(record: &Record, tags: &[String]) -> Vec<String> {
    let existing: HashSet<String> = record.tags.iter().map(|t| t.trim().to_lowercase()).collect();
    tags.iter()
        .filter(|t| !existing.contains(&t.to_lowercase()))
        .cloned()
        .collect()
}
