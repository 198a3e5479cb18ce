//! Suggestion Store
//!
//! Proposals are written as pretty JSON so a human can review and edit them
//! before anything touches the database. A file is consumed once, then
//! archived.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::catalog::CatalogConnection;
use crate::error::{ClerkError, Result, ValidationError};
use crate::models::{CollectionPath, Move, Placement, Proposal, RecordKey, ReorganizationPlan};

pub const SUGGESTIONS_FILE: &str = "suggestions.json";
pub const REORGANIZATION_FILE: &str = "reorganization.json";
pub const WATCH_SUGGESTIONS_FILE: &str = "watch-suggestions.json";

#[derive(Debug, Serialize, Deserialize)]
struct SuggestionFile {
    items: Vec<SuggestionEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SuggestionEntry {
    item_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    collection_path: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MoveFile {
    moves: Vec<MoveEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MoveEntry {
    item_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    current_path: String,
    new_path: String,
    #[serde(default)]
    reasoning: String,
}

/// Decode and structurally check a suggestions document. Every problem is
/// reported at once; one bad entry rejects the whole file.
pub fn parse_proposal(text: &str, source_name: &str) -> Result<Proposal> {
    let file: SuggestionFile = serde_json::from_str(text).map_err(|e| ClerkError::Suggestions {
        source_name: source_name.to_string(),
        problems: vec![e.to_string()],
    })?;
    proposal_from_entries(file.items, source_name)
}

fn proposal_from_entries(
    entries: Vec<SuggestionEntry>,
    source_name: &str,
) -> Result<Proposal> {
    let mut problems = Vec::new();
    let mut proposal = Proposal::new();

    for (index, entry) in entries.into_iter().enumerate() {
        let label = format!("item {} ({})", index + 1, entry.item_key);
        let key = RecordKey::parse(&entry.item_key).map_err(|e| problems.push(format!("{}: {}", label, e)));
        let path = CollectionPath::parse(&entry.collection_path)
            .map_err(|e| problems.push(format!("{}: {}", label, e)));
        if entry.tags.iter().any(|t| t.trim().is_empty()) {
            problems.push(format!("{}: blank tag", label));
        }

        if let (Ok(key), Ok(path)) = (key, path) {
            if proposal.contains(&key) {
                problems.push(format!("{}: listed more than once", label));
                continue;
            }
            proposal.insert(
                key,
                Placement {
                    title: entry.title,
                    path,
                    tags: entry.tags,
                    rationale: entry.reasoning,
                },
            );
        }
    }

    if problems.is_empty() {
        Ok(proposal)
    } else {
        Err(ClerkError::Suggestions {
            source_name: source_name.to_string(),
            problems,
        })
    }
}

pub fn render_proposal(proposal: &Proposal) -> Result<String> {
    let file = SuggestionFile {
        items: proposal
            .iter()
            .map(|(key, p)| SuggestionEntry {
                item_key: key.to_string(),
                title: p.title.clone(),
                collection_path: p.path.to_string(),
                tags: p.tags.clone(),
                reasoning: p.rationale.clone(),
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&file)?)
}

pub fn parse_plan(text: &str, source_name: &str) -> Result<ReorganizationPlan> {
    let file: MoveFile = serde_json::from_str(text).map_err(|e| ClerkError::Suggestions {
        source_name: source_name.to_string(),
        problems: vec![e.to_string()],
    })?;

    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    let mut plan = ReorganizationPlan::default();

    for (index, entry) in file.moves.into_iter().enumerate() {
        let label = format!("move {} ({})", index + 1, entry.item_key);
        let key = RecordKey::parse(&entry.item_key).map_err(|e| problems.push(format!("{}: {}", label, e)));
        let current = CollectionPath::parse(&entry.current_path)
            .map_err(|e| problems.push(format!("{}: current_path: {}", label, e)));
        let target = CollectionPath::parse(&entry.new_path)
            .map_err(|e| problems.push(format!("{}: new_path: {}", label, e)));

        if let (Ok(key), Ok(current), Ok(target)) = (key, current, target) {
            if !seen.insert(key.clone()) {
                problems.push(format!("{}: listed more than once", label));
                continue;
            }
            plan.moves.push(Move {
                key,
                title: entry.title,
                current,
                target,
                rationale: entry.reasoning,
            });
        }
    }

    if problems.is_empty() {
        Ok(plan)
    } else {
        Err(ClerkError::Suggestions {
            source_name: source_name.to_string(),
            problems,
        })
    }
}

pub fn render_plan(plan: &ReorganizationPlan) -> Result<String> {
    let file = MoveFile {
        moves: plan
            .moves
            .iter()
            .map(|m| MoveEntry {
                item_key: m.key.to_string(),
                title: m.title.clone(),
                current_path: m.current.to_string(),
                new_path: m.target.to_string(),
                reasoning: m.rationale.clone(),
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&file)?)
}

/// Check a loaded proposal against the live library. Issues are reported
/// only; the engine records the same failures when it applies.
pub fn revalidate(
    conn: &CatalogConnection,
    proposal: &Proposal,
) -> Result<Vec<(RecordKey, ValidationError)>> {
    let mut issues = Vec::new();
    for (key, _) in proposal.iter() {
        match conn.record(key)? {
            None => issues.push((key.clone(), ValidationError::RecordNotFound)),
            Some(record) if !record.is_categorizable() => {
                issues.push((key.clone(), ValidationError::RecordIsAttachment))
            }
            Some(_) => {}
        }
    }
    Ok(issues)
}

pub fn revalidate_plan(
    conn: &CatalogConnection,
    plan: &ReorganizationPlan,
) -> Result<Vec<(RecordKey, ValidationError)>> {
    let tree = conn.collections()?;
    let mut issues = Vec::new();
    for mv in &plan.moves {
        match conn.record(&mv.key)? {
            None => issues.push((mv.key.clone(), ValidationError::RecordNotFound)),
            Some(record) if !record.is_categorizable() => {
                issues.push((mv.key.clone(), ValidationError::RecordIsAttachment))
            }
            Some(_) if tree.find(&mv.current).is_none() => issues.push((
                mv.key.clone(),
                ValidationError::CurrentCollectionMissing(mv.current.to_string()),
            )),
            Some(_) => {}
        }
    }
    Ok(issues)
}

/// Owns the suggestion files in the output directory.
#[derive(Debug, Clone)]
pub struct SuggestionStore {
    dir: PathBuf,
}

impl SuggestionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn save_proposal(&self, name: &str, proposal: &Proposal) -> Result<PathBuf> {
        let path = self.file(name);
        write_atomic(&path, &render_proposal(proposal)?)?;
        info!("Saved {} suggestion(s) to {}", proposal.len(), path.display());
        Ok(path)
    }

    pub fn load_proposal(&self, path: &Path) -> Result<Proposal> {
        let text = fs::read_to_string(path)?;
        parse_proposal(&text, &path.display().to_string())
    }

    pub fn save_plan(&self, name: &str, plan: &ReorganizationPlan) -> Result<PathBuf> {
        let path = self.file(name);
        write_atomic(&path, &render_plan(plan)?)?;
        info!("Saved {} move(s) to {}", plan.len(), path.display());
        Ok(path)
    }

    pub fn load_plan(&self, path: &Path) -> Result<ReorganizationPlan> {
        let text = fs::read_to_string(path)?;
        parse_plan(&text, &path.display().to_string())
    }

    /// Rename a consumed file to `<stem>.applied-YYYYMMDD_HHMMSS.json`.
    pub fn archive(&self, path: &Path) -> Result<PathBuf> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("suggestions");
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let stamp = Local::now().format("%Y%m%d_%H%M%S");

        let mut target = parent.join(format!("{}.applied-{}.json", stem, stamp));
        let mut n = 1;
        while target.exists() {
            target = parent.join(format!("{}.applied-{}_{}.json", stem, stamp, n));
            n += 1;
        }

        fs::rename(path, &target)?;
        info!("Archived {} as {}", path.display(), target.display());
        Ok(target)
    }

    /// Remove a stale file. Returns whether one existed.
    pub fn discard(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Discarded stale {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write through a temp file in the same directory, then rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
