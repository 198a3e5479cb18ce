//! Decision Provider
//!
//! Whatever decides where records belong. The engine never depends on how a
//! proposal was produced; tests pass plain closures.

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::engine::Policy;
use crate::error::{ClerkError, Result};
use crate::models::{CollectionTree, FiledRecord, Proposal, Record, RecordKey, ReorganizationPlan};
use crate::suggestions::{parse_plan, parse_proposal};

pub trait DecisionProvider {
    /// Propose a placement and tag set for each of `records`.
    fn propose(&self, records: &[Record], hierarchy: &CollectionTree) -> Result<Proposal>;

    /// Propose moves for records that are already filed.
    fn propose_moves(
        &self,
        _records: &[FiledRecord],
        _hierarchy: &CollectionTree,
    ) -> Result<ReorganizationPlan> {
        Err(ClerkError::Provider(
            "this provider does not support reorganization".to_string(),
        ))
    }
}

impl<F> DecisionProvider for F
where
    F: Fn(&[Record], &CollectionTree) -> Result<Proposal>,
{
    fn propose(&self, records: &[Record], hierarchy: &CollectionTree) -> Result<Proposal> {
        self(records, hierarchy)
    }
}

/// Runs an external agent CLI: prompt on stdin, answer on stdout.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    command: String,
    args: Vec<String>,
    model: Option<String>,
    policy: Policy,
}

#[derive(Serialize)]
struct PromptRecord<'a> {
    item_key: &'a str,
    title: &'a str,
    item_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    abstract_note: Option<&'a str>,
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    collections: Option<Vec<String>>,
}

impl CommandProvider {
    pub fn new(command: impl Into<String>, args: Vec<String>, model: Option<String>, policy: Policy) -> Self {
        Self {
            command: command.into(),
            args,
            model,
            policy,
        }
    }

    fn resolve(&self) -> Result<PathBuf> {
        which::which(&self.command).map_err(|_| {
            ClerkError::Provider(format!("agent command '{}' not found in PATH", self.command))
        })
    }

    fn run(&self, prompt: &str) -> Result<String> {
        let program = self.resolve()?;
        let mut cmd = Command::new(&program);
        cmd.args(&self.args);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }

        debug!("Running {} ({} byte prompt)", program.display(), prompt.len());
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ClerkError::Provider(format!("failed to start {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .map_err(|e| ClerkError::Provider(format!("failed to send prompt: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ClerkError::Provider(format!("agent did not finish: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClerkError::Provider(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn rules(&self) -> String {
        format!(
            "Rules:\n\
             - A collection path has at most {depth} levels, separated by '/'.\n\
             - Reuse existing collections whenever one fits; match their names exactly.\n\
             - A new subcollection needs at least {support} items from this batch, otherwise use its parent.\n\
             - Give every item between {min} and {max} short, lowercase tags.\n",
            depth = self.policy.max_depth,
            support = self.policy.min_new_collection_support,
            min = self.policy.min_tags,
            max = self.policy.max_tags,
        )
    }

    pub fn build_prompt(&self, records: &[Record], hierarchy: &CollectionTree) -> Result<String> {
        let items: Vec<PromptRecord<'_>> = records
            .iter()
            .map(|r| PromptRecord {
                item_key: r.key.as_str(),
                title: &r.title,
                item_type: &r.item_type,
                abstract_note: r.abstract_note.as_deref(),
                tags: &r.tags,
                collections: None,
            })
            .collect();

        Ok(format!(
            "You are organizing a research library into a collection hierarchy.\n\n\
             {rules}\n\
             Existing collections:\n{tree}\n\n\
             Items to file:\n```json\n{items}\n```\n\n\
             Answer with a single ```json block of the form\n\
             {{\"items\": [{{\"item_key\": \"...\", \"title\": \"...\", \"collection_path\": \"A/B\", \
             \"tags\": [\"...\"], \"reasoning\": \"...\"}}]}}\n\
             with exactly one entry per item.\n",
            rules = self.rules(),
            tree = render_tree(hierarchy),
            items = serde_json::to_string_pretty(&items)?,
        ))
    }

    pub fn build_moves_prompt(&self, records: &[FiledRecord], hierarchy: &CollectionTree) -> Result<String> {
        let items: Vec<PromptRecord<'_>> = records
            .iter()
            .map(|f| PromptRecord {
                item_key: f.record.key.as_str(),
                title: &f.record.title,
                item_type: &f.record.item_type,
                abstract_note: f.record.abstract_note.as_deref(),
                tags: &f.record.tags,
                collections: Some(f.collections.iter().map(|p| p.to_string()).collect()),
            })
            .collect();

        Ok(format!(
            "You are reviewing how a research library is filed.\n\n\
             {rules}\n\
             Existing collections:\n{tree}\n\n\
             Filed items:\n```json\n{items}\n```\n\n\
             Suggest moves only for items that clearly belong elsewhere. Answer with a single \
             ```json block of the form\n\
             {{\"moves\": [{{\"item_key\": \"...\", \"title\": \"...\", \"current_path\": \"A\", \
             \"new_path\": \"B/C\", \"reasoning\": \"...\"}}]}}\n",
            rules = self.rules(),
            tree = render_tree(hierarchy),
            items = serde_json::to_string_pretty(&items)?,
        ))
    }
}

impl DecisionProvider for CommandProvider {
    fn propose(&self, records: &[Record], hierarchy: &CollectionTree) -> Result<Proposal> {
        if records.is_empty() {
            return Ok(Proposal::new());
        }

        let output = self.run(&self.build_prompt(records, hierarchy)?)?;
        let json = extract_json_block(&output)
            .ok_or_else(|| ClerkError::Provider("no JSON block in agent output".to_string()))?;
        let mut proposal = parse_proposal(json, "agent output")?;

        let requested: HashSet<RecordKey> = records.iter().map(|r| r.key.clone()).collect();
        let dropped = proposal.retain_records(&requested);
        if dropped > 0 {
            warn!("Ignored {} suggestion(s) for items that were not requested", dropped);
        }
        let missing = requested.len() - proposal.len();
        if missing > 0 {
            warn!("Agent left {} item(s) without a suggestion", missing);
        }

        info!("Agent proposed placements for {} item(s)", proposal.len());
        Ok(proposal)
    }

    fn propose_moves(
        &self,
        records: &[FiledRecord],
        hierarchy: &CollectionTree,
    ) -> Result<ReorganizationPlan> {
        if records.is_empty() {
            return Ok(ReorganizationPlan::default());
        }

        let output = self.run(&self.build_moves_prompt(records, hierarchy)?)?;
        let json = extract_json_block(&output)
            .ok_or_else(|| ClerkError::Provider("no JSON block in agent output".to_string()))?;
        let mut plan = parse_plan(json, "agent output")?;

        let requested: HashSet<&RecordKey> = records.iter().map(|f| &f.record.key).collect();
        plan.moves.retain(|m| requested.contains(&m.key));
        info!("Agent proposed {} move(s)", plan.len());
        Ok(plan)
    }
}

/// First fenced ```json block, or the whole text if it is a bare object.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let fenced = Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").ok()?;
    if let Some(m) = fenced.captures(text).and_then(|c| c.get(1)) {
        return Some(m.as_str());
    }

    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        Some(trimmed)
    } else {
        None
    }
}

/// One path per line, or a placeholder for an empty library.
fn render_tree(tree: &CollectionTree) -> String {
    let paths = tree.paths();
    if paths.is_empty() {
        return "(none yet)".to_string();
    }
    paths
        .iter()
        .map(|(path, _)| format!("- {}", path))
        .collect::<Vec<_>>()
        .join("\n")
}
