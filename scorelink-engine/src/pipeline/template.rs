//! Command and path templates
//!
//! Stage commands, inputs and outputs are configured as strings with
//! `{placeholder}` markers:
//!
//! | placeholder | value |
//! |---|---|
//! | `{snapshot}` | frozen registry snapshot file |
//! | `{output_dir}` | run output directory |
//! | `{stage_dir}` | `<output_dir>/<stage>` |
//! | `{stage}` | stage name |
//! | `{manifest}` | manifest file |
//! | `{input:<stage>}` | `<output_dir>/<stage>` of an upstream stage |
//! | `{id}` | entry id (hyphenated) |
//! | `{short_id}` | first 8 hex characters of the id |
//! | `{onset}` / `{offset}` | computed timing in seconds |
//! | `{midi}` | MIDI note number of the score note |
//!
//! The last five are entry placeholders. `{{` and `}}` produce literal braces.

use crate::registry::UniversalEntry;
use scorelink_common::EntryId;
use std::path::{Path, PathBuf};

/// Placeholders that require an entry
pub const ENTRY_PLACEHOLDERS: &[&str] = &["id", "short_id", "onset", "offset", "midi"];

const RUN_PLACEHOLDERS: &[&str] = &["snapshot", "output_dir", "stage_dir", "stage", "manifest"];

const INPUT_PREFIX: &str = "input:";

#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut rest = template;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("{{") {
            segments.push(Segment::Brace('{'));
            rest = after;
        } else if let Some(after) = rest.strip_prefix("}}") {
            segments.push(Segment::Brace('}'));
            rest = after;
        } else if let Some(after) = rest.strip_prefix('{') {
            let end = after
                .find('}')
                .ok_or_else(|| format!("unterminated placeholder in '{}'", template))?;
            segments.push(Segment::Placeholder(&after[..end]));
            rest = &after[end + 1..];
        } else if rest.starts_with('}') {
            return Err(format!("unmatched '}}' in '{}'", template));
        } else {
            let end = rest.find(['{', '}']).unwrap_or(rest.len());
            segments.push(Segment::Literal(&rest[..end]));
            rest = &rest[end..];
        }
    }
    Ok(segments)
}

/// Check placeholder names without expanding
///
/// `allow_entry` is false for batch-scope commands. `{input:<stage>}` must
/// name one of `stages`.
pub fn validate(template: &str, allow_entry: bool, stages: &[&str]) -> Result<(), String> {
    for segment in parse(template)? {
        let Segment::Placeholder(name) = segment else {
            continue;
        };
        if let Some(stage) = name.strip_prefix(INPUT_PREFIX) {
            if !stages.contains(&stage) {
                return Err(format!("'{}' refers to unknown stage '{}'", template, stage));
            }
        } else if ENTRY_PLACEHOLDERS.contains(&name) {
            if !allow_entry {
                return Err(format!(
                    "'{}' uses entry placeholder {{{}}} in a batch command",
                    template, name
                ));
            }
        } else if !RUN_PLACEHOLDERS.contains(&name) {
            return Err(format!("'{}' uses unknown placeholder {{{}}}", template, name));
        }
    }
    Ok(())
}

/// Whether `template` expands differently per entry
pub fn uses_entry_placeholders(template: &str) -> bool {
    parse(template)
        .map(|segments| {
            segments.iter().any(|s| matches!(s, Segment::Placeholder(name) if ENTRY_PLACEHOLDERS.contains(name)))
        })
        .unwrap_or(false)
}

/// Run-wide values
#[derive(Debug, Clone)]
pub struct RunContext {
    pub snapshot: PathBuf,
    pub output_dir: PathBuf,
    pub manifest: PathBuf,
}

impl RunContext {
    pub fn stage_dir(&self, stage: &str) -> PathBuf {
        self.output_dir.join(stage)
    }
}

/// Per-entry values
#[derive(Debug, Clone, PartialEq)]
pub struct EntryVars {
    pub id: EntryId,
    pub onset: f64,
    pub offset: f64,
    pub midi: Option<u8>,
}

impl EntryVars {
    pub fn from_entry(entry: &UniversalEntry) -> Self {
        Self {
            id: entry.id,
            onset: entry.computed_onset,
            offset: entry.computed_offset,
            midi: entry.score_note.midi_pitch().ok(),
        }
    }
}

/// Expand `template` for `stage`
pub fn expand(
    template: &str,
    run: &RunContext,
    stage: &str,
    entry: Option<&EntryVars>,
) -> Result<String, String> {
    let mut out = String::with_capacity(template.len() + 32);

    for segment in parse(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Brace(c) => out.push(c),
            Segment::Placeholder(name) => {
                let value = if let Some(input) = name.strip_prefix(INPUT_PREFIX) {
                    path_string(&run.stage_dir(input))
                } else {
                    match name {
                        "snapshot" => path_string(&run.snapshot),
                        "output_dir" => path_string(&run.output_dir),
                        "stage_dir" => path_string(&run.stage_dir(stage)),
                        "stage" => stage.to_string(),
                        "manifest" => path_string(&run.manifest),
                        _ if ENTRY_PLACEHOLDERS.contains(&name) => {
                            let entry = entry.ok_or_else(|| {
                                format!("{{{}}} used without an entry in '{}'", name, template)
                            })?;
                            entry_value(name, entry)?
                        }
                        other => return Err(format!("unknown placeholder {{{}}}", other)),
                    }
                };
                out.push_str(&value);
            }
        }
    }
    Ok(out)
}

fn entry_value(name: &str, entry: &EntryVars) -> Result<String, String> {
    Ok(match name {
        "id" => entry.id.to_string(),
        "short_id" => entry.id.short(),
        "onset" => format!("{:.6}", entry.onset),
        "offset" => format!("{:.6}", entry.offset),
        "midi" => entry
            .midi
            .ok_or_else(|| format!("entry {} has no MIDI pitch", entry.id))?
            .to_string(),
        other => return Err(format!("unknown placeholder {{{}}}", other)),
    })
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
