//! Locate the produced media file in a history record.
//!
//! Output nodes report their files in a few different shapes (see
//! [`OutputShape`]). Shapes are tried in precedence order; within a shape,
//! nodes are tried in the record's order, and the first usable entry wins.

use std::path::{Path, PathBuf};

use vidgen_core::binding::OutputShape;

use crate::history::ResultRecord;

/// The media file a submission produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
}

/// Find the artifact in `record`.
///
/// `output_dir` is the engine's output directory, used for shapes that
/// only report a file name. Returns `None` when no node matches any of
/// `shapes`; the execution itself still succeeded.
pub fn resolve(record: &ResultRecord, shapes: &[OutputShape], output_dir: &Path) -> Option<Artifact> {
    for shape in shapes {
        for (node_id, output) in &record.outputs {
            let Some(first) = output
                .get(shape.key())
                .and_then(|v| v.as_array())
                .and_then(|list| list.first())
            else {
                continue;
            };

            if let Some(path) = entry_path(*shape, first, output_dir) {
                tracing::info!(
                    prompt_id = %record.prompt_id,
                    node = %node_id,
                    shape = shape.key(),
                    path = %path.display(),
                    "Resolved output artifact",
                );
                return Some(Artifact { path });
            }
        }
    }

    tracing::warn!(
        prompt_id = %record.prompt_id,
        nodes = record.outputs.len(),
        "No output node matched a known artifact shape",
    );
    None
}

fn entry_path(shape: OutputShape, entry: &serde_json::Value, output_dir: &Path) -> Option<PathBuf> {
    match shape {
        OutputShape::AnimatedImages => non_empty_str(entry.get("fullpath")).map(PathBuf::from),
        OutputShape::Videos => non_empty_str(entry.get("fullpath"))
            .map(PathBuf::from)
            .or_else(|| joined(entry, output_dir)),
        OutputShape::Filenames => match entry.as_str() {
            Some(name) if !name.is_empty() => Some(output_dir.join(name)),
            Some(_) => None,
            None => joined(entry, output_dir),
        },
    }
}

/// `output_dir[/subfolder]/filename` from an `{filename, subfolder?}` entry.
fn joined(entry: &serde_json::Value, output_dir: &Path) -> Option<PathBuf> {
    let filename = non_empty_str(entry.get("filename"))?;
    let mut path = output_dir.to_path_buf();
    if let Some(subfolder) = non_empty_str(entry.get("subfolder")) {
        path.push(subfolder);
    }
    path.push(filename);
    Some(path)
}

fn non_empty_str(value: Option<&serde_json::Value>) -> Option<&str> {
    value.and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}
