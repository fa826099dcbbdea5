//! File-operation replies: the constrained execution mode.
//!
//! Instead of editing the checkout itself, the agent answers with a JSON
//! list of whole-file writes and deletions. Every path is validated before
//! anything is touched, so a bad entry leaves the checkout unchanged.

use serde::Deserialize;

use crate::sandbox::{Environment, checked_relative};
use crate::util::extract_json_array;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FileOp {
    Write { path: String, content: String },
    Delete { path: String },
}

impl FileOp {
    pub fn path(&self) -> &str {
        match self {
            FileOp::Write { path, .. } | FileOp::Delete { path } => path,
        }
    }
}

pub fn parse_file_ops(reply: &str) -> Result<Vec<FileOp>, String> {
    let array = extract_json_array(reply).ok_or("no JSON array of file operations in reply")?;
    let ops: Vec<FileOp> =
        serde_json::from_str(array).map_err(|e| format!("invalid file operations: {}", e))?;
    if ops.is_empty() {
        return Err("reply contained no file operations".into());
    }
    for op in &ops {
        checked_relative(op.path()).map_err(|e| e.to_string())?;
    }
    Ok(ops)
}

/// Apply validated operations in order. Returns how many were applied.
pub async fn apply_file_ops(env: &dyn Environment, ops: &[FileOp]) -> Result<usize, String> {
    for op in ops {
        let result = match op {
            FileOp::Write { path, content } => env.write_file(path, content).await,
            FileOp::Delete { path } => env.remove_file(path).await,
        };
        result.map_err(|e| format!("{}: {}", op.path(), e))?;
    }
    Ok(ops.len())
}
