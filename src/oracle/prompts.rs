//! Prompt builders for the two oracle tasks.

use std::fmt::Write;

use crate::jobs::Job;

const ANALYSIS_INSTRUCTIONS: &str = r#"You are the coordinator of an autonomous improvement loop for the codebase below.
Study the product vision, the state report of previous iterations, and the code.
Propose the next set of small, independent, high-value jobs. Jobs in one batch run
in parallel on separate branches, so they must not edit the same lines.

Respond with a JSON array and nothing else. Each element:
{
  "id": "short-kebab-case-id, unique",
  "title": "imperative summary, under 120 characters",
  "description": "what to change and why",
  "priority": "critical" | "high" | "medium" | "low",
  "estimatedComplexity": "trivial" | "small" | "medium" | "large",
  "files": ["paths the job will likely touch"],
  "acceptanceCriteria": ["verifiable statements"],
  "context": "optional extra notes"
}

If the product fully meets its vision and nothing worthwhile remains, respond with [].
"#;

const FILE_OPS_INSTRUCTIONS: &str = r#"Do not run tools. Respond with a JSON array of file operations and nothing else:
[{"action": "write", "path": "relative/path", "content": "full new file contents"},
 {"action": "delete", "path": "relative/path"}]
Paths are relative to the repository root. Every write replaces the whole file."#;

const AUTONOMOUS_INSTRUCTIONS: &str = "Edit the files in the current repository directly. Do not commit, \
push, or switch branches; the harness does that after you finish.";

/// Codebase material included in the analysis prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum CodebaseSnapshot {
    /// Every tracked file's contents, up to a size cap.
    Full {
        files: Vec<(String, String)>,
        omitted: usize,
    },
    /// Paths only.
    Listing(Vec<String>),
}

pub struct AnalysisPrompt<'a> {
    pub iteration: u32,
    pub coordinator: &'a str,
    pub vision: &'a str,
    pub state_report: &'a str,
    pub snapshot: &'a CodebaseSnapshot,
}

pub fn analysis_prompt(input: &AnalysisPrompt<'_>) -> String {
    let mut prompt = String::new();
    if !input.coordinator.trim().is_empty() {
        prompt.push_str(input.coordinator.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str(ANALYSIS_INSTRUCTIONS);
    let _ = write!(prompt, "\n## Iteration\n{}\n", input.iteration);
    section(&mut prompt, "Product vision", input.vision);
    section(&mut prompt, "Product state", input.state_report);

    match input.snapshot {
        CodebaseSnapshot::Full { files, omitted } => {
            prompt.push_str("\n## Codebase\n");
            for (path, contents) in files {
                let _ = write!(prompt, "\n### {}\n```\n{}\n```\n", path, contents.trim_end());
            }
            if *omitted > 0 {
                let _ = writeln!(prompt, "\n({} more files omitted for size)", omitted);
            }
        }
        CodebaseSnapshot::Listing(paths) => {
            prompt.push_str("\n## Codebase (file listing)\n");
            for path in paths {
                let _ = writeln!(prompt, "- {}", path);
            }
        }
    }
    prompt
}

/// Context gathered for one job: declared file contents or a listing.
#[derive(Debug, Clone, PartialEq)]
pub enum JobContext {
    Files(Vec<(String, Option<String>)>),
    Listing(Vec<String>),
}

pub fn job_prompt(job: &Job, context: &JobContext, autonomous: bool) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Job {}: {}\n", job.id, job.title);
    if !job.description.trim().is_empty() {
        let _ = writeln!(prompt, "{}\n", job.description.trim());
    }
    if !job.acceptance_criteria.is_empty() {
        prompt.push_str("## Acceptance criteria\n");
        for criterion in &job.acceptance_criteria {
            let _ = writeln!(prompt, "- {}", criterion);
        }
        prompt.push('\n');
    }
    if !job.files.is_empty() {
        let _ = writeln!(prompt, "## Files\n{}\n", job.files.join("\n"));
    }
    if let Some(extra) = job.context.as_deref().filter(|c| !c.trim().is_empty()) {
        let _ = writeln!(prompt, "## Notes\n{}\n", extra.trim());
    }
    prompt.push_str(
        "Stay within the scope of this job. Do not refactor unrelated code or \
         address other issues you notice.\n\n",
    );

    match context {
        JobContext::Files(files) => {
            prompt.push_str("## Current contents\n");
            for (path, contents) in files {
                match contents {
                    Some(text) => {
                        let _ = write!(prompt, "\n### {}\n```\n{}\n```\n", path, text.trim_end());
                    }
                    None => {
                        let _ = writeln!(prompt, "\n### {}\n(does not exist yet)", path);
                    }
                }
            }
        }
        JobContext::Listing(paths) => {
            prompt.push_str("## Repository files\n");
            for path in paths {
                let _ = writeln!(prompt, "- {}", path);
            }
        }
    }

    prompt.push('\n');
    prompt.push_str(if autonomous {
        AUTONOMOUS_INSTRUCTIONS
    } else {
        FILE_OPS_INSTRUCTIONS
    });
    prompt.push('\n');
    prompt
}

fn section(prompt: &mut String, title: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    let _ = write!(prompt, "\n## {}\n{}\n", title, body.trim());
}
