//! Output filtering and truncation
//!
//! Pure transforms applied to raw command output before it is recorded.

use serde::{Deserialize, Serialize};

/// Default maximum number of output lines kept per run
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 500;

/// Effective filter rules for one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRules {
    /// Lines containing any of these substrings are dropped
    pub line_exclusions: Vec<String>,
    /// Output containing any of these substrings is flagged as filtered
    pub output_exclusions: Vec<String>,
    /// Maximum number of lines kept
    pub max_lines: usize,
}

impl Default for OutputRules {
    fn default() -> Self {
        Self {
            line_exclusions: Vec::new(),
            output_exclusions: Vec::new(),
            max_lines: DEFAULT_MAX_OUTPUT_LINES,
        }
    }
}

/// Output after the pipeline ran
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedOutput {
    pub text: String,
    pub is_filtered: bool,
    pub is_truncated: bool,
    /// Line count after line filtering, before truncation
    pub original_line_count: usize,
}

/// Drop every line containing one of `exclusions`
pub fn apply_line_filters(text: &str, exclusions: &[String]) -> String {
    if exclusions.is_empty() {
        return text.to_string();
    }

    text.lines()
        .filter(|line| !exclusions.iter().any(|excl| line.contains(excl.as_str())))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether the output contains any output-level exclusion
pub fn check_output_filtered(text: &str, output_exclusions: &[String]) -> bool {
    output_exclusions
        .iter()
        .any(|excl| text.contains(excl.as_str()))
}

/// Keep the first `max_lines` lines
///
/// Returns the text, whether it was cut, and the line count before cutting.
pub fn truncate_output(text: &str, max_lines: usize) -> (String, bool, usize) {
    let lines: Vec<&str> = text.lines().collect();
    let original_count = lines.len();

    if original_count <= max_lines {
        return (text.to_string(), false, original_count);
    }

    let mut truncated = lines[..max_lines].join("\n");
    truncated.push_str(&format!(
        "\n\n...(truncated: showing first {} lines of {})",
        max_lines, original_count
    ));

    (truncated, true, original_count)
}

/// Run line filtering, filtered-flag detection and truncation in order
pub fn process_output(text: &str, rules: &OutputRules) -> ProcessedOutput {
    let filtered = apply_line_filters(text, &rules.line_exclusions);
    let is_filtered = check_output_filtered(&filtered, &rules.output_exclusions);
    let (text, is_truncated, original_line_count) = truncate_output(&filtered, rules.max_lines);

    ProcessedOutput {
        text,
        is_filtered,
        is_truncated,
        original_line_count,
    }
}
