//! Script assembly: harness header, file bindings, sanitized user code and
//! capture epilogue, combined into one executable text.
//!
//! The script is modeled as typed slots rendered once, not spliced ad hoc;
//! every path that reaches the interpreter goes through [`py_str_literal`].

use crate::{
    pipeline::GenerationContext,
    schema::FormatTag,
    workspace::Workspace,
};

/// Sentinel prefix the epilogue prints when a plot was written. The path of
/// the artifact follows the colon.
pub const IMAGE_SENTINEL: &str = "IMAGE_SAVED:";
/// Sentinel the epilogue prints when execution produced no figure.
pub const NO_PLOT_SENTINEL: &str = "NO_PLOT_GENERATED";

const INDENT: &str = "    ";

/// Fixed harness: non-interactive plotting backend, silenced warnings,
/// deterministic styling. Runs before any binding or user code.
const HARNESS_HEADER: &str = r#"import pandas as pd
import numpy as np
import warnings
warnings.filterwarnings('ignore')
import matplotlib
matplotlib.use('Agg')
import matplotlib.pyplot as plt
import seaborn as sns
import json
import sys
import os

import logging
logging.getLogger('matplotlib').setLevel(logging.ERROR)

try:
    plt.style.use('seaborn-v0_8-darkgrid')
except Exception:
    plt.style.use('seaborn-darkgrid')
sns.set_palette("husl")
"#;

/// One execution script, assembled from typed slots. Exists only for the
/// lifetime of a single execution.
#[derive(Debug, Clone)]
pub struct AssembledScript {
    pub header: String,
    pub bindings: String,
    pub body: String,
    pub epilogue: String,
}

impl AssembledScript {
    /// Render the final script text. User code runs inside a `try:` block;
    /// the epilogue is emitted inside the same block, strictly after the
    /// body, so its sentinels cannot be preempted by user code ordering.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.header);
        out.push_str("\ntry:\n");
        push_indented(&mut out, &self.bindings);
        out.push('\n');
        push_indented(&mut out, &self.body);
        out.push('\n');
        push_indented(&mut out, &self.epilogue);
        out.push_str("except Exception as e:\n");
        out.push_str(INDENT);
        out.push_str("print(f\"ERROR:{e}\", file=sys.stderr)\n");
        out.push_str(INDENT);
        out.push_str("sys.exit(1)\n");
        out
    }
}

fn push_indented(out: &mut String, block: &str) {
    for line in block.lines() {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str(INDENT);
            out.push_str(line);
            out.push('\n');
        }
    }
}

/// Quote a string as a Python literal, escaping backslashes, quotes and
/// newlines. Used for every interpolated path.
pub fn py_str_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn reader_for(format: FormatTag) -> &'static str {
    match format {
        FormatTag::Csv => "pd.read_csv",
        FormatTag::Excel => "pd.read_excel",
        FormatTag::Json => "pd.read_json",
        // Unknown formats get the CSV reader; pandas' error is clearer than ours.
        FormatTag::Unknown => "pd.read_csv",
    }
}

/// Combine the harness, per-file bindings, sanitized user code and capture
/// epilogue for one workspace.
pub fn assemble(
    context: &GenerationContext,
    sanitized_code: &str,
    workspace: &Workspace,
) -> AssembledScript {
    let mut bindings = String::new();
    if context.files.len() == 1 {
        let (file, _) = &context.files[0];
        let path = py_str_literal(&file.storage_path.to_string_lossy());
        bindings.push_str(&format!("file_path = {}\n", path));
        bindings.push_str(&format!("df = {}(file_path)\n", reader_for(file.format)));
    } else {
        // Indexed bindings in upload order, plus the combined sequence.
        for (i, (file, _)) in context.files.iter().enumerate() {
            let n = i + 1;
            let path = py_str_literal(&file.storage_path.to_string_lossy());
            bindings.push_str(&format!("file_path_{} = {}\n", n, path));
            bindings.push_str(&format!("df_{} = {}(file_path_{})\n", n, reader_for(file.format), n));
        }
        let names: Vec<String> = (1..=context.files.len()).map(|n| format!("df_{}", n)).collect();
        bindings.push_str(&format!("dfs = [{}]\n", names.join(", ")));
    }

    let artifact = py_str_literal(&workspace.artifact_path().to_string_lossy());
    let epilogue = format!(
        concat!(
            "output_image_path = {path}\n",
            "if plt.get_fignums():\n",
            "    plt.tight_layout()\n",
            "    plt.savefig(output_image_path, dpi=150, bbox_inches='tight')\n",
            "    plt.close('all')\n",
            "    print(f\"{image_sentinel}{{output_image_path}}\")\n",
            "else:\n",
            "    print(\"{no_plot_sentinel}\")\n",
        ),
        path = artifact,
        image_sentinel = IMAGE_SENTINEL,
        no_plot_sentinel = NO_PLOT_SENTINEL,
    );

    AssembledScript {
        header: HARNESS_HEADER.to_string(),
        bindings,
        body: sanitized_code.to_string(),
        epilogue,
    }
}

/// Clean up a raw model completion into executable code: strip markdown
/// fencing if present and neutralize blocking display calls (the sandbox has
/// no display; `plt.show()` would otherwise be a silent no-op at best).
pub fn sanitize_code(raw: &str) -> String {
    extract_fenced(raw)
        .lines()
        .map(neutralize_show)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn extract_fenced(raw: &str) -> &str {
    for marker in ["```python", "```"] {
        if let Some(i) = raw.find(marker) {
            let rest = &raw[i + marker.len()..];
            return match rest.find("```") {
                Some(j) => rest[..j].trim(),
                None => rest.trim(),
            };
        }
    }
    raw.trim()
}

fn neutralize_show(line: &str) -> String {
    let Some(start) = line.find("plt.show(") else {
        return line.to_string();
    };
    let after_open = start + "plt.show(".len();
    let end = line[after_open..]
        .find(')')
        .map(|i| after_open + i + 1)
        .unwrap_or(line.len());
    format!(
        "{}# display call removed: non-interactive backend{}",
        &line[..start],
        &line[end..]
    )
}
