//! Schema introspection: bounded summaries of uploaded data files.
//!
//! Summaries are generation context for the LLM, nothing more. Quality is
//! best-effort; size is not. Previews are hard-capped in both line count and
//! character count so prompt cost stays bounded regardless of input size.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::{error::PipelineError, script::py_str_literal};

pub const PREVIEW_MAX_LINES: usize = 20;
pub const PREVIEW_MAX_CHARS: usize = 500;

/// How many head records the tabular probe asks the interpreter for.
const PROBE_HEAD_ROWS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTag {
    Csv,
    Json,
    Excel,
    Unknown,
}

impl FormatTag {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") => Self::Csv,
            Some("json") => Self::Json,
            Some("xlsx") | Some("xls") => Self::Excel,
            _ => Self::Unknown,
        }
    }
}

/// Immutable description of one uploaded file, created at request intake.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub name: String,
    pub storage_path: PathBuf,
    pub size_bytes: u64,
    pub format: FormatTag,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();
        let size_bytes = std::fs::metadata(&storage_path).map(|m| m.len()).unwrap_or(0);
        let format = FormatTag::from_path(&storage_path);
        Self { name: name.into(), storage_path, size_bytes, format }
    }
}

/// Bounded structural summary of one file, produced fresh per request.
#[derive(Debug, Clone)]
pub struct SchemaSummary {
    pub format: FormatTag,
    pub row_count_estimate: Option<usize>,
    pub columns: Vec<String>,
    pub dtypes: Option<BTreeMap<String, String>>,
    pub preview: String,
}

impl SchemaSummary {
    /// Stand-in summary when introspection fails; the request proceeds with
    /// degraded context rather than aborting.
    pub fn placeholder(reason: &str) -> Self {
        Self {
            format: FormatTag::Unknown,
            row_count_estimate: None,
            columns: Vec::new(),
            dtypes: None,
            preview: format!("Could not read schema: {}", truncate_chars(reason, 200)),
        }
    }

    /// Render the summary as the prompt block handed to the generator.
    pub fn render(&self) -> String {
        match self.format {
            FormatTag::Csv => format!(
                "CSV file with approximately {} rows.\nColumns: {}\nFirst few rows:\n{}",
                self.row_count_estimate.unwrap_or(0),
                self.columns.join(", "),
                self.preview
            ),
            FormatTag::Json => format!("{}\nPreview: {}", self.describe_json(), self.preview),
            FormatTag::Excel => {
                let dtypes = self
                    .dtypes
                    .as_ref()
                    .map(|m| {
                        m.iter()
                            .map(|(k, v)| format!("{}: {}", k, v))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                format!(
                    "Excel file with {} rows and {} columns.\nColumns: {}\nData types: {}\nFirst rows preview:\n{}",
                    self.row_count_estimate.unwrap_or(0),
                    self.columns.len(),
                    self.columns.join(", "),
                    dtypes,
                    self.preview
                )
            }
            FormatTag::Unknown => format!("File content preview:\n{}", self.preview),
        }
    }

    fn describe_json(&self) -> String {
        match self.row_count_estimate {
            Some(n) => format!(
                "JSON array with {} items.\nFirst item keys: {}",
                n,
                self.columns.join(", ")
            ),
            None => format!("JSON object with keys: {}", self.columns.join(", ")),
        }
    }
}

/// Summarize one file. Fails with `Io` only if the file itself is unreadable;
/// content-level trouble degrades to a lower-fidelity summary instead.
pub async fn summarize(
    file: &FileDescriptor,
    python_bin: &str,
    probe_timeout: Duration,
) -> Result<SchemaSummary, PipelineError> {
    match file.format {
        FormatTag::Csv => summarize_csv(file),
        FormatTag::Json => summarize_json(file),
        FormatTag::Excel => Ok(summarize_tabular_probe(file, python_bin, probe_timeout).await),
        FormatTag::Unknown => match summarize_text(file) {
            // Binary content the text path cannot decode still gets a probe
            // attempt; the probe's own failure degrades to a placeholder.
            Err(PipelineError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::InvalidData =>
            {
                Ok(summarize_tabular_probe(file, python_bin, probe_timeout).await)
            }
            other => other,
        },
    }
}

fn read_text(file: &FileDescriptor) -> Result<String, PipelineError> {
    std::fs::read_to_string(&file.storage_path).map_err(|source| PipelineError::Io {
        path: file.storage_path.clone(),
        source,
    })
}

fn summarize_csv(file: &FileDescriptor) -> Result<SchemaSummary, PipelineError> {
    let content = read_text(file)?;
    let mut lines = content.lines();
    let header = lines.next().ok_or_else(|| PipelineError::Format {
        path: file.storage_path.clone(),
        format: "csv",
        detail: "empty file".into(),
    })?;

    let columns: Vec<String> = header
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_string())
        .collect();
    let row_count = content.lines().filter(|l| !l.trim().is_empty()).count().saturating_sub(1);
    let preview = preview_of(&content);

    Ok(SchemaSummary {
        format: FormatTag::Csv,
        row_count_estimate: Some(row_count),
        columns,
        dtypes: None,
        preview,
    })
}

fn summarize_json(file: &FileDescriptor) -> Result<SchemaSummary, PipelineError> {
    let content = read_text(file)?;
    let preview = truncate_chars(&preview_of(&content), PREVIEW_MAX_CHARS);

    // A file that fails to parse still yields a raw preview; the generator
    // gets less context, the request survives.
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Array(items)) => {
            let keys = items
                .first()
                .and_then(|v| v.as_object())
                .map(|o| o.keys().cloned().collect())
                .unwrap_or_default();
            Ok(SchemaSummary {
                format: FormatTag::Json,
                row_count_estimate: Some(items.len()),
                columns: keys,
                dtypes: None,
                preview,
            })
        }
        Ok(Value::Object(map)) => Ok(SchemaSummary {
            format: FormatTag::Json,
            row_count_estimate: None,
            columns: map.keys().cloned().collect(),
            dtypes: None,
            preview,
        }),
        Ok(_) | Err(_) => Ok(SchemaSummary {
            format: FormatTag::Unknown,
            row_count_estimate: None,
            columns: Vec::new(),
            dtypes: None,
            preview,
        }),
    }
}

fn summarize_text(file: &FileDescriptor) -> Result<SchemaSummary, PipelineError> {
    let content = read_text(file)?;
    Ok(SchemaSummary {
        format: FormatTag::Unknown,
        row_count_estimate: None,
        columns: Vec::new(),
        dtypes: None,
        preview: truncate_chars(&preview_of(&content), PREVIEW_MAX_CHARS),
    })
}

/// Record emitted by the interpreter-side probe on stdout.
#[derive(Debug, Deserialize)]
struct ProbeRecord {
    error: Option<String>,
    #[serde(default)]
    columns: Vec<String>,
    shape: Option<(usize, usize)>,
    dtypes: Option<BTreeMap<String, String>>,
    head: Option<Value>,
}

/// Delegate binary tabular formats to the interpreter: load with pandas, emit
/// one JSON record describing columns, shape, dtypes and head rows. Runs under
/// its own short timeout; any failure degrades to a placeholder summary.
async fn summarize_tabular_probe(
    file: &FileDescriptor,
    python_bin: &str,
    probe_timeout: Duration,
) -> SchemaSummary {
    let script = format!(
        concat!(
            "import pandas as pd\n",
            "import json\n",
            "try:\n",
            "    df = pd.read_excel({path})\n",
            "    schema = {{\n",
            "        'columns': [str(c) for c in df.columns.tolist()],\n",
            "        'shape': df.shape,\n",
            "        'dtypes': df.dtypes.astype(str).to_dict(),\n",
            "        'head': df.head({head}).to_dict('records'),\n",
            "    }}\n",
            "    print(json.dumps(schema, default=str))\n",
            "except Exception as e:\n",
            "    print(json.dumps({{'error': str(e)}}))\n",
        ),
        path = py_str_literal(&file.storage_path.to_string_lossy()),
        head = PROBE_HEAD_ROWS,
    );

    let output = Command::new(python_bin)
        .arg("-c")
        .arg(&script)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(probe_timeout, output).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            debug!(file = %file.name, error = %e, "schema probe failed to spawn");
            return SchemaSummary::placeholder(&e.to_string());
        }
        Err(_) => {
            debug!(file = %file.name, "schema probe timed out");
            return SchemaSummary::placeholder("schema probe timed out");
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let record: ProbeRecord = match serde_json::from_str(stdout.trim()) {
        Ok(r) => r,
        Err(e) => {
            debug!(file = %file.name, error = %e, "schema probe emitted malformed record");
            return SchemaSummary::placeholder("unparseable probe output");
        }
    };

    if let Some(err) = record.error {
        return SchemaSummary::placeholder(&err);
    }

    let preview = record
        .head
        .as_ref()
        .and_then(|h| serde_json::to_string(h).ok())
        .map(|s| truncate_chars(&s, PREVIEW_MAX_CHARS))
        .unwrap_or_default();

    SchemaSummary {
        format: FormatTag::Excel,
        row_count_estimate: record.shape.map(|(rows, _)| rows),
        columns: record.columns,
        dtypes: record.dtypes,
        preview,
    }
}

fn preview_of(content: &str) -> String {
    content
        .lines()
        .take(PREVIEW_MAX_LINES)
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
