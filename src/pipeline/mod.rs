//! Pipeline orchestration: introspect uploads, generate code, sanitize,
//! assemble, execute, summarize.
//!
//! Each `run` is an independent unit of work. The only shared resource across
//! concurrent runs is the workspace root directory, and workspaces are
//! disjoint by construction.

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{ErrorKind, PipelineError},
    llm::{ChatMessage, ChatOptions, LlmClient, Role},
    sandbox::{self, ExecutionResult, SandboxPolicy},
    schema::{self, FileDescriptor, SchemaSummary},
    script,
    workspace::Workspace,
};

const GENERATION_MAX_TOKENS: u32 = 2000;
const SUMMARY_MAX_TOKENS: u32 = 200;
const SUMMARY_FALLBACK: &str = "Analysis completed successfully.";

/// One uploaded file as the caller names it.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub path: PathBuf,
}

/// Inbound request: the analysis prompt plus the uploads, in upload order.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub message: String,
    pub files: Vec<UploadedFile>,
}

/// Immutable input to the code-generation call.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub user_request: String,
    pub files: Vec<(FileDescriptor, SchemaSummary)>,
}

/// Terminal response for one request.
#[derive(Debug)]
pub struct AnalysisResponse {
    pub summary: String,
    pub code: String,
    pub artifact: Option<Vec<u8>>,
    pub stdout: Option<String>,
    pub error: Option<String>,
    pub truncated: bool,
}

pub struct Pipeline {
    client: LlmClient,
    model: String,
    temperature: f32,
    top_p: f32,
    python_bin: String,
    schema_timeout: Duration,
    workspace_root: PathBuf,
    policy: SandboxPolicy,
}

impl Pipeline {
    pub fn from_config(cfg: &Config, model: Option<String>, temperature: f32, top_p: f32) -> Result<Self> {
        let client = LlmClient::from_config(cfg)?;
        let model = model
            .or_else(|| cfg.get("DEFAULT_MODEL"))
            .unwrap_or_else(|| "gpt-4o".to_string());
        Ok(Self {
            client,
            model,
            temperature,
            top_p,
            python_bin: cfg.python_bin(),
            schema_timeout: cfg.schema_timeout(),
            workspace_root: cfg.workspace_root(),
            policy: SandboxPolicy::from_config(cfg),
        })
    }

    /// Drive one request end to end. The workspace is created after code
    /// generation succeeds and is gone before this returns, on every path.
    pub async fn run(&self, request: AnalysisRequest) -> Result<AnalysisResponse, PipelineError> {
        if request.message.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("request text is required"));
        }
        if request.files.is_empty() {
            return Err(PipelineError::InvalidRequest("at least one file is required"));
        }

        let files = self.introspect_all(&request.files).await;
        let context = GenerationContext { user_request: request.message.clone(), files };
        debug!(files = context.files.len(), "schemas collected");

        let raw = self
            .client
            .complete(
                vec![
                    ChatMessage::new(Role::System, build_system_prompt(&context)),
                    ChatMessage::new(Role::User, request.message.clone()),
                ],
                &ChatOptions {
                    model: self.model.clone(),
                    temperature: self.temperature,
                    top_p: self.top_p,
                    max_tokens: GENERATION_MAX_TOKENS,
                },
            )
            .await
            .map_err(|e| PipelineError::Generation(e.to_string()))?;

        let code = script::sanitize_code(&raw);
        if code.is_empty() {
            return Err(PipelineError::Generation("model returned no code".into()));
        }

        let workspace = Workspace::create(&self.workspace_root)?;
        info!(workspace = %workspace.id, model = %self.model, "executing generated code");

        let assembled = script::assemble(&context, &code, &workspace);
        // On error the workspace drop guard still removes the directory.
        let result = sandbox::execute(&assembled, &workspace, &self.policy).await?;
        workspace.release();

        let summary = self.summarize_run(&request.message).await;

        Ok(AnalysisResponse {
            summary,
            code,
            error: error_text(&result, self.policy.timeout),
            stdout: if result.stdout.is_empty() { None } else { Some(result.stdout) },
            artifact: result.artifact,
            truncated: result.truncated,
        })
    }

    /// Introspect every upload concurrently. A failure for one file degrades
    /// to a placeholder summary; the request proceeds with what it has.
    async fn introspect_all(&self, files: &[UploadedFile]) -> Vec<(FileDescriptor, SchemaSummary)> {
        let descriptors: Vec<FileDescriptor> = files
            .iter()
            .map(|f| FileDescriptor::new(f.name.clone(), f.path.clone()))
            .collect();

        let summaries = join_all(
            descriptors
                .iter()
                .map(|d| schema::summarize(d, &self.python_bin, self.schema_timeout)),
        )
        .await;

        descriptors
            .into_iter()
            .zip(summaries)
            .map(|(desc, summary)| {
                let summary = summary.unwrap_or_else(|e| {
                    warn!(file = %desc.name, error = %e, "schema introspection failed, using placeholder");
                    SchemaSummary::placeholder(&e.to_string())
                });
                (desc, summary)
            })
            .collect()
    }

    /// Best-effort prose summary of the run. The execution result is the
    /// deliverable; if this call fails the response gets a fixed message.
    async fn summarize_run(&self, message: &str) -> String {
        let prompt = format!(
            "Based on the user's request \"{}\" and the analysis performed, provide a brief, \
             clear explanation of what was done. Keep it concise (2-3 sentences).",
            message
        );
        let outcome = self
            .client
            .complete(
                vec![
                    ChatMessage::new(
                        Role::System,
                        "You are a helpful data analysis assistant. Provide clear, concise explanations.",
                    ),
                    ChatMessage::new(Role::User, prompt),
                ],
                &ChatOptions {
                    model: self.model.clone(),
                    temperature: self.temperature,
                    top_p: self.top_p,
                    max_tokens: SUMMARY_MAX_TOKENS,
                },
            )
            .await;

        match outcome {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => SUMMARY_FALLBACK.to_string(),
            Err(e) => {
                warn!(error = %e, "summary generation failed, using fallback");
                SUMMARY_FALLBACK.to_string()
            }
        }
    }
}

/// System instruction for the code-generation call: format rules plus the
/// per-file schema context.
fn build_system_prompt(context: &GenerationContext) -> String {
    let binding_note = if context.files.len() == 1 {
        "The data is already loaded: variable 'df' holds the dataset and 'file_path' its path. Use 'df' directly, do not re-read the file".to_string()
    } else {
        format!(
            "The data is already loaded: variables 'df_1' through 'df_{}' hold the datasets in upload order \
             (paths in 'file_path_1'...), and 'dfs' is the list of all of them. Use these directly, do not re-read the files",
            context.files.len()
        )
    };

    let mut prompt = format!(
        "You are a data analysis assistant. Your job is to generate Python code that analyzes data files and creates visualizations.\n\n\
         Rules:\n\
         1. Always use pandas for data handling (pd.read_csv, pd.read_excel, or pd.read_json)\n\
         2. Use matplotlib or seaborn for visualizations\n\
         3. Make sure to create clear, informative plots\n\
         4. Use appropriate plot types (histogram, scatter, line, bar, etc.) based on the request\n\
         5. Always include labels, titles, and legends\n\
         6. {}\n\
         7. Return ONLY the Python code, no explanations or markdown formatting\n\
         8. Import all necessary libraries at the top\n\
         9. Handle errors gracefully\n\n",
        binding_note
    );

    if context.files.len() == 1 {
        let (desc, summary) = &context.files[0];
        prompt.push_str(&format!(
            "The user has uploaded a file: {}\nFile schema/preview:\n{}\n",
            desc.name,
            summary.render()
        ));
    } else {
        prompt.push_str(&format!("The user has uploaded {} files:\n", context.files.len()));
        for (i, (desc, summary)) in context.files.iter().enumerate() {
            prompt.push_str(&format!(
                "\nFile {} (bound to df_{}): {}\nSchema/preview:\n{}\n",
                i + 1,
                i + 1,
                desc.name,
                summary.render()
            ));
        }
    }

    prompt.push_str(&format!("\nGenerate Python code that will: {}", context.user_request));
    prompt
}

/// Map an execution result onto the response's error text. Stderr is passed
/// through verbatim; a timeout gets an explicit marker.
fn error_text(result: &ExecutionResult, timeout: Duration) -> Option<String> {
    match result.error {
        None => None,
        Some(ErrorKind::Timeout) => Some(format!(
            "execution timed out after {}s",
            timeout.as_secs()
        )),
        Some(ErrorKind::Execution) => Some(if result.stderr.trim().is_empty() {
            "interpreter exited with an error".to_string()
        } else {
            result.stderr.clone()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_pipeline() -> Pipeline {
        Pipeline::from_config(&Config::load(), Some("test-model".into()), 0.0, 1.0).unwrap()
    }

    #[tokio::test]
    async fn empty_message_is_a_client_error() {
        let p = test_pipeline();
        let err = p
            .run(AnalysisRequest {
                message: "  ".into(),
                files: vec![UploadedFile { name: "a.csv".into(), path: "/tmp/a.csv".into() }],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn empty_file_list_is_a_client_error() {
        let p = test_pipeline();
        let err = p
            .run(AnalysisRequest { message: "plot it".into(), files: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn introspection_failure_degrades_to_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.csv");
        let mut f = std::fs::File::create(&good).unwrap();
        f.write_all(b"x,y\n1,2\n").unwrap();

        let p = test_pipeline();
        let files = vec![
            UploadedFile { name: "good.csv".into(), path: good },
            UploadedFile { name: "missing.csv".into(), path: dir.path().join("missing.csv") },
        ];
        let introspected = p.introspect_all(&files).await;
        assert_eq!(introspected.len(), 2);
        assert_eq!(introspected[0].1.columns, vec!["x", "y"]);
        assert!(introspected[1].1.preview.contains("Could not read schema"));
    }

    #[test]
    fn system_prompt_single_file_mentions_df_binding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.csv");
        std::fs::write(&path, "region,amount\neast,10\n").unwrap();
        let desc = FileDescriptor::new("sales.csv", path);
        let summary = SchemaSummary::placeholder("n/a");
        let ctx = GenerationContext {
            user_request: "summarize the data".into(),
            files: vec![(desc, summary)],
        };
        let prompt = build_system_prompt(&ctx);
        assert!(prompt.contains("'df' holds the dataset"));
        assert!(prompt.contains("uploaded a file: sales.csv"));
        assert!(prompt.ends_with("Generate Python code that will: summarize the data"));
    }

    #[test]
    fn system_prompt_multi_file_lists_bindings_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mk = |name: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, "a,b\n1,2\n").unwrap();
            (FileDescriptor::new(name, path), SchemaSummary::placeholder("n/a"))
        };
        let ctx = GenerationContext {
            user_request: "merge and plot".into(),
            files: vec![mk("first.csv"), mk("second.csv")],
        };
        let prompt = build_system_prompt(&ctx);
        let first = prompt.find("File 1 (bound to df_1): first.csv").unwrap();
        let second = prompt.find("File 2 (bound to df_2): second.csv").unwrap();
        assert!(first < second);
        assert!(prompt.contains("'df_1' through 'df_2'"));
    }

    #[test]
    fn error_text_mapping() {
        let timeout = Duration::from_secs(30);

        let ok = ExecutionResult { stdout: "fine".into(), ..Default::default() };
        assert_eq!(error_text(&ok, timeout), None);

        let timed_out = ExecutionResult { error: Some(ErrorKind::Timeout), ..Default::default() };
        assert_eq!(
            error_text(&timed_out, timeout).unwrap(),
            "execution timed out after 30s"
        );

        let failed = ExecutionResult {
            stderr: "ERROR:division by zero".into(),
            error: Some(ErrorKind::Execution),
            ..Default::default()
        };
        assert_eq!(error_text(&failed, timeout).unwrap(), "ERROR:division by zero");

        let silent = ExecutionResult { error: Some(ErrorKind::Execution), ..Default::default() };
        assert!(error_text(&silent, timeout).unwrap().contains("exited with an error"));
    }
}
