use anyhow::{bail, Result};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use dgpt::{
    cli,
    config::Config,
    pipeline::{AnalysisRequest, Pipeline, UploadedFile},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();

    let Some(prompt) = args.prompt.filter(|p| !p.trim().is_empty()) else {
        bail!("provide an analysis request, e.g.: dgpt \"plot revenue by month\" -f sales.csv");
    };
    if args.file.is_empty() {
        bail!("provide at least one data file with -f/--file");
    }

    let files = args
        .file
        .iter()
        .map(|p| UploadedFile {
            name: p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.to_string_lossy().into_owned()),
            path: p.clone(),
        })
        .collect();

    let cfg = Config::load();
    let pipeline = Pipeline::from_config(&cfg, args.model.clone(), args.temperature, args.top_p)?;
    let response = pipeline.run(AnalysisRequest { message: prompt, files }).await?;

    println!("{}\n{}\n", "summary".magenta(), response.summary);

    if args.show_code {
        println!("{}\n{}\n", "generated code".cyan(), response.code);
    }

    if let Some(stdout) = &response.stdout {
        println!("{}\n{}", "output".green(), stdout);
    }
    if response.truncated {
        eprintln!("{}", "note: captured output was truncated".yellow());
    }

    if let Some(bytes) = &response.artifact {
        std::fs::write(&args.output, bytes)?;
        println!("{} {}", "plot written to".green(), args.output.display());
    }

    if let Some(error) = &response.error {
        eprintln!("{}\n{}", "error".red(), error);
        std::process::exit(1);
    }

    Ok(())
}
