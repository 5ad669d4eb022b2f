use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "dgpt", about = "Natural-language data analysis with sandboxed Python execution", version)]
pub struct Cli {
    /// The analysis request, e.g. "plot monthly revenue by region".
    #[arg(value_name = "REQUEST")]
    pub prompt: Option<String>,

    /// Data file to analyze (.csv, .json, .xlsx). Repeatable; binding order
    /// follows argument order.
    #[arg(short = 'f', long = "file", value_name = "PATH", action = clap::ArgAction::Append)]
    pub file: Vec<PathBuf>,

    /// Large language model to use.
    #[arg(long)]
    pub model: Option<String>,

    /// Randomness of generated output.
    #[arg(long, default_value_t = 0.0, value_parser = clap::value_parser!(f32))]
    pub temperature: f32,

    /// Limits highest probable tokens (words).
    #[arg(long = "top-p", default_value_t = 1.0, value_parser = clap::value_parser!(f32))]
    pub top_p: f32,

    /// Where to write the visualization image, if one is produced.
    #[arg(short = 'o', long = "output", value_name = "PATH", default_value = "plot.png")]
    pub output: PathBuf,

    /// Print the generated Python code before the output.
    #[arg(long = "show-code")]
    pub show_code: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
