use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use shelf_adapters::extract_sheet_id;
use shelf_core::{BookRecord, IngestStats, SheetFormat};
use shelf_sync::{build_books_from_text, run_once_from_env, CatalogConfig, CatalogPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shelf-cli")]
#[command(about = "SheetShelf: build a book catalog from a shared spreadsheet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` wins when set.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the sheet and print the catalog.
    Fetch(FetchArgs),
    /// Build the catalog from a payload saved on disk.
    Parse {
        file: PathBuf,
        #[arg(long, default_value_t = SheetFormat::Csv)]
        format: SheetFormat,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        output: OutputFormat,
    },
    /// Print the sheet id contained in a sharing URL.
    SheetId { url: String },
}

#[derive(Debug, Default, Args)]
struct FetchArgs {
    /// Sheet id or sharing URL.
    #[arg(long)]
    sheet: Option<String>,
    #[arg(long)]
    format: Option<SheetFormat>,
    #[arg(long)]
    sheet_name: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    /// YAML config file; `SHELF_*` variables and flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    output: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Json,
    Text,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "shelf=info",
        1 => "shelf=debug",
        _ => "shelf=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

impl FetchArgs {
    /// True when nothing beyond the environment configures the run.
    fn env_only(&self) -> bool {
        self.sheet.is_none()
            && self.format.is_none()
            && self.sheet_name.is_none()
            && self.api_key.is_none()
            && self.config.is_none()
    }
}

fn load_config(args: &FetchArgs) -> Result<CatalogConfig> {
    let mut config = match &args.config {
        Some(path) => CatalogConfig::from_yaml_file(path)?.with_env_overrides(),
        None => CatalogConfig::from_env(),
    };
    if let Some(sheet) = &args.sheet {
        config.sheet_id = sheet.clone();
    }
    if let Some(format) = args.format {
        config.format = format;
    }
    if let Some(name) = &args.sheet_name {
        config.sheet_name = name.clone();
    }
    if let Some(key) = &args.api_key {
        config.api_key = Some(key.clone());
    }
    Ok(config)
}

fn resolve_sheet_id(input: &str) -> Option<String> {
    if let Some(id) = extract_sheet_id(input) {
        return Some(id);
    }
    let bare = input.trim();
    (!bare.is_empty() && !bare.contains('/')).then(|| bare.to_string())
}

fn render_text(books: &[BookRecord], stats: &IngestStats) -> String {
    let mut out = String::new();
    for book in books {
        out.push_str(&format!("{:>3}. {}", book.id, book.title));
        if !book.author.is_empty() {
            out.push_str(&format!(" by {}", book.author));
        }
        out.push_str(&format!(" [{:.1}/5]\n", book.rating));
    }
    out.push_str(&format!(
        "{} books ({} rows, {} rejected, {} duplicates)\n",
        stats.books, stats.raw_rows, stats.rejected_rows, stats.duplicate_rows
    ));
    out
}

async fn run_fetch(args: FetchArgs) -> Result<()> {
    let run = if args.env_only() {
        run_once_from_env().await.context("fetching catalog")?
    } else {
        let pipeline = CatalogPipeline::new(load_config(&args)?)?;
        let config = pipeline.config();
        info!(sheet = %config.target().sheet_id, format = %config.format, "fetching catalog");
        pipeline.run_once().await.context("fetching catalog")?
    };
    info!(run_id = %run.run_id, books = run.stats.books, "catalog ready");

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&run)?),
        OutputFormat::Text => print!("{}", render_text(&run.books, &run.stats)),
    }
    Ok(())
}

fn run_parse(file: PathBuf, format: SheetFormat, output: OutputFormat) -> Result<()> {
    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let (books, stats) = build_books_from_text(format, &text);

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&books)?),
        OutputFormat::Text => print!("{}", render_text(&books, &stats)),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or_else(|| Commands::Fetch(FetchArgs::default())) {
        Commands::Fetch(args) => run_fetch(args).await?,
        Commands::Parse {
            file,
            format,
            output,
        } => run_parse(file, format, output)?,
        Commands::SheetId { url } => match resolve_sheet_id(&url) {
            Some(id) => println!("{id}"),
            None => bail!("no sheet id found in `{url}`"),
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_fetch() {
        let cli = Cli::try_parse_from(["shelf-cli"]).unwrap();
        assert!(cli.command.is_none());
        assert!(FetchArgs::default().env_only());
    }

    #[test]
    fn only_config_flags_leave_env_only_mode() {
        let cli = Cli::try_parse_from(["shelf-cli", "fetch", "--output", "text"]).unwrap();
        let Some(Commands::Fetch(args)) = cli.command else {
            panic!("expected fetch");
        };
        assert!(args.env_only());

        let cli = Cli::try_parse_from(["shelf-cli", "fetch", "--sheet-name", "Shelf"]).unwrap();
        let Some(Commands::Fetch(args)) = cli.command else {
            panic!("expected fetch");
        };
        assert!(!args.env_only());
    }

    #[test]
    fn fetch_flags_override_config() {
        let cli = Cli::try_parse_from([
            "shelf-cli",
            "fetch",
            "--sheet",
            "https://docs.google.com/spreadsheets/d/1AbC/edit",
            "--format",
            "values-api",
            "--api-key",
            "k3y",
            "--output",
            "text",
        ])
        .unwrap();
        let Some(Commands::Fetch(args)) = cli.command else {
            panic!("expected fetch");
        };
        assert_eq!(args.output, OutputFormat::Text);
        let config = load_config(&args).unwrap();
        assert_eq!(config.format, SheetFormat::ValuesApi);
        assert_eq!(config.api_key.as_deref(), Some("k3y"));
        assert_eq!(config.target().sheet_id, "1AbC");
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(Cli::try_parse_from(["shelf-cli", "fetch", "--format", "xlsx"]).is_err());
    }

    #[test]
    fn sheet_id_accepts_url_or_bare_id() {
        assert_eq!(
            resolve_sheet_id("https://docs.google.com/spreadsheets/d/1AbC-d_9/edit#gid=0").as_deref(),
            Some("1AbC-d_9")
        );
        assert_eq!(resolve_sheet_id(" 1AbC ").as_deref(), Some("1AbC"));
        assert_eq!(resolve_sheet_id("https://example.com/nothing"), None);
        assert_eq!(resolve_sheet_id(""), None);
    }

    #[test]
    fn text_output_lists_books_and_counts() {
        let (books, stats) = build_books_from_text(
            SheetFormat::Csv,
            "title,author,description,coverUrl,rating,sourceUrl\nDune,Frank Herbert,,,4.5,\nSolaris,,,,,\n",
        );
        let text = render_text(&books, &stats);
        assert_eq!(
            text,
            "  1. Dune by Frank Herbert [4.5/5]\n  2. Solaris [0.0/5]\n2 books (2 rows, 0 rejected, 0 duplicates)\n"
        );
    }
}
