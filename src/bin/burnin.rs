use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use burnin::{
    BackendKind, CancellationToken, ExportJob, ExportOpts, ExportOutcome, Exporter, FilterSpec,
    FitPolicy, LoggingConfig, RenderTarget, Size, ThumbnailPolicy,
};

#[derive(Parser, Debug)]
#[command(name = "burnin", version)]
struct Cli {
    /// Default log level when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Burn overlays and a filter into a video (requires `ffmpeg`/`ffprobe` on PATH).
    Export(ExportArgs),
    /// Print a source's track info as JSON.
    Probe {
        path: PathBuf,
    },
    /// List the filter catalog.
    Filters,
}

#[derive(Parser, Debug)]
struct ExportArgs {
    /// Full job description as JSON. Other flags override its fields.
    #[arg(long)]
    job: Option<PathBuf>,

    /// Export options JSON (backend, encoder, pump timeouts).
    #[arg(long)]
    opts: Option<PathBuf>,

    /// Source video.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Output video.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Filter id from the catalog (`none` disables).
    #[arg(long)]
    filter: Option<String>,

    /// Thumbnail path; defaults to `<out-stem>.png` next to the output.
    #[arg(long, conflicts_with = "no_thumbnail")]
    thumbnail: Option<PathBuf>,

    /// Skip thumbnail extraction.
    #[arg(long, default_value_t = false)]
    no_thumbnail: bool,

    /// `fill` (crop) or `fit` (letterbox).
    #[arg(long)]
    fit: Option<String>,

    /// Output width; requires --height.
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Output height; requires --width.
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Mirror horizontally on top of the container orientation.
    #[arg(long, default_value_t = false)]
    mirror: bool,

    /// `cpu` or `gpu`.
    #[arg(long)]
    backend: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    burnin::init_logging(&LoggingConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
    });
    match cli.cmd {
        Command::Export(args) => cmd_export(args),
        Command::Probe { path } => cmd_probe(path),
        Command::Filters => cmd_filters(),
    }
}

fn cmd_export(args: ExportArgs) -> anyhow::Result<()> {
    let mut job = match (&args.job, &args.source, &args.out) {
        (Some(path), _, _) => ExportJob::from_path(path)?,
        (None, Some(source), Some(out)) => ExportJob::new(source, out),
        _ => anyhow::bail!("either --job or both --source and --out are required"),
    };
    if let Some(source) = args.source {
        job.source = source;
    }
    if let Some(out) = args.out {
        job.output = out;
    }

    let mut opts = match &args.opts {
        Some(path) => ExportOpts::from_path(path)?,
        None => job.opts.clone(),
    };
    if let Some(backend) = &args.backend {
        opts = opts.with_backend(backend.parse::<BackendKind>()?);
    }
    job.opts = opts.with_env_overrides();

    if let Some(id) = &args.filter {
        job.filter = FilterSpec::from_id(id)?;
    }
    if let Some(fit) = &args.fit {
        job.target.fit = parse_fit(fit)?;
    }
    if let (Some(w), Some(h)) = (args.width, args.height) {
        job.target = RenderTarget {
            size: Some(Size::new(w, h)),
            fit: job.target.fit,
        };
    }
    if args.mirror {
        job.mirrored = true;
    }
    if args.no_thumbnail {
        job.thumbnail = ThumbnailPolicy::Disabled;
    } else if let Some(path) = args.thumbnail {
        job.thumbnail = ThumbnailPolicy::Path(path);
    }

    let cancel = CancellationToken::new();
    match Exporter::new().run(&job, &cancel) {
        ExportOutcome::Completed(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        ExportOutcome::Failed(e) => Err(e).context("export failed"),
        ExportOutcome::Cancelled => anyhow::bail!("export cancelled"),
    }
}

fn cmd_probe(path: PathBuf) -> anyhow::Result<()> {
    let info = burnin::media::probe(&path)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn cmd_filters() -> anyhow::Result<()> {
    println!("catalog version {}", burnin::FILTER_CATALOG_VERSION);
    println!("{:<10} none", "none");
    for f in FilterSpec::ALL {
        println!("{:<10} {}", f.id(), f.title());
    }
    Ok(())
}

fn parse_fit(s: &str) -> anyhow::Result<FitPolicy> {
    match s.trim().to_ascii_lowercase().as_str() {
        "fill" => Ok(FitPolicy::Fill),
        "fit" => Ok(FitPolicy::Fit),
        other => anyhow::bail!("unknown fit policy '{other}' (expected 'fill' or 'fit')"),
    }
}
