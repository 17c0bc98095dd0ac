use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWriteExt},
};

use modstream::{
    archive::{ArchiveReader, EntryKind},
    module::{open_module, DirectorySource, Module, ModuleSource, ProjectTemplate},
    pipeline,
    strip::strip_components,
    StageError, StripDepth,
};

/// modstream
#[derive(Debug, Parser)]
#[clap(name = "modstream", version)]
pub struct App {
    /// Number of leading path segments to strip from every entry
    #[clap(long, global = true, default_value_t = StripDepth::default())]
    depth: StripDepth,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Directory holding one sub-directory of `<tag>.tar` files per project
    #[clap(long)]
    root: PathBuf,
    /// How a module maps to a project directory
    #[clap(long, default_value = "{namespace}/{name}")]
    template: ProjectTemplate,
}

impl SourceArgs {
    fn source(self) -> DirectorySource {
        DirectorySource::new(self.root, self.template)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Re-streams a tar file as a flat .tar.gz
    Restream {
        /// the tar file to read, or '-' for stdin
        input: PathBuf,
        /// where to write the result (default: stdout)
        #[clap(long, short)]
        output: Option<PathBuf>,
    },
    /// Shows what each entry of a tar file would be renamed to
    List {
        /// the tar file to read, or '-' for stdin
        input: PathBuf,
    },
    /// Lists the published versions of a module
    Versions {
        #[clap(flatten)]
        source: SourceArgs,
        /// namespace/name/provider
        module: Module,
    },
    /// Writes the package of one module version as .tar.gz
    Fetch {
        #[clap(flatten)]
        source: SourceArgs,
        /// namespace/name/provider
        module: Module,
        version: String,
        #[clap(long, short)]
        output: Option<PathBuf>,
    },
}

async fn open_input(path: &Path) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    if path == Path::new("-") {
        return Ok(Box::new(tokio::io::stdin()));
    }

    let file = File::open(path)
        .await
        .with_context(|| format!("Opening {path:?}"))?;
    let size = file.metadata().await?.len();

    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::with_template(
            "[eta {eta}] {bar:40.cyan/blue} {decimal_bytes:>7}/{decimal_total_bytes:7} {msg}",
        )?
        .progress_chars("##-"),
    );
    Ok(Box::new(bar.wrap_async_read(file)))
}

/// Pulls the failure of a pipeline stage back out of an I/O error.
fn unwrap_stage_error(err: io::Error) -> anyhow::Error {
    match StageError::from_io(&err) {
        Some(stage) => stage.clone().into(),
        None => err.into(),
    }
}

async fn write_output(mut stream: impl AsyncRead + Unpin, output: Option<&Path>) -> Result<()> {
    let Some(path) = output else {
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut stream, &mut stdout)
            .await
            .map_err(unwrap_stage_error)?;
        stdout.flush().await?;
        return Ok(());
    };

    let mut file = File::create(path)
        .await
        .with_context(|| format!("Creating {path:?}"))?;
    let result: Result<()> = async {
        tokio::io::copy(&mut stream, &mut file)
            .await
            .map_err(unwrap_stage_error)?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if result.is_err() {
        // a truncated package must never look like a real one
        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!("Can't remove incomplete {path:?}: {err}");
        }
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Restream { input, output } => {
            let raw = open_input(&input).await?;
            let stream = pipeline::build(raw, args.depth);
            write_output(stream, output.as_deref()).await?;
        }
        Command::List { input } => {
            let mut reader = ArchiveReader::new(open_input(&input).await?);
            let depth = args.depth.get();
            while let Some(entry) = reader.next_entry().await? {
                if entry.kind() == EntryKind::GlobalMetadata {
                    println!("{} (dropped: global metadata)", entry.name());
                    continue;
                }
                match strip_components(entry.path(), depth) {
                    Some([]) => println!("{} (dropped)", entry.name()),
                    Some(stripped) => {
                        println!("{} -> {}", entry.name(), String::from_utf8_lossy(stripped))
                    }
                    None => println!("{} (too shallow for depth {depth})", entry.name()),
                }
            }
        }
        Command::Versions { source, module } => {
            for version in source.source().versions(&module).await? {
                println!("{version}");
            }
        }
        Command::Fetch {
            source,
            module,
            version,
            output,
        } => {
            let stream = open_module(&source.source(), &module, &version, args.depth).await?;
            write_output(stream, output.as_deref())
                .await
                .with_context(|| format!("Fetching {module} version {version}"))?;
        }
    }
    Ok(())
}
