//! imagetar: save and load container images as tar archives.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use imagetar::{ArchiveFormat, CancelToken, SaveOptions, Store};

#[derive(Parser)]
#[command(name = "imagetar")]
#[command(about = "Save and load container images as tar archives", long_about = None)]
struct Cli {
    /// Path to the store root
    #[arg(long, global = true, default_value = "/var/lib/imagetar")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save one or more images to a tar archive (stdout by default)
    Save {
        /// Images to save: name, name:tag, name@digest, or image ID
        #[arg(required = true)]
        images: Vec<String>,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Archive format
        #[arg(long, value_enum, default_value = "legacy")]
        format: Format,

        /// Override a tag in OCI refs as name[:tag]=override (repeatable)
        #[arg(long = "ref", value_name = "NAME[:TAG]=OVERRIDE")]
        refs: Vec<String>,
    },

    /// Load images from a tar archive (stdin by default)
    Load {
        /// Read from a file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Suppress per-image progress lines
        #[arg(short, long)]
        quiet: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Legacy,
    Oci,
}

impl From<Format> for ArchiveFormat {
    fn from(format: Format) -> ArchiveFormat {
        match format {
            Format::Legacy => ArchiveFormat::Legacy,
            Format::Oci => ArchiveFormat::Oci,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = Store::open_or_init(&cli.root)
        .with_context(|| format!("opening store at {}", cli.root.display()))?;
    let cancel = CancelToken::new();

    match cli.command {
        Commands::Save {
            images,
            output,
            format,
            refs,
        } => {
            let options = SaveOptions {
                format: format.into(),
                ref_overrides: refs,
            };
            match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    imagetar::save(&store, &images, &options, file, &cancel)?;
                }
                None => {
                    let stdout = io::stdout().lock();
                    imagetar::save(&store, &images, &options, stdout, &cancel)?;
                }
            }
        }
        Commands::Load { input, quiet } => {
            let mut stdout = io::stdout().lock();
            let mut on_event = |event: &imagetar::LoadEvent| {
                if !quiet {
                    let _ = writeln!(stdout, "{event}");
                }
            };
            match input {
                Some(path) => {
                    let file = File::open(&path)
                        .with_context(|| format!("opening {}", path.display()))?;
                    imagetar::load(&store, file, &cancel, &mut on_event)?;
                }
                None => {
                    let stdin = io::stdin().lock();
                    imagetar::load(&store, stdin, &cancel, &mut on_event)?;
                }
            }
        }
    }

    Ok(())
}
