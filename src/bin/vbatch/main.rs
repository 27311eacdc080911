mod display;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use colored::Colorize;
use itertools::Itertools;

use vbatch_tools::convert::{
    BatchConvertConfig, BatchConverter, Config, FileLogger, MediaInfo, ProbeStrategy, QualityMode,
};

#[derive(Parser)]
#[command(author, version, name = env!("CARGO_BIN_NAME"), about = "Batch convert video files with ffmpeg")]
struct VbatchArgs {
    /// Optional input directory or file
    #[arg(value_hint = clap::ValueHint::AnyPath)]
    path: Option<PathBuf>,

    /// Output directory. Defaults to next to the input with a `_nw` suffix
    #[arg(short, long, name = "DIR", value_hint = clap::ValueHint::DirPath)]
    output: Option<PathBuf>,

    /// Fixed quality value. Picked from the resolution if not given
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(0..=51))]
    quality: Option<u32>,

    /// Lowest quality value for resolution based quality
    #[arg(long = "min-quality", name = "MIN")]
    min_quality: Option<u32>,

    /// Highest quality value for resolution based quality
    #[arg(long = "max-quality", name = "MAX")]
    max_quality: Option<u32>,

    /// Quality option passed to the encoder
    #[arg(short, long, value_enum)]
    mode: Option<QualityMode>,

    /// Video codec
    #[arg(long)]
    codec: Option<String>,

    /// Encoder preset
    #[arg(long)]
    preset: Option<String>,

    /// Hardware acceleration, or `none` to disable
    #[arg(short = 'a', long)]
    hwaccel: Option<String>,

    /// Skip files with bitrate lower than LIMIT kbps
    #[arg(short, long, name = "LIMIT")]
    bitrate: Option<u64>,

    /// Limit the number of files to convert
    #[arg(short, long)]
    count: Option<usize>,

    /// Save a before and after mediainfo report next to each output
    #[arg(short, long)]
    save_report: bool,

    /// Remove the output if it is not smaller than the original
    #[arg(short, long)]
    delete_if_larger: bool,

    /// Move the original to the trash and put the output in its place
    #[arg(short = 'R', long)]
    replace: bool,

    /// Only convert files in the top-level directory
    #[arg(short = 'N', long)]
    no_recurse: bool,

    /// Override file extensions to convert
    #[arg(short = 't', long, num_args = 1, action = clap::ArgAction::Append, name = "EXTENSION")]
    extension: Vec<String>,

    /// Match file extensions case-insensitively
    #[arg(short, long)]
    ignore_case: bool,

    /// Include files that match the given pattern
    #[arg(short = 'n', long, num_args = 1, action = clap::ArgAction::Append, name = "INCLUDE")]
    include: Vec<String>,

    /// Exclude files that match the given pattern
    #[arg(short = 'e', long, num_args = 1, action = clap::ArgAction::Append, name = "EXCLUDE")]
    exclude: Vec<String>,

    /// Print commands without running them
    #[arg(short, long)]
    print: bool,

    /// Overwrite existing output files
    #[arg(short, long)]
    force: bool,

    /// How to read source properties
    #[arg(long, value_enum)]
    probe: Option<ProbeStrategy>,

    /// Path to the ffmpeg binary
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    ffmpeg: Option<PathBuf>,

    /// Path to the ffprobe binary
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    ffprobe: Option<PathBuf>,

    /// Write a run log to ~/logs/vbatch-tools
    #[arg(short = 'g', long)]
    log: bool,

    /// Print mediainfo reports of matching files as JSON without converting
    #[arg(short = 'I', long)]
    info: bool,

    /// Generate shell completion
    #[arg(short = 'l', long, name = "SHELL")]
    completion: Option<Shell>,

    /// Print verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl VbatchArgs {
    /// Combine CLI arguments with the user config file.
    /// CLI values take priority.
    fn into_config(self, user_config: BatchConvertConfig) -> Result<Config> {
        let path = vbatch_tools::resolve_input_path(self.path.as_deref())?;
        let output_dir = self
            .output
            .or(user_config.output_dir)
            .map(|dir| std::path::absolute(&dir).with_context(|| format!("Invalid output directory: {}", dir.display())))
            .transpose()?;

        let merged = BatchConvertConfig {
            audio_bitrate: user_config.audio_bitrate,
            audio_codec: user_config.audio_codec,
            bitrate_threshold: self.bitrate.or(user_config.bitrate_threshold),
            case_insensitive_extensions: self.ignore_case || user_config.case_insensitive_extensions,
            codec: self.codec.or(user_config.codec),
            count: self.count.or(user_config.count),
            delete_if_larger: self.delete_if_larger || user_config.delete_if_larger,
            exclude: self.exclude.into_iter().chain(user_config.exclude).unique().collect(),
            extensions: if self.extension.is_empty() {
                user_config.extensions
            } else {
                self.extension
            },
            ffmpeg_path: self.ffmpeg.or(user_config.ffmpeg_path),
            ffprobe_path: self.ffprobe.or(user_config.ffprobe_path),
            hwaccel: self.hwaccel.or(user_config.hwaccel),
            include: self.include.into_iter().chain(user_config.include).unique().collect(),
            log_file: self.log || user_config.log_file,
            max_quality: self.max_quality.or(user_config.max_quality),
            min_quality: self.min_quality.or(user_config.min_quality),
            no_recurse: self.no_recurse || user_config.no_recurse,
            output_dir,
            overwrite: self.force || user_config.overwrite,
            preset: self.preset.or(user_config.preset),
            probe_strategy: self.probe.or(user_config.probe_strategy),
            quality: self.quality.or(user_config.quality),
            quality_mode: self.mode.or(user_config.quality_mode),
            reference_resolution: user_config.reference_resolution,
            replace_original: self.replace || user_config.replace_original,
            save_report: self.save_report || user_config.save_report,
            scale_resolution: user_config.scale_resolution,
            verbose: self.verbose || user_config.verbose,
        };

        let mut config = Config::from_user_config(path, merged)?;
        config.dryrun = self.print;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = VbatchArgs::parse();
    if let Some(shell) = args.completion {
        return vbatch_tools::generate_shell_completion(shell, VbatchArgs::command(), true, env!("CARGO_BIN_NAME"));
    }

    let info = args.info;
    let user_config = BatchConvertConfig::get_user_config()?;
    let config = args.into_config(user_config)?;
    if config.verbose {
        println!("{}", format!("{config:#?}").dimmed());
    }

    if info { print_media_info(config) } else { run(config) }
}

/// Convert all files on a worker thread while the main thread shows progress.
fn run(config: Config) -> Result<()> {
    let log_to_file = config.log_file;
    let (sender, receiver) = crossbeam_channel::unbounded();

    let mut converter = BatchConverter::new(config).with_events(sender);
    if log_to_file {
        let logger = FileLogger::new()?;
        println!("Logging to {}", logger.path().display());
        converter = converter.with_logger(logger);
    }

    let controller = converter.cancellation();
    ctrlc::set_handler(move || {
        if controller.cancel() {
            eprintln!("\n{}", "Received Ctrl+C, stopping current file...".yellow().bold());
        } else if controller.force() {
            eprintln!("\n{}", "Received second Ctrl+C, killing ffmpeg...".red().bold());
        } else {
            std::process::exit(130);
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    let worker = std::thread::spawn(move || converter.run());
    display::show_events(&receiver);

    let summary = worker
        .join()
        .map_err(|_| anyhow::anyhow!("Conversion worker panicked"))??;

    if summary.interrupted {
        println!("\n{}", "Batch interrupted".bold().red());
    }
    summary.run_stats.print_summary();
    Ok(())
}

/// Print the mediainfo report of each matching file.
fn print_media_info(config: Config) -> Result<()> {
    let converter = BatchConverter::new(config);
    let files = converter.gather_files()?;
    if files.is_empty() {
        vbatch_tools::print_warning!("No video files found");
        return Ok(());
    }

    let reports: BTreeMap<String, MediaInfo> = files
        .iter()
        .map(|file| {
            let info = converter.media_info(file).unwrap_or_else(|error| {
                vbatch_tools::print_warning!("{error}");
                MediaInfo::default()
            });
            (vbatch_tools::path_to_string(file), info)
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&reports).context("Failed to serialize mediainfo")?
    );
    Ok(())
}
