use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use scorch_core::direct::DirectWriteBackend;
use scorch_core::drive::Drive;
use scorch_core::engine::{BurnContext, EnginePoll};
use scorch_core::error::{BurnError, BurnResult};
use scorch_core::job::{BurnAction, Cap, IoMode, JobMonitor, ProgressReport};
use scorch_core::pipeline::{ChainOutcome, Pipeline};
use scorch_core::staging::{LocalFetcher, LocalStagingJob};
use scorch_core::track::{Track, TrackBounds, TrackContent, TrackKind};
use scorch_core::verify::{ChecksumVerifier, VerifyOutcome};

#[derive(Parser)]
#[command(name = "scorch")]
#[command(about = "A safe, interactive optical media burner", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Burn an image to a drive interactively
    Burn {
        /// Image to burn: a local path or a locator a fetcher can stage
        #[arg(required = true)]
        image: String,

        /// Target drive or image file; discovered interactively when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Skip post-burn verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,
    },
    /// Blank a rewritable medium
    Blank {
        /// Target drive; discovered interactively when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,
    },
    /// Check a disc or image against a checksum
    Check {
        /// Medium, image file, or mounted disc root to check
        #[arg(required = true)]
        target: PathBuf,

        /// External md5 sidecar file holding the expected checksum
        #[arg(long)]
        md5: Option<String>,

        /// Session length in sectors, for raw device targets
        #[arg(long)]
        sectors: Option<u64>,
    },
    /// List available optical drives
    List,
}

/// How often the control loop re-polls the engine.
const TICK: Duration = Duration::from_millis(200);

fn fraction_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(1000);
    pb.set_prefix(prefix.to_string());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:12} [{elapsed_precise}] [{bar:40.cyan/black}] {percent:>3}% {msg}")
            .unwrap()
            .progress_chars("■ "),
    );
    pb
}

fn byte_bar(prefix: &str, len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_prefix(prefix.to_string());
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
            )
            .unwrap()
            .progress_chars("■ "),
    );
    pb
}

/// Puts the engine's current action label next to the bar, or the
/// do-not-interrupt hint while the operation is in a dangerous phase.
fn apply_message(pb: &ProgressBar, report: &ProgressReport) {
    if report.dangerous {
        pb.set_message(style("do not interrupt").yellow().to_string());
    } else if let Some(label) = &report.label {
        pb.set_message(label.clone());
    } else {
        pb.set_message(String::new());
    }
}

fn apply_fraction(pb: &ProgressBar, report: &ProgressReport) {
    if report.fraction >= 0.0 {
        pb.set_position((report.fraction * 1000.0) as u64);
    }
    apply_message(pb, report);
}

/// Runs a blocking operation on a worker thread while feeding its monitor
/// readings to the progress bar.
fn supervise_thread<T, F, U>(body: F, monitor: &Arc<JobMonitor>, mut update: U) -> BurnResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> BurnResult<T> + Send + 'static,
    U: FnMut(&ProgressReport),
{
    let handle = thread::spawn(body);
    while !handle.is_finished() {
        update(&monitor.snapshot());
        thread::sleep(Duration::from_millis(100));
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(BurnError::Internal(anyhow!("worker thread panicked"))),
    }
}

/// Presents an interactive menu for the user to select a drive.
fn select_drive(drives: &[Drive], prompt: &str) -> Result<Drive> {
    if drives.is_empty() {
        return Err(anyhow!("No optical drives found."));
    }

    let items: Vec<String> = drives.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(drives[selection].clone())
}

fn resolve_device(device: Option<PathBuf>, prompt: &str) -> Result<PathBuf> {
    match device {
        Some(path) => Ok(path),
        None => {
            let drives = scorch_core::platform::get_optical_drives()?;
            Ok(select_drive(&drives, prompt)?.path)
        }
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn main() -> Result<()> {
    env_logger::init();

    // This flag allows for graceful cancellation of operations.
    let cancel = Arc::new(AtomicBool::new(false));
    let c = cancel.clone();

    // Ctrl+C requests a cooperative stop; the engine unwinds cleanly.
    ctrlc::set_handler(move || {
        c.store(true, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Burn {
            image,
            device,
            no_verify,
        } => cmd_burn(image, device, no_verify, cancel),
        Commands::Blank { device } => cmd_blank(device, cancel),
        Commands::Check {
            target,
            md5,
            sectors,
        } => cmd_check(target, md5, sectors, cancel),
        Commands::List => cmd_list(),
    }
}

fn cmd_burn(
    image: String,
    device: Option<PathBuf>,
    no_verify: bool,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let device = resolve_device(device, "Select the target drive to WRITE to")?;

    println!(
        "{} This will overwrite the medium in '{}'.",
        style("WARNING:").red().bold(),
        device.display(),
    );
    println!("  Device: {}", style(device.display()).cyan());
    println!("  Image:  {}", style(&image).cyan());
    println!();

    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Burn cancelled.");
        return Ok(());
    }

    println!();

    // First mirror any non-local content into the session's staging area.
    let staging_dir = tempfile::tempdir()?;
    let mut pipeline = Pipeline::new();
    pipeline.register(Box::new(LocalStagingJob::new(
        Arc::new(LocalFetcher),
        staging_dir.path(),
    )));

    let mut stage_pb: Option<ProgressBar> = None;
    let outcome = pipeline.run(
        Track::image(image, None),
        Cap::new(TrackKind::Image, IoMode::File),
        &cancel,
        |_, report| {
            if report.action == BurnAction::FileCopy {
                let pb = stage_pb.get_or_insert_with(|| fraction_bar("Staging"));
                apply_fraction(pb, report);
            }
        },
    )?;
    if let Some(pb) = stage_pb {
        pb.finish_with_message("Staging complete.");
    }

    let track = match outcome {
        ChainOutcome::Completed(track) => track,
        ChainOutcome::Cancelled => {
            println!("Burn cancelled.");
            return Ok(());
        }
    };
    let TrackContent::Image { source, .. } = track.content() else {
        return Err(anyhow!("staging produced an unexpected track type"));
    };
    let staged = PathBuf::from(source);
    log::debug!("burning staged image at {}", staged.display());
    let image_len = fs::metadata(&staged)?.len();

    // Burn the staged image under engine supervision.
    let monitor = JobMonitor::new();
    let backend = DirectWriteBackend::burn(&staged, &device)?;
    let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

    let burn_pb = byte_bar("Burning", image_len);
    let mut was_cancelled = false;
    let burn_result = loop {
        if cancel.load(Ordering::SeqCst) && !was_cancelled {
            was_cancelled = true;
            burn_pb.set_message(style("cancelling...").yellow().to_string());
            ctx.stop();
        }
        match ctx.poll() {
            Ok(EnginePoll::Retry) => {
                let report = monitor.snapshot();
                burn_pb.set_position(report.written.min(image_len));
                if !was_cancelled {
                    apply_message(&burn_pb, &report);
                }
                thread::sleep(TICK);
            }
            Ok(EnginePoll::Complete) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    ctx.release();

    match burn_result {
        Err(err) => {
            burn_pb.finish_and_clear();
            return Err(err.into());
        }
        Ok(()) if was_cancelled => {
            burn_pb.finish_and_clear();
            println!("Burn cancelled.");
            return Ok(());
        }
        Ok(()) => {
            burn_pb.set_position(image_len);
            burn_pb.finish_with_message("Burn complete.");
        }
    }

    if !no_verify {
        monitor.reset();
        let verify_pb = byte_bar("Verifying", image_len);
        let verifier = ChecksumVerifier::new(
            Arc::new(LocalFetcher),
            Arc::clone(&monitor),
            Arc::clone(&cancel),
        );
        let (staged_copy, device_copy) = (staged.clone(), device.clone());
        let result = supervise_thread(
            move || verifier.check_target_against_image(&staged_copy, &device_copy),
            &monitor,
            |report| {
                verify_pb.set_position(report.written.min(image_len));
            },
        );
        match result {
            Ok(VerifyOutcome::Success) => {
                verify_pb.set_position(image_len);
                verify_pb.finish_with_message("Verification successful.");
            }
            Ok(VerifyOutcome::BadChecksum(_)) => {
                verify_pb.finish_and_clear();
                return Err(anyhow!(
                    "Verification failed: the written data does not match the image."
                ));
            }
            Err(err) if err.is_cancelled() => {
                verify_pb.finish_and_clear();
                println!("Verification cancelled.");
                return Ok(());
            }
            Err(err) => {
                verify_pb.finish_and_clear();
                return Err(err.into());
            }
        }
    }

    println!(
        "\n✨ Successfully burned {} to {}.",
        style(staged.display()).cyan(),
        style(device.display()).cyan()
    );

    Ok(())
}

fn cmd_blank(device: Option<PathBuf>, cancel: Arc<AtomicBool>) -> Result<()> {
    let device = resolve_device(device, "Select the drive holding the medium to BLANK")?;

    println!(
        "{} This will erase the medium in '{}'.",
        style("WARNING:").red().bold(),
        device.display(),
    );
    println!();

    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Blank cancelled.");
        return Ok(());
    }

    println!();

    let monitor = JobMonitor::new();
    let backend = DirectWriteBackend::blank(&device)?;
    let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

    let pb = fraction_bar("Blanking");
    let mut was_cancelled = false;
    let result = loop {
        if cancel.load(Ordering::SeqCst) && !was_cancelled {
            was_cancelled = true;
            pb.set_message(style("cancelling...").yellow().to_string());
            ctx.stop();
        }
        match ctx.poll() {
            Ok(EnginePoll::Retry) => {
                let report = monitor.snapshot();
                if !was_cancelled {
                    apply_fraction(&pb, &report);
                }
                thread::sleep(TICK);
            }
            Ok(EnginePoll::Complete) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    ctx.release();

    match result {
        Err(err) => {
            pb.finish_and_clear();
            Err(err.into())
        }
        Ok(()) if was_cancelled => {
            pb.finish_and_clear();
            println!("Blank cancelled.");
            Ok(())
        }
        Ok(()) => {
            pb.set_position(1000);
            pb.finish_with_message("Blank complete.");
            println!("\n✨ Medium in {} blanked.", style(device.display()).cyan());
            Ok(())
        }
    }
}

fn cmd_check(
    target: PathBuf,
    md5: Option<String>,
    sectors: Option<u64>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let monitor = JobMonitor::new();
    let verifier = ChecksumVerifier::new(
        Arc::new(LocalFetcher),
        Arc::clone(&monitor),
        Arc::clone(&cancel),
    );

    let pb = fraction_bar("Checking");
    let target_copy = target.clone();
    let result = supervise_thread(
        move || {
            if target_copy.is_dir() {
                // A mounted disc root carries its own per-file manifest.
                verifier.check_manifest(&target_copy)
            } else if let Some(md5) = md5 {
                let mut track = Track::image(target_copy.to_string_lossy().into_owned(), None);
                if let Some(len) = sectors {
                    track.set_bounds(TrackBounds {
                        start: 0,
                        len: Some(len),
                        pad: 0,
                    });
                }
                verifier.check_against_sidecar(&track, &md5)
            } else {
                Err(BurnError::Internal(anyhow!(
                    "give --md5 FILE, or point at a mounted disc root holding a checksum manifest"
                )))
            }
        },
        &monitor,
        |report| apply_fraction(&pb, report),
    );

    match result {
        Ok(VerifyOutcome::Success) => {
            pb.set_position(1000);
            pb.finish_with_message("Integrity check successful.");
            println!(
                "\n✨ No corrupted files on {}.",
                style(target.display()).cyan()
            );
            Ok(())
        }
        Ok(VerifyOutcome::BadChecksum(wrong)) => {
            pb.finish_and_clear();
            println!("{} The following items appear to be corrupted:", style("ERROR:").red().bold());
            for item in &wrong {
                println!("  {}", style(item).red());
            }
            Err(anyhow!("{} item(s) failed the integrity check", wrong.len()))
        }
        Err(err) if err.is_cancelled() => {
            pb.finish_and_clear();
            println!("Check cancelled.");
            Ok(())
        }
        Err(err) => {
            pb.finish_and_clear();
            Err(err.into())
        }
    }
}

fn cmd_list() -> Result<()> {
    let drives = scorch_core::platform::get_optical_drives()?;
    if drives.is_empty() {
        println!("No optical drives found.");
        return Ok(());
    }

    println!("Found {} optical drives:", drives.len());
    println!("\n  {:<12} {:<28} {}", "DEVICE", "MODEL", "MEDIUM");
    println!("  {:-<12} {:-<28} {:-<20}", "", "", "");
    for drive in drives {
        let medium = if drive.mount_point.is_empty() {
            "(Not mounted)".to_string()
        } else {
            drive.mount_point
        };
        println!(
            "  {:<12} {:<28} {}",
            drive.path.display(),
            drive.model,
            medium
        );
    }

    Ok(())
}
