mod logging;
mod settings;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use rocksync_core::device::{DeviceInfo, DeviceLocator};
use rocksync_core::metadata::LoftyExtractor;
use rocksync_core::sync::index::IndexStore;
use rocksync_core::sync::scanner::{IndexScanner, RootKind, spawn_backfill};
use rocksync_core::sync::transform::CommandPipeline;
use rocksync_core::{SyncEngine, SyncEvent, SyncMode, SyncOutcome};
use serde::Serialize;
use settings::Settings;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Help,
    ShowSettings,
    Devices,
    ScanLibrary,
    ScanDevice(Option<PathBuf>),
    Sync(SyncArgs),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SyncArgs {
    mode: ModeArg,
    selections: Vec<PathBuf>,
    device: Option<PathBuf>,
    verify_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ModeArg {
    #[default]
    Full,
    Partial,
    AddMissing,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        print_help();
        return Ok(CliMode::Help);
    };

    match command.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(CliMode::Help)
        }
        "--show-settings" | "settings" => Ok(CliMode::ShowSettings),
        "devices" | "--devices" => Ok(CliMode::Devices),
        "scan-library" => Ok(CliMode::ScanLibrary),
        "scan-device" => {
            let mut device = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--device" => device = Some(PathBuf::from(required(&mut args, "--device")?)),
                    other => anyhow::bail!("unknown argument: {other}"),
                }
            }
            Ok(CliMode::ScanDevice(device))
        }
        "sync" => {
            let mut sync = SyncArgs::default();
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--mode" => {
                        sync.mode = match required(&mut args, "--mode")?.as_str() {
                            "full" => ModeArg::Full,
                            "partial" => ModeArg::Partial,
                            "add-missing" => ModeArg::AddMissing,
                            other => anyhow::bail!("unknown sync mode: {other}"),
                        }
                    }
                    "--select" => sync
                        .selections
                        .push(PathBuf::from(required(&mut args, "--select")?)),
                    "--device" => {
                        sync.device = Some(PathBuf::from(required(&mut args, "--device")?))
                    }
                    "--verify-only" => sync.verify_only = true,
                    other => anyhow::bail!("unknown argument: {other}"),
                }
            }
            if !sync.selections.is_empty() && sync.mode == ModeArg::Full {
                sync.mode = ModeArg::Partial;
            }
            if sync.mode == ModeArg::Partial && sync.selections.is_empty() {
                anyhow::bail!("--mode partial needs at least one --select");
            }
            Ok(CliMode::Sync(sync))
        }
        other => anyhow::bail!("unknown command: {other}"),
    }
}

fn required(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next()
        .ok_or_else(|| anyhow::anyhow!("{flag} needs a value"))
}

fn print_help() {
    println!(
        "Usage: rocksync <command> [options]\n\
         \n\
         Commands:\n\
         \x20 devices                     list candidate devices as JSON\n\
         \x20 scan-library                refresh the library index\n\
         \x20 scan-device [--device M]    refresh a device index and backfill hashes\n\
         \x20 sync [--mode full|partial|add-missing] [--select REL]... [--device M] [--verify-only]\n\
         \x20 --show-settings             print effective settings as JSON\n\
         \x20 --help                      show this message"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        return Ok(());
    }
    logging::init()?;
    let settings = Settings::from_env();

    match mode {
        CliMode::Help => {}
        CliMode::ShowSettings => print_json(&settings.snapshot())?,
        CliMode::Devices => print_json(&settings.locator().devices())?,
        CliMode::ScanLibrary => scan_library(&settings).await?,
        CliMode::ScanDevice(device) => {
            let device = pick_device(&settings, device.as_ref())?;
            scan_device(&device).await?;
        }
        CliMode::Sync(args) => {
            let code = run_sync(&settings, args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn pick_device(settings: &Settings, requested: Option<&PathBuf>) -> anyhow::Result<DeviceInfo> {
    if let Some(mount) = requested {
        if !mount.is_dir() {
            anyhow::bail!("device mount {} is not a directory", mount.display());
        }
        return Ok(DeviceInfo::probe(mount, None));
    }
    settings
        .locator()
        .devices()
        .into_iter()
        .next()
        .ok_or_else(|| {
            anyhow::anyhow!("no device found; set ROCKSYNC_DEVICE_MOUNTS or pass --device")
        })
}

async fn scan_library(settings: &Settings) -> anyhow::Result<()> {
    let index = IndexStore::open(&settings.library_index).await?;
    let scanner = IndexScanner::new(index, Arc::new(LoftyExtractor));
    let cancel = cancel_on_ctrl_c();
    let outcome = scanner
        .scan(&settings.music_root, RootKind::Library, &cancel)
        .await?;
    print_json(&outcome.summary)
}

#[derive(Serialize)]
struct DeviceScanReport {
    device: DeviceInfo,
    scan: rocksync_core::sync::scanner::ScanSummary,
    backfill: rocksync_core::sync::scanner::BackfillSummary,
}

async fn scan_device(device: &DeviceInfo) -> anyhow::Result<()> {
    let root = device.music_root();
    let index = IndexStore::open_for(RootKind::Device, &root).await?;
    let scanner = IndexScanner::new(index.clone(), Arc::new(LoftyExtractor));
    let cancel = cancel_on_ctrl_c();
    let outcome = scanner.scan(&root, RootKind::Device, &cancel).await?;
    let backfill = spawn_backfill(index, outcome.deferred, cancel).await?;
    print_json(&DeviceScanReport {
        device: device.clone(),
        scan: outcome.summary,
        backfill,
    })
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_sync(settings: &Settings, args: SyncArgs) -> anyhow::Result<i32> {
    let device = pick_device(settings, args.device.as_ref())?;
    let mode = match args.mode {
        ModeArg::Full => SyncMode::Full,
        ModeArg::Partial => SyncMode::Partial(args.selections),
        ModeArg::AddMissing => SyncMode::AddMissing,
    };
    let mut config = settings.sync_config(&device, mode);
    config.verify_only = args.verify_only;

    let mut engine = SyncEngine::new(Arc::new(LoftyExtractor));
    if let Some(command) = &settings.transform_cmd {
        let pipeline = CommandPipeline::parse(command)?;
        engine = engine.with_transform(Arc::new(pipeline));
    }

    info!(
        device = %device.label,
        dest = %config.dest_root.display(),
        mode = config.mode.label(),
        "starting sync"
    );
    let mut handle = engine.start(config)?;
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling sync");
            cancel.cancel();
        }
    });

    let mut finished: Option<SyncOutcome> = None;
    while let Some(event) = handle.events.recv().await {
        if let SyncEvent::Finished(outcome) = event {
            finished = Some(outcome);
            break;
        }
        render_event(event);
    }
    let outcome = match finished {
        Some(outcome) => outcome,
        None => handle.join().await,
    };

    println!("{}", serde_json::to_string(&outcome)?);
    std::io::stdout().flush()?;
    Ok(outcome.code())
}

fn render_event(event: SyncEvent) {
    match event {
        SyncEvent::Log(line) => println!("{line}"),
        SyncEvent::Status(text) => eprintln!("[status] {text}"),
        SyncEvent::Notice(text) => eprintln!("[notice] {text}"),
        SyncEvent::Progress { percent, tooltip } => eprintln!("[{percent:>3}%] {tooltip}"),
        SyncEvent::ReindexDestination(root) => {
            info!(root = %root.display(), "destination index refresh requested")
        }
        SyncEvent::Finished(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("rocksync")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parses_help_mode() {
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parses_show_settings_mode() {
        assert_eq!(
            parse_cli_mode(args(&["--show-settings"])).unwrap(),
            CliMode::ShowSettings
        );
    }

    #[test]
    fn parses_scan_device_with_mount() {
        assert_eq!(
            parse_cli_mode(args(&["scan-device", "--device", "/media/player"])).unwrap(),
            CliMode::ScanDevice(Some(PathBuf::from("/media/player")))
        );
    }

    #[test]
    fn sync_defaults_to_full_mirror() {
        assert_eq!(
            parse_cli_mode(args(&["sync"])).unwrap(),
            CliMode::Sync(SyncArgs::default())
        );
    }

    #[test]
    fn select_implies_partial_mode() {
        let mode = parse_cli_mode(args(&["sync", "--select", "A", "--select", "B/C"])).unwrap();
        let CliMode::Sync(sync) = mode else {
            panic!("expected sync mode");
        };
        assert_eq!(sync.mode, ModeArg::Partial);
        assert_eq!(
            sync.selections,
            vec![PathBuf::from("A"), PathBuf::from("B/C")]
        );
    }

    #[test]
    fn parses_add_missing_verify_only() {
        let mode = parse_cli_mode(args(&[
            "sync",
            "--mode",
            "add-missing",
            "--verify-only",
            "--device",
            "/mnt/ipod",
        ]))
        .unwrap();
        assert_eq!(
            mode,
            CliMode::Sync(SyncArgs {
                mode: ModeArg::AddMissing,
                selections: Vec::new(),
                device: Some(PathBuf::from("/mnt/ipod")),
                verify_only: true,
            })
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_cli_mode(args(&["sync", "--mode", "sideways"])).is_err());
        assert!(parse_cli_mode(args(&["sync", "--mode", "partial"])).is_err());
        assert!(parse_cli_mode(args(&["sync", "--select"])).is_err());
        assert!(parse_cli_mode(args(&["explode"])).is_err());
    }
}
