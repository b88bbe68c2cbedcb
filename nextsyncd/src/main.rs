use std::path::PathBuf;

use nextsync_core::NameCollisionPolicy;
use nextsyncd::config::DaemonConfig;
use nextsyncd::daemon::{DaemonRuntime, UploadCommand};
use nextsyncd::transfer::{LocalBehaviour, ResultCode};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: nextsyncd [COMMAND]

Commands:
  (none)                         Run the daemon and retry failed uploads
  upload <LOCAL> <REMOTE> [--policy rename|overwrite|skip|ask-user]
                         [--after copy|move|forget|delete]
                                 Upload one file and wait for the result
  download <REMOTE>              Download one file into the storage area
  retry                          Re-queue failed uploads once
  uploads                        Print stored upload records as JSON lines
  --logout                       Drop the account's transfers and saved password
  --help, -h                     Show this help";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Upload(UploadCommand),
    Download(String),
    Retry,
    ListUploads,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliMode::Run);
    };
    let mode = match first.as_str() {
        "--logout" => CliMode::Logout,
        "--help" | "-h" => CliMode::Help,
        "retry" => CliMode::Retry,
        "uploads" => CliMode::ListUploads,
        "download" => {
            let remote = args.next().ok_or_else(|| anyhow::anyhow!("download needs a remote path"))?;
            CliMode::Download(remote)
        }
        "upload" => {
            let (Some(local), Some(remote)) = (args.next(), args.next()) else {
                anyhow::bail!("upload needs a local and a remote path");
            };
            let mut command = UploadCommand {
                local_path: PathBuf::from(local),
                remote_path: remote,
                policy: NameCollisionPolicy::default(),
                behaviour: LocalBehaviour::default(),
            };
            while let Some(flag) = args.next() {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("{flag} needs a value"))?;
                match flag.as_str() {
                    "--policy" => {
                        command.policy = NameCollisionPolicy::parse(&value)
                            .ok_or_else(|| anyhow::anyhow!("unknown policy: {value}"))?;
                    }
                    "--after" => {
                        command.behaviour = LocalBehaviour::parse(&value)
                            .ok_or_else(|| anyhow::anyhow!("unknown local behaviour: {value}"))?;
                    }
                    other => anyhow::bail!("unknown argument: {other}"),
                }
            }
            return Ok(CliMode::Upload(command));
        }
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unknown argument: {extra}");
    }
    Ok(mode)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Logout => daemon.logout().await,
        CliMode::Upload(command) => {
            let outcome = daemon.upload(command).await?;
            anyhow::ensure!(
                outcome.code == ResultCode::Ok,
                "upload failed: {}",
                outcome.code.as_str()
            );
            println!("{}", outcome.final_path.unwrap_or_default());
            Ok(())
        }
        CliMode::Download(remote) => {
            let outcome = daemon.download(remote).await?;
            anyhow::ensure!(
                outcome.code == ResultCode::Ok,
                "download failed: {}",
                outcome.code.as_str()
            );
            Ok(())
        }
        CliMode::Retry => {
            let requeued = daemon.retry().await?;
            println!("{requeued}");
            Ok(())
        }
        CliMode::ListUploads => {
            for line in daemon.upload_lines().await? {
                println!("{line}");
            }
            Ok(())
        }
        CliMode::Run | CliMode::Help => daemon.run().await,
    }
}
