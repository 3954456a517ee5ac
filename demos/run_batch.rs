use std::sync::Arc;

use anyhow::{Context, bail};
use futures::StreamExt;
use netbatch::config::{BatchJob, CoordinatorConfig};
use netbatch::coordinator::RunCoordinator;
use netbatch::events::{ProgressStatus, RunEvent};
use netbatch::session::{Connector, ReplayConnector, ReplayDevice, ReplayResponse, SshConnector};

fn replay_connector(job: &BatchJob) -> ReplayConnector {
    ReplayConnector::new(job.devices.iter().map(|device| {
        let hostname = device.name().replace(|c: char| !c.is_ascii_alphanumeric(), "-");
        let script = job.commands.iter().fold(ReplayDevice::new(hostname), |dev, cmd| {
            dev.respond(
                cmd.clone(),
                ReplayResponse::output([format!("(replayed output of '{cmd}')")]),
            )
        });
        (device.address.clone(), script)
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "--schema") {
        println!("{}", BatchJob::schema_json()?);
        return Ok(());
    }
    let replay = std::env::args().any(|arg| arg == "--replay");
    let Some(job_path) = std::env::args().skip(1).find(|arg| !arg.starts_with("--")) else {
        bail!("usage: run_batch <job.json> [--replay] [--schema]");
    };

    let job = BatchJob::from_path(&job_path).with_context(|| format!("loading {job_path}"))?;
    let connector: Arc<dyn Connector> = if replay {
        println!("dry-run: replaying scripted device shells");
        Arc::new(replay_connector(&job))
    } else {
        Arc::new(SshConnector::default())
    };

    let (devices, commands, options) = job.into_parts();
    let coordinator = RunCoordinator::new(connector, CoordinatorConfig::default());
    coordinator.set_devices(devices)?;
    coordinator.set_commands(commands)?;

    let mut events = coordinator.subscribe();
    let run_id = coordinator.start_run(options).await?;
    println!("run {run_id} started");

    while let Some(event) = events.next().await {
        match event {
            RunEvent::Progress(p) if p.status != ProgressStatus::Connecting => {
                println!("[{}/{}] {} {:?}", p.current, p.total, p.display_name, p.status);
            }
            RunEvent::Progress(p) => println!("  {} {:?}", p.display_name, p.phase),
            RunEvent::Log(log) => println!("  {} | {}", log.display_name, log.line),
            RunEvent::Result(r) => {
                if let Some(error) = &r.error {
                    println!("  {} failed: {error}", r.display_name);
                }
            }
            RunEvent::Completed(summary) => {
                println!(
                    "completed: {} ok, {} failed ({} cancelled) of {}; logs in {}",
                    summary.success_count,
                    summary.fail_count,
                    summary.cancelled_count,
                    summary.total,
                    summary.log_dir.display()
                );
                break;
            }
            RunEvent::Error { message } => bail!("run rejected: {message}"),
        }
    }

    let report = coordinator.export_results().await?;
    println!("results written to {}", report.display());
    Ok(())
}
