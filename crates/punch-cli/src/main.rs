use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

// `#[zbus::proxy]` generates `AttendanceProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.punchclock.Attendance1",
    default_service = "org.punchclock.Attendance1",
    default_path = "/org/punchclock/Attendance1"
)]
trait Attendance {
    async fn start_session(&self) -> zbus::Result<String>;
    async fn stop_session(&self) -> zbus::Result<bool>;
    async fn poll_result(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn enroll(&self, name: &str, embeddings_json: &str) -> zbus::Result<u32>;
    async fn enroll_from_camera(&self, name: &str, samples: u32) -> zbus::Result<u32>;
    async fn remove_identity(&self, name: &str) -> zbus::Result<bool>;
    async fn reload_gallery(&self) -> zbus::Result<u32>;
    async fn today_records(&self) -> zbus::Result<String>;
    async fn present(&self) -> zbus::Result<String>;
    async fn stats(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "punch", about = "Punchclock attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true, env = "PUNCH_SESSION_BUS")]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a recognition session
    Start,
    /// Stop the running session
    Stop,
    /// Show daemon status
    Status,
    /// Follow the running session's results
    Watch {
        /// Poll interval in milliseconds
        #[arg(short, long, default_value_t = 200)]
        interval: u64,
    },
    /// Enroll (or re-enroll) an identity from the camera or a JSON file of embeddings
    Enroll {
        name: String,
        /// File holding an array of 128-float arrays
        #[arg(short, long, conflicts_with = "camera", required_unless_present = "camera")]
        embeddings: Option<PathBuf>,
        /// Capture samples with the daemon's camera instead
        #[arg(long)]
        camera: bool,
        /// Frames with exactly one face to keep when using --camera
        #[arg(long, default_value_t = 20)]
        samples: u32,
    },
    /// Remove an enrolled identity
    Remove { name: String },
    /// Reload the gallery from the database
    Reload,
    /// Today's attendance records
    Today,
    /// Identities currently punched in
    Present,
    /// Today's attendance statistics
    Stats,
    /// List V4L2 capture devices
    Devices,
    /// Capture one frame directly from a camera and save it as PNG
    Snapshot {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value = "snapshot.png")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Devices => return list_devices(),
        Commands::Snapshot { device, output } => return snapshot(device, output),
        _ => {}
    }

    let conn = if cli.session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    tracing::debug!(session_bus = cli.session_bus, "connected to D-Bus");
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("punchd is not reachable")?;

    match cli.command {
        Commands::Start => {
            let id = proxy.start_session().await?;
            println!("session started: {id}");
        }
        Commands::Stop => {
            if proxy.stop_session().await? {
                println!("session stopped");
            } else {
                println!("no session was running");
            }
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Watch { interval } => watch(&proxy, Duration::from_millis(interval)).await?,
        Commands::Enroll {
            name,
            embeddings,
            samples,
            ..
        } => {
            let count = match embeddings {
                Some(path) => {
                    let json = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    proxy.enroll(&name, &json).await?
                }
                None => {
                    println!("look at the camera; capturing {samples} sample(s) of {name}");
                    proxy.enroll_from_camera(&name, samples).await?
                }
            };
            println!("enrolled {name} with {count} sample(s)");
        }
        Commands::Remove { name } => {
            if proxy.remove_identity(&name).await? {
                println!("removed {name}");
            } else {
                bail!("no identity named {name}");
            }
        }
        Commands::Reload => {
            let samples = proxy.reload_gallery().await?;
            println!("gallery reloaded: {samples} sample(s)");
        }
        Commands::Today => print_json(&proxy.today_records().await?)?,
        Commands::Present => print_json(&proxy.present().await?)?,
        Commands::Stats => print_json(&proxy.stats().await?)?,
        // Handled above without D-Bus
        Commands::Devices | Commands::Snapshot { .. } => {}
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Print one line per new analysis until interrupted.
async fn watch(proxy: &AttendanceProxy<'_>, interval: Duration) -> Result<()> {
    let mut last = String::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }

        let raw = proxy.poll_result().await?;
        if raw.is_empty() || raw == last {
            continue;
        }
        let analysis: serde_json::Value = serde_json::from_str(&raw)?;
        println!("{}", summarize(&analysis));
        last = raw;
    }
}

/// One-line rendering of a frame analysis.
fn summarize(analysis: &serde_json::Value) -> String {
    let challenge = analysis["challenge"].as_str().unwrap_or("?");
    let gate = if analysis["gate"]["motion_ok"].as_bool() == Some(true)
        && analysis["gate"]["replay_ok"].as_bool() == Some(true)
    {
        "live"
    } else {
        "static"
    };

    let faces: Vec<String> = analysis["faces"]
        .as_array()
        .map(|faces| {
            faces
                .iter()
                .map(|f| {
                    let who = f["recognition"]["name"].as_str().unwrap_or("unknown");
                    let ok = if f["challenge_ok"].as_bool() == Some(true) { "+" } else { "-" };
                    format!("{who}{ok}{}", f["consensus"])
                })
                .collect()
        })
        .unwrap_or_default();

    let mut line = format!("[{challenge}] {gate} faces: {}", faces.join(" "));
    if let Some(commits) = analysis["commits"].as_array() {
        for c in commits {
            line.push_str(&format!(
                " | {} {} at {}",
                c["name"].as_str().unwrap_or("?"),
                c["type"].as_str().unwrap_or("?"),
                c["time"].as_str().unwrap_or("?"),
            ));
        }
    }
    line
}

fn list_devices() -> Result<()> {
    let devices = punch_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("no V4L2 capture devices found");
    }
    for d in devices {
        println!("{}\t{}\t{} ({})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn snapshot(device: &str, output: &Path) -> Result<()> {
    let camera = punch_hw::Camera::open(device)?;
    let mut stream = camera.stream()?;
    stream.discard(4)?;
    let frame = stream.next_frame()?;
    println!(
        "captured {}x{} frame, brightness {:.1}{}",
        frame.width,
        frame.height,
        frame.avg_brightness(),
        if frame.is_dark() { " (dark)" } else { "" }
    );

    let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
        .context("frame size does not match its dimensions")?;
    image
        .save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("saved {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_commit_line() {
        let analysis = serde_json::json!({
            "gate": {"motion_ok": true, "replay_ok": true, "motion_score": 12.5},
            "challenge": "blink",
            "faces": [
                {"region": {}, "recognition": {"status": "known", "name": "alice", "distance": 0.1},
                 "challenge_ok": true, "consensus": 3},
                {"region": {}, "recognition": {"status": "unknown", "best_distance": null},
                 "challenge_ok": false, "consensus": 0}
            ],
            "commits": [{"name": "alice", "date": "2026-03-02", "time": "09:00:00", "type": "Punch-In"}]
        });
        assert_eq!(
            summarize(&analysis),
            "[blink] live faces: alice+3 unknown-0 | alice Punch-In at 09:00:00"
        );
    }

    #[test]
    fn test_summarize_static_frame() {
        let analysis = serde_json::json!({
            "gate": {"motion_ok": false, "replay_ok": true, "motion_score": 0.0},
            "challenge": "turn_left",
            "faces": [],
            "commits": []
        });
        assert_eq!(summarize(&analysis), "[turn_left] static faces: ");
    }

    #[test]
    fn test_cli_parses_enroll() {
        let cli = Cli::try_parse_from(["punch", "enroll", "alice", "--embeddings", "alice.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Enroll { ref name, ref embeddings, camera: false, .. }
                if name == "alice" && embeddings.is_some()
        ));
    }

    #[test]
    fn test_cli_parses_camera_enroll() {
        let cli = Cli::try_parse_from(["punch", "enroll", "bob", "--camera"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Enroll { embeddings: None, camera: true, samples: 20, .. }
        ));

        let cli = Cli::try_parse_from(["punch", "enroll", "bob", "--camera", "--samples", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Enroll { samples: 5, .. }));
    }

    #[test]
    fn test_cli_enroll_needs_exactly_one_source() {
        assert!(Cli::try_parse_from(["punch", "enroll", "bob"]).is_err());
        assert!(Cli::try_parse_from(["punch", "enroll", "bob", "--camera", "--embeddings", "b.json"]).is_err());
    }
}
