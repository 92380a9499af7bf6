use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn register_student(&self, full_name: &str, roll_no: &str) -> zbus::Result<String>;
    fn register_student_from_image(&self, full_name: &str, roll_no: &str, path: &str) -> zbus::Result<String>;
    fn list_students(&self) -> zbus::Result<String>;
    fn start_scan(&self) -> zbus::Result<u32>;
    fn stop_scan(&self) -> zbus::Result<bool>;
    fn mark_attendance(&self, student_id: &str, status: &str) -> zbus::Result<String>;
    fn attendance_today(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from the camera (or an image file)
    Register {
        /// Full name
        #[arg(short, long)]
        name: String,
        /// Roll number; must be unique
        #[arg(short, long)]
        roll: String,
        /// Use a still image instead of capturing from the camera
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// List registered students
    Students,
    /// Start or stop the attendance scanner
    Scan {
        #[command(subcommand)]
        action: ScanAction,
    },
    /// Follow scanner messages until interrupted
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
    },
    /// Mark attendance for a student by id
    Mark {
        student_id: String,
        /// Present, Absent or Late
        #[arg(short, long, default_value = "Present")]
        status: String,
    },
    /// Show today's attendance
    Today {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Show daemon status
    Status,
    /// List video capture devices
    Devices,
    /// Capture one frame directly from a camera (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
    },
}

#[derive(Subcommand)]
enum ScanAction {
    Start,
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Test { device } => camera_test(&device),
        command => run_remote(command, cli.system).await,
    }
}

async fn run_remote(command: Commands, system: bool) -> Result<()> {
    let system = system || std::env::var("ROLLCALL_BUS").as_deref() == Ok("system");
    let conn = if system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("connecting to rollcalld (is the daemon running?)")?;

    match command {
        Commands::Register { name, roll, image } => {
            let reply = match image {
                Some(path) => {
                    // The daemon resolves paths against its own working directory.
                    let path = std::fs::canonicalize(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let path = path.to_str().context("image path is not valid UTF-8")?;
                    proxy.register_student_from_image(&name, &roll, path).await?
                }
                None => {
                    println!("Look at the camera...");
                    proxy.register_student(&name, &roll).await?
                }
            };
            let student: Value = serde_json::from_str(&reply)?;
            println!(
                "Student registered successfully! {} ({}) id={}",
                text(&student["full_name"]),
                text(&student["roll_no"]),
                text(&student["id"])
            );
        }
        Commands::Students => {
            let students: Value = serde_json::from_str(&proxy.list_students().await?)?;
            print!("{}", format_students(&students));
        }
        Commands::Scan { action: ScanAction::Start } => {
            let references = proxy.start_scan().await?;
            println!("Scanning with {references} registered face(s).");
        }
        Commands::Scan { action: ScanAction::Stop } => {
            if proxy.stop_scan().await? {
                println!("Scanner stopped.");
            } else {
                println!("Scanner was not running.");
            }
        }
        Commands::Watch { interval_ms } => watch(&proxy, Duration::from_millis(interval_ms)).await?,
        Commands::Mark { student_id, status } => {
            let record: Value = serde_json::from_str(&proxy.mark_attendance(&student_id, &status).await?)?;
            println!("Attendance marked successfully ({}).", text(&record["status"]));
        }
        Commands::Today { json } => {
            let reply = proxy.attendance_today().await?;
            if json {
                println!("{reply}");
            } else {
                print!("{}", format_today(&serde_json::from_str(&reply)?));
            }
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Devices | Commands::Test { .. } => bail!("command does not need the daemon"),
    }

    Ok(())
}

async fn watch(proxy: &AttendanceProxy<'_>, interval: Duration) -> Result<()> {
    let mut last = String::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let status: Value = serde_json::from_str(&proxy.status().await?)?;
        let scan = &status["scan"];
        let line = format!("[{}] {}", text(&scan["phase"]), text(&scan["message"]));
        if line != last {
            println!("{line}");
            last = line;
        }
        if scan["active"] == Value::Bool(false) {
            println!("Scanner is not running; start it with `rollcall scan start`.");
            return Ok(());
        }
    }
}

fn list_devices() -> Result<()> {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        bail!("no video capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn camera_test(device: &str) -> Result<()> {
    let mut camera = rollcall_hw::Camera::open(device)?;
    println!(
        "{}: {}x{} {:?}",
        camera.device_path, camera.width, camera.height, camera.pixel_format
    );
    let frame = camera.capture_frame()?;
    println!(
        "frame #{}: average brightness {:.1}{}",
        frame.sequence,
        frame.avg_brightness(),
        if frame.is_dark() { " (dark: lens covered or no light?)" } else { "" }
    );
    Ok(())
}

fn text(v: &Value) -> &str {
    v.as_str().unwrap_or("-")
}

fn format_students(students: &Value) -> String {
    let Some(rows) = students.as_array().filter(|r| !r.is_empty()) else {
        return "No students registered.\n".to_string();
    };
    let mut out = format!("{:<12} {:<28} {:<5} {}\n", "Roll No", "Name", "Face", "Id");
    for s in rows {
        let face = if s["has_descriptor"] == Value::Bool(true) { "yes" } else { "no" };
        out.push_str(&format!(
            "{:<12} {:<28} {:<5} {}\n",
            text(&s["roll_no"]),
            text(&s["full_name"]),
            face,
            text(&s["id"])
        ));
    }
    out
}

fn format_today(entries: &Value) -> String {
    let Some(rows) = entries.as_array().filter(|r| !r.is_empty()) else {
        return "No attendance marked today.\n".to_string();
    };
    let mut out = format!("{:<12} {:<10} {:<28} {:<12} {}\n", "Date", "Time", "Name", "Roll No", "Status");
    for e in rows {
        let (date, time) = match DateTime::parse_from_rfc3339(text(&e["recorded_at"])) {
            Ok(t) => {
                let t = t.with_timezone(&Local);
                (t.format("%Y-%m-%d").to_string(), t.format("%H:%M:%S").to_string())
            }
            Err(_) => (text(&e["date"]).to_string(), "-".to_string()),
        };
        out.push_str(&format!(
            "{:<12} {:<10} {:<28} {:<12} {}\n",
            date,
            time,
            text(&e["full_name"]),
            text(&e["roll_no"]),
            text(&e["status"])
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parses_register_with_image() {
        let cli = Cli::try_parse_from(["rollcall", "register", "--name", "Ada", "--roll", "R-1", "--image", "ada.png"])
            .unwrap();
        match cli.command {
            Commands::Register { name, roll, image } => {
                assert_eq!(name, "Ada");
                assert_eq!(roll, "R-1");
                assert_eq!(image, Some(PathBuf::from("ada.png")));
            }
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_mark_defaults_to_present() {
        let cli = Cli::try_parse_from(["rollcall", "mark", "abc"]).unwrap();
        assert!(matches!(cli.command, Commands::Mark { ref status, .. } if status == "Present"));
    }

    #[test]
    fn test_scan_requires_action() {
        assert!(Cli::try_parse_from(["rollcall", "scan"]).is_err());
        let cli = Cli::try_parse_from(["rollcall", "--system", "scan", "stop"]).unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Scan { action: ScanAction::Stop }));
    }

    #[test]
    fn test_format_today_table() {
        let entries = json!([{
            "id": "a1",
            "student_id": "s1",
            "date": "2024-03-05",
            "recorded_at": "2024-03-05T09:15:00+00:00",
            "status": "Present",
            "roll_no": "R-001",
            "full_name": "Ada Lovelace"
        }]);
        let out = format_today(&entries);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Date"));
        assert!(lines[1].contains("Ada Lovelace"));
        assert!(lines[1].contains("R-001"));
        assert!(lines[1].ends_with("Present"));
    }

    #[test]
    fn test_format_empty_lists() {
        assert_eq!(format_today(&json!([])), "No attendance marked today.\n");
        assert_eq!(format_students(&json!([])), "No students registered.\n");
    }

    #[test]
    fn test_format_students_flags_missing_face() {
        let out = format_students(&json!([
            {"id": "s1", "roll_no": "R-1", "full_name": "Ada", "has_descriptor": true},
            {"id": "s2", "roll_no": "R-2", "full_name": "Grace", "has_descriptor": false}
        ]));
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[1].contains("yes"));
        assert!(lines[2].contains(" no "));
    }
}
