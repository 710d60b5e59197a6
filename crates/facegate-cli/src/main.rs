use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.freedesktop.Facegate1",
    default_service = "org.freedesktop.Facegate1",
    default_path = "/org/freedesktop/Facegate1"
)]
trait Facegate {
    fn verify(&self, image: &[u8]) -> zbus::Result<String>;

    fn register(
        &self,
        display_name: &str,
        contact: &str,
        image: &[u8],
        quarantine_id: &str,
    ) -> zbus::Result<String>;

    fn list_unknown(&self, limit: u32) -> zbus::Result<String>;

    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face identity CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the face in an image
    Verify {
        /// Image file containing exactly one face
        image: PathBuf,
    },
    /// Register a new user from a face image
    Register {
        #[arg(short, long)]
        name: String,
        /// Email-like contact handle
        #[arg(short, long)]
        contact: String,
        /// Quarantine record to promote into this user
        #[arg(short, long)]
        quarantine_id: Option<String>,
        image: PathBuf,
    },
    /// List unrecognized faces awaiting registration
    Unknown {
        /// Maximum number of entries (default: daemon setting)
        #[arg(short, long, default_value_t = 0)]
        limit: u32,
    },
    /// Show daemon status
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    };
    let conn = conn.context("connecting to D-Bus")?;
    let proxy = FacegateProxy::new(&conn)
        .await
        .context("facegated is not reachable")?;
    tracing::debug!(session = cli.session, "connected to facegated");

    let response = match cli.command {
        Commands::Verify { image } => proxy.verify(&read_image(&image)?).await?,
        Commands::Register {
            name,
            contact,
            quarantine_id,
            image,
        } => {
            proxy
                .register(
                    &name,
                    &contact,
                    &read_image(&image)?,
                    quarantine_id.as_deref().unwrap_or(""),
                )
                .await?
        }
        Commands::Unknown { limit } => proxy.list_unknown(limit).await?,
        Commands::Status => proxy.status().await?,
    };

    print_json(&response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let cli = Cli::try_parse_from([
            "facegate", "register", "--name", "Ann", "--contact", "ann@x.com", "-q",
            "0f8b7c7e-3d65-4b1f-9a52-1d5b0f3c2a10", "ann.png",
        ])
        .unwrap();
        match cli.command {
            Commands::Register {
                name,
                quarantine_id,
                image,
                ..
            } => {
                assert_eq!(name, "Ann");
                assert!(quarantine_id.is_some());
                assert_eq!(image, PathBuf::from("ann.png"));
            }
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_parse_unknown_default_limit() {
        let cli = Cli::try_parse_from(["facegate", "--session", "unknown"]).unwrap();
        assert!(cli.session);
        assert!(matches!(cli.command, Commands::Unknown { limit: 0 }));
    }

    #[test]
    fn test_verify_requires_image() {
        assert!(Cli::try_parse_from(["facegate", "verify"]).is_err());
    }
}
