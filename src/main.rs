use clap::{Parser, Subcommand};
use dirs::home_dir;
use log::{debug, warn};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(windows)]
use std::os::windows::fs::symlink_file as symlink;
use std::path::{Path, PathBuf};
use thiserror::Error;

const LAUNCHER_NAME: &str = "lendctl";
const DAEMON_ADDR: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4466;
const PORT_ENV: &str = "LEND_PORT";
const DEFAULT_HOST: &str = "default";

#[derive(Parser, Debug)]
#[command(
    name = "lendctl",
    version,
    about = "Forward commands to the local lend daemon",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an alias symlink in ~/.lend/bin
    Link { name: String },
    #[command(external_subcommand)]
    Forward(Vec<String>),
}

#[derive(Debug, Error)]
enum LendError {
    #[error("connection failed: {0}")]
    Connect(io::Error),
    #[error("failed to send command {command}: {source}")]
    Send { command: String, source: io::Error },
    #[error("failed to create directory {path}: {source}")]
    Dir { path: PathBuf, source: io::Error },
    #[error("failed to create link {path}: {source}")]
    Link { path: PathBuf, source: io::Error },
    #[error("failed to resolve executable path: {0}")]
    ExePath(io::Error),
}

/// How the binary was reached: by its own name, or through an alias symlink
/// whose name doubles as the remote command.
#[derive(Debug, PartialEq)]
enum Invocation {
    Launcher,
    Alias(String),
}

#[derive(Debug, PartialEq)]
enum Arg {
    Literal(String),
    FileRef { host: String, name: String },
}

#[derive(Debug)]
struct Paths {
    files_dir: PathBuf,
    bin_dir: PathBuf,
}

impl Paths {
    fn resolve() -> Self {
        let lend = home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".lend");
        Self {
            files_dir: lend.join("files"),
            bin_dir: lend.join("bin"),
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), LendError> {
    let mut args = env::args();
    let argv0 = args.next().unwrap_or_default();
    let paths = Paths::resolve();

    match resolve_invocation(&argv0) {
        Invocation::Launcher => {
            let cli = Cli::parse();
            match cli.command {
                Commands::Link { name } => install_alias(&paths, &name),
                Commands::Forward(parts) => {
                    let mut parts = parts.into_iter();
                    // clap never produces an empty external subcommand
                    let command = parts.next().unwrap_or_default();
                    forward(&paths, &command, &parts.collect::<Vec<_>>())
                }
            }
        }
        Invocation::Alias(command) => forward(&paths, &command, &args.collect::<Vec<_>>()),
    }
}

fn resolve_invocation(argv0: &str) -> Invocation {
    let name = Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty() || name == LAUNCHER_NAME {
        Invocation::Launcher
    } else {
        Invocation::Alias(name)
    }
}

fn forward(paths: &Paths, command: &str, args: &[String]) -> Result<(), LendError> {
    let host = resolve_host(&paths.files_dir);
    let message = encode_message(command, args, &host, &paths.files_dir);
    debug!("sending {message:?}");
    send_message(command, &message)
}

/// The current host label namespaces every file reference in this
/// invocation. It is the first non-hidden entry of the link root, in whatever
/// order the filesystem enumerates, or "default" if there is none.
fn resolve_host(files_dir: &Path) -> String {
    if let Ok(entries) = fs::read_dir(files_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                return name;
            }
        }
    }
    DEFAULT_HOST.to_string()
}

fn encode_message(command: &str, args: &[String], host: &str, files_dir: &Path) -> String {
    let mut message = String::new();
    message.push_str(command);
    message.push(' ');
    for raw in args {
        match virtualize(raw, host, files_dir) {
            Arg::Literal(text) => message.push_str(&text),
            Arg::FileRef { host, name } => {
                message.push_str("FILE|");
                message.push_str(&host);
                message.push('/');
                message.push_str(&name);
            }
        }
        message.push(' ');
    }
    message.push('\n');
    message
}

/// Rewrite an argument that names an existing file or directory into a
/// `FILE|<host>/<basename>` token, recording a symlink under the link root so
/// the daemon can resolve it. Anything else passes through verbatim.
fn virtualize(raw: &str, host: &str, files_dir: &Path) -> Arg {
    let Some(canonical) = canonical_file_path(raw) else {
        return Arg::Literal(raw.to_string());
    };
    let Some(name) = canonical.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Arg::Literal(raw.to_string());
    };
    record_symlink(&canonical, files_dir, host, &name);
    Arg::FileRef {
        host: host.to_string(),
        name,
    }
}

fn canonical_file_path(raw: &str) -> Option<PathBuf> {
    let metadata = fs::metadata(raw).ok()?;
    if !metadata.is_file() && !metadata.is_dir() {
        return None;
    }
    fs::canonicalize(raw).ok()
}

/// Symlink creation is best-effort: the token is emitted whether or not the
/// link lands. Colliding basenames keep the first writer's link.
fn record_symlink(target: &Path, files_dir: &Path, host: &str, name: &str) {
    let host_dir = files_dir.join(host);
    if let Err(err) = fs::create_dir_all(&host_dir) {
        warn!("failed to create link directory {}: {err}", host_dir.display());
        return;
    }
    let link_path = host_dir.join(name);
    match symlink(target, &link_path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            match fs::read_link(&link_path) {
                Ok(existing) if existing.as_path() == target => {
                    debug!("link {} already up to date", link_path.display());
                }
                _ => warn!(
                    "link {} already taken, keeping existing target",
                    link_path.display()
                ),
            }
        }
        Err(err) => warn!("failed to link {}: {err}", link_path.display()),
    }
}

fn send_message(command: &str, message: &str) -> Result<(), LendError> {
    let mut stream =
        TcpStream::connect((DAEMON_ADDR, daemon_port())).map_err(LendError::Connect)?;
    stream
        .write_all(message.as_bytes())
        .map_err(|source| LendError::Send {
            command: command.to_string(),
            source,
        })
}

fn daemon_port() -> u16 {
    port_from(env::var(PORT_ENV).ok().as_deref())
}

fn port_from(raw: Option<&str>) -> u16 {
    raw.and_then(|value| value.parse().ok()).unwrap_or(DEFAULT_PORT)
}

fn install_alias(paths: &Paths, name: &str) -> Result<(), LendError> {
    fs::create_dir_all(&paths.bin_dir).map_err(|source| LendError::Dir {
        path: paths.bin_dir.clone(),
        source,
    })?;
    let exe = env::current_exe().and_then(fs::canonicalize).map_err(LendError::ExePath)?;
    let link_path = paths.bin_dir.join(name);
    symlink(&exe, &link_path).map_err(|source| LendError::Link {
        path: link_path,
        source,
    })
}
