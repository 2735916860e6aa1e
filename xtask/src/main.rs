//! xtask: Development tasks for serbridge
//!
//! Run with: `cargo xtask <command>`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for serbridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Workspace tests, then the fuzz harnesses in smoke mode
    Test,
    /// Fuzz the ring and spillover models with bolero
    Fuzz {
        /// Harness to fuzz; without one every harness runs once as a test
        target: Option<String>,
    },
    /// Run the shared scenarios against a real serial port with TX looped to RX
    SerialTest {
        /// Port path, e.g. /dev/ttyUSB0
        port: String,
    },
    /// Run the loopback example
    Demo,
    /// Run clippy on all code
    Clippy,
    /// Check formatting
    Fmt {
        /// Fix formatting issues instead of just checking
        #[arg(long)]
        fix: bool,
    },
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn workspace_root() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::current_dir()?.join("xtask"),
    };
    let root = manifest_dir.parent().ok_or("xtask has no parent directory")?;
    Ok(root.to_path_buf())
}

/// bolero harnesses under `fuzz/tests/`.
const FUZZ_TARGETS: &[(&str, &str)] = &[
    ("byte_ring", "push/drain/skip on random ring geometries"),
    ("spillover", "extend/take sequences on the spillover FIFO"),
];

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let root = workspace_root()?;
    let fuzz_dir = root.join("fuzz");
    sh.change_dir(&root);

    match cli.command {
        Commands::Test => {
            let nextest = cmd!(sh, "cargo nextest --version").quiet().run().is_ok();
            println!("== workspace tests ({}) ==", if nextest { "nextest" } else { "cargo test" });
            if nextest {
                cmd!(sh, "cargo nextest run --workspace").run()?;
            } else {
                cmd!(sh, "cargo test --workspace").run()?;
            }

            println!("== fuzz harnesses, smoke mode ==");
            let _fuzz = sh.push_dir(&fuzz_dir);
            cmd!(sh, "cargo test").run()?;
        }
        Commands::Fuzz { target: None } => {
            println!("== fuzz harnesses, smoke mode ==");
            for (name, what) in FUZZ_TARGETS {
                println!("  {name:<10} {what}");
            }
            println!("pass a target name to fuzz it for real");

            let _fuzz = sh.push_dir(&fuzz_dir);
            cmd!(sh, "cargo test").run()?;
        }
        Commands::Fuzz { target: Some(target) } => {
            if !FUZZ_TARGETS.iter().any(|(name, _)| *name == target) {
                return Err(format!("unknown fuzz target {target:?}").into());
            }
            if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
                return Err("cargo-bolero is required: cargo install cargo-bolero".into());
            }

            println!("== fuzzing {target} (Ctrl+C stops) ==");
            let _fuzz = sh.push_dir(&fuzz_dir);
            cmd!(sh, "cargo bolero test {target}").run()?;
        }
        Commands::SerialTest { port } => {
            println!("== loopback scenarios on {port} ==");
            let _env = sh.push_env("SERBRIDGE_LOOPBACK_PORT", &port);
            cmd!(sh, "cargo test -p serbridge-serialport -- --ignored --test-threads=1").run()?;
        }
        Commands::Demo => {
            cmd!(sh, "cargo run --example loopback -p serbridge").run()?;
        }
        Commands::Clippy => {
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
            let _fuzz = sh.push_dir(&fuzz_dir);
            cmd!(sh, "cargo clippy --all-targets -- -D warnings").run()?;
        }
        Commands::Fmt { fix } => {
            let check: &[&str] = if fix { &[] } else { &["--", "--check"] };
            cmd!(sh, "cargo fmt --all {check...}").run()?;
            let _fuzz = sh.push_dir(&fuzz_dir);
            cmd!(sh, "cargo fmt {check...}").run()?;
        }
    }

    Ok(())
}
