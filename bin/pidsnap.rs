use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{WrapErr, bail};
use pidsnap::sync::Session;
use pidsnap::{CommandErrorPolicy, Opts, Snapshot, record_snapshot};
use tracing::{Level, error, info};

/// Record the process table of this host into PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "pidsnap", version, about)]
struct Cli {
    /// Debug logging, including every generated SQL statement
    #[arg(short, long)]
    debug: bool,

    /// Roll back a snapshot on the first failed row instead of logging and continuing
    #[arg(long)]
    strict: bool,

    /// Connection URL, e.g. postgres://piduser@db.example.com/piddb
    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    dbname: Option<String>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long, env = "PIDSNAP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// PEM file holding the root certificate the server must chain to [default: server.crt]
    #[arg(long)]
    sslrootcert: Option<PathBuf>,

    #[arg(long, default_value = "/proc")]
    proc_root: PathBuf,

    /// Number of snapshots to take
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Seconds between snapshots
    #[arg(long, default_value_t = 0)]
    interval: u64,

    /// Print each captured process to stdout
    #[arg(long)]
    print: bool,
}

impl Cli {
    fn opts(&self) -> color_eyre::Result<Opts> {
        let mut opts = match &self.url {
            Some(url) => Opts::try_from(url).wrap_err("invalid --url")?,
            None => Opts::new("localhost", "piddb", "piduser", None),
        };
        if let Some(host) = &self.host {
            opts.host.clone_from(host);
        }
        if let Some(port) = self.port {
            opts.port = port;
        }
        if let Some(dbname) = &self.dbname {
            opts.dbname.clone_from(dbname);
        }
        if let Some(user) = &self.user {
            opts.user.clone_from(user);
        }
        if self.password.is_some() {
            opts.password.clone_from(&self.password);
        }
        if let Some(path) = &self.sslrootcert {
            opts.ssl_root_cert.clone_from(path);
        }
        if self.strict {
            opts.on_command_error = CommandErrorPolicy::Abort;
        }
        Ok(opts)
    }
}

fn print_snapshot(snapshot: &Snapshot) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    for record in &snapshot.records {
        writeln!(out, "{record}")?;
    }
    out.flush()
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let mut session = Session::new(cli.opts()?);
    let mut failed = 0;
    for round in 0..cli.count {
        if round > 0 && cli.interval > 0 {
            thread::sleep(Duration::from_secs(cli.interval));
        }

        let snapshot = Snapshot::capture(&cli.proc_root)
            .wrap_err_with(|| format!("failed to read {}", cli.proc_root.display()))?;
        if cli.print {
            print_snapshot(&snapshot)?;
        }

        match record_snapshot(&mut session, &snapshot) {
            Ok(summary) => info!(round, set_id = summary.set_id, rows = summary.rows, "stored"),
            Err(e) if e.is_connection_broken() => {
                return Err(e).wrap_err("lost the database connection");
            }
            Err(e) => {
                error!(round, error = %e, "snapshot not stored");
                failed += 1;
            }
        }
    }

    session.disconnect().wrap_err("failed to close the connection")?;
    if failed > 0 {
        bail!("{failed} of {} snapshots were not stored", cli.count);
    }
    Ok(())
}
