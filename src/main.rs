use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqcache::api::HttpGateway;
use reqcache::cache::{derive_key, Params};
use reqcache::config::Config;
use reqcache::session::Session;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reqcache")]
#[command(about = "Fetch API resources through a shared request cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/reqcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a resource through the cache, repeating to show cache hits
  Fetch {
    /// Resource name, e.g. "employees"
    resource: String,

    /// Query parameter as key=value (value parsed as JSON when possible)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Number of reads to perform
    #[arg(long, default_value_t = 2)]
    repeat: u32,
  },
  /// Print the cache key a query maps to
  Key {
    resource: String,

    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;

  match args.command {
    Command::Fetch {
      resource,
      params,
      repeat,
    } => {
      let config = Config::load(args.config.as_deref())?;
      let gateway = HttpGateway::from_config(&config)?;
      let session = Session::new(gateway, config);
      let params: Params = params.into_iter().collect();

      for _ in 0..repeat.max(1) {
        let result = session.client().fetch(&resource, Some(&params)).await?;
        println!("[{}] {}", result.source, result.data);
      }
    }
    Command::Key { resource, params } => {
      let params: Params = params.into_iter().collect();
      println!("{}", derive_key(&resource, Some(&params)));
    }
  }

  Ok(())
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("REQCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let appender = tracing_appender::rolling::never(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
      Ok(None)
    }
  }
}

/// Parse `key=value`. Values that are valid JSON keep their type.
fn parse_param(s: &str) -> Result<(String, Value), String> {
  let (key, raw) = s
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
  if key.is_empty() {
    return Err(format!("empty parameter name in '{}'", s));
  }

  let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
  Ok((key.to_string(), value))
}
