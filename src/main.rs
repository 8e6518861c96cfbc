use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tally::config::TallyConfig;
use tally::PolicySet;

/// Check `<policy> <key>` requests read from stdin against fixed-window rate limits.
#[derive(Debug, Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print one JSON object per decision
    #[arg(long)]
    json: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Output<'a> {
    Decision {
        policy: &'a str,
        key: &'a str,
        allowed: bool,
    },
    Error {
        error: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Tally");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TallyConfig::load(cli.config.as_deref())?;
    let policies = PolicySet::from_config(&config)?;
    info!(
        policies = ?policies.names(),
        cleanup_interval = ?config.limiter.cleanup_interval(),
        "Policies loaded"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = process_requests(&policies, stdin, stdout, cli.json) => result?,
        _ = shutdown_signal() => {
            policies.shutdown().await;
            info!("Tally stopped");
            // The blocking stdin read cannot be cancelled; exit instead of
            // waiting for the runtime to drain it.
            std::process::exit(0);
        }
    }

    policies.shutdown().await;
    info!("Tally stopped");
    Ok(())
}

/// Logs go to stderr so stdout carries only decisions.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Answer each input line until EOF.
///
/// Malformed lines and unknown policies produce an error line; processing
/// continues with the next line.
async fn process_requests<R, W>(
    policies: &PolicySet,
    input: R,
    mut output: W,
    json: bool,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match parse_request(&line) {
            Some((policy, key)) => match policies.check(policy, key) {
                Ok(allowed) => Output::Decision {
                    policy,
                    key,
                    allowed,
                },
                Err(e) => {
                    warn!(policy = %policy, error = %e, "Rejected malformed request");
                    Output::Error {
                        error: e.to_string(),
                    }
                }
            },
            None => Output::Error {
                error: format!("expected `<policy> <key>`, got `{}`", line.trim()),
            },
        };

        let mut rendered = render(&response, json)?;
        rendered.push('\n');
        output.write_all(rendered.as_bytes()).await?;
        output.flush().await?;
    }

    Ok(())
}

/// Split a request line into `(policy, key)`.
fn parse_request(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split_whitespace();
    let policy = parts.next()?;
    let key = parts.next()?;
    match parts.next() {
        Some(_) => None,
        None => Some((policy, key)),
    }
}

fn render(output: &Output<'_>, json: bool) -> anyhow::Result<String> {
    if json {
        return Ok(serde_json::to_string(output)?);
    }

    Ok(match output {
        Output::Decision { allowed: true, .. } => "allowed".to_string(),
        Output::Decision { allowed: false, .. } => "rejected".to_string(),
        Output::Error { error } => format!("error: {}", error),
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        assert_eq!(parse_request("message alice"), Some(("message", "alice")));
        assert_eq!(parse_request("  ip   10.0.0.1 "), Some(("ip", "10.0.0.1")));
        assert_eq!(parse_request("message"), None);
        assert_eq!(parse_request("message alice extra"), None);
    }

    #[test]
    fn test_render_text() {
        let allowed = Output::Decision {
            policy: "message",
            key: "alice",
            allowed: true,
        };
        let rejected = Output::Decision {
            policy: "message",
            key: "alice",
            allowed: false,
        };
        let error = Output::Error {
            error: "Unknown policy: x".to_string(),
        };

        assert_eq!(render(&allowed, false).unwrap(), "allowed");
        assert_eq!(render(&rejected, false).unwrap(), "rejected");
        assert_eq!(render(&error, false).unwrap(), "error: Unknown policy: x");
    }

    #[test]
    fn test_render_json() {
        let decision = Output::Decision {
            policy: "ip",
            key: "10.0.0.1",
            allowed: true,
        };
        let value: serde_json::Value =
            serde_json::from_str(&render(&decision, true).unwrap()).unwrap();

        assert_eq!(
            value,
            serde_json::json!({ "policy": "ip", "key": "10.0.0.1", "allowed": true })
        );
    }

    fn standard_policies() -> PolicySet {
        PolicySet::from_config(&TallyConfig::default()).unwrap()
    }

    async fn run_lines(policies: &PolicySet, input: &str, json: bool) -> Vec<String> {
        let mut output = Vec::new();
        process_requests(policies, input.as_bytes(), &mut output, json)
            .await
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_requests_text() {
        let policies = standard_policies();
        let input = "message alice\n".repeat(6) + "transaction alice\n";

        let lines = run_lines(&policies, &input, false).await;

        assert_eq!(
            lines,
            vec![
                "allowed", "allowed", "allowed", "allowed", "allowed", "rejected", "allowed"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_requests_continues_after_errors() {
        let policies = standard_policies();
        let input = "message\n\nunknown alice\nip 10.0.0.1 extra\n   \nip 10.0.0.1\n";

        let lines = run_lines(&policies, input, false).await;

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "error: expected `<policy> <key>`, got `message`");
        assert_eq!(lines[1], "error: Unknown policy: unknown");
        assert!(lines[2].starts_with("error: expected"));
        assert_eq!(lines[3], "allowed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_requests_json() {
        let policies = standard_policies();

        let lines = run_lines(&policies, "ip 10.0.0.1\nbogus bob\n", true).await;

        let values: Vec<serde_json::Value> = lines
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(
            values,
            vec![
                serde_json::json!({ "policy": "ip", "key": "10.0.0.1", "allowed": true }),
                serde_json::json!({ "error": "Unknown policy: bogus" }),
            ]
        );
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["tally", "--json", "--log-format", "json", "-c", "tally.yaml"]);
        assert!(cli.json);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("tally.yaml")));
    }
}
