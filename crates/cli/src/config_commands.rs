use std::path::{Path, PathBuf};

use {anyhow::Result, clap::Subcommand, secrecy::ExposeSecret};

use switchyard_config::{Severity, SwitchyardConfig, ValidationResult, validate};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Check this file instead of the discovered one.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print where config and data are read from.
    Paths,
}

pub fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Check { file } => check(file.as_deref()),
        ConfigAction::Paths => {
            paths();
            Ok(())
        },
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(file: Option<&Path>) -> Result<()> {
    let (config, source) = match file {
        Some(path) => (switchyard_config::load_config(path)?, Some(path.to_path_buf())),
        None => {
            let found = switchyard_config::find_config_file();
            (switchyard_config::discover_and_load(), found)
        },
    };

    match &source {
        Some(path) => eprintln!("Checking {}\n", path.display()),
        None => eprintln!("No config file found; checking defaults.\n"),
    }

    let result = validate(&config);
    for line in render(&result) {
        eprintln!("  {line}");
    }

    let errors = count(&result, Severity::Error);
    let warnings = count(&result, Severity::Warning);
    if !result.diagnostics.is_empty() {
        eprintln!();
    }
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }
    print_summary(&config);

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn paths() {
    match switchyard_config::find_config_file() {
        Some(path) => println!("config file: {}", path.display()),
        None => println!("config file: (none)"),
    }
    if let Some(dir) = switchyard_config::config_dir() {
        println!("config dir:  {}", dir.display());
    }
    println!("data dir:    {}", switchyard_config::data_dir().display());
}

fn count(result: &ValidationResult, severity: Severity) -> usize {
    result
        .diagnostics
        .iter()
        .filter(|d| d.severity == severity)
        .count()
}

fn render(result: &ValidationResult) -> Vec<String> {
    result
        .diagnostics
        .iter()
        .map(|d| {
            let color = match d.severity {
                Severity::Error => RED,
                Severity::Warning => YELLOW,
            };
            format!("{BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message)
        })
        .collect()
}

fn print_summary(config: &SwitchyardConfig) {
    let auth = match &config.auth.token {
        Some(token) if !token.expose_secret().is_empty() => "token",
        _ => "none",
    };
    eprintln!(
        "\nlisten {}:{}  auth {auth}  call ttl {}s  transfer ttl {}s",
        config.server.bind,
        config.server.port,
        config.limits.pending_call_ttl_secs,
        config.limits.transfer_ttl_secs,
    );
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_line_per_diagnostic() {
        let mut config = SwitchyardConfig::default();
        config.limits.chunk_size = 0;
        config.limits.transfer_ttl_secs = 0;
        let result = validate(&config);
        let lines = render(&result);
        assert_eq!(lines.len(), result.diagnostics.len());
        assert!(lines.iter().any(|l| l.contains("limits.chunk_size")));
        assert_eq!(count(&result, Severity::Error), 2);
    }

    #[test]
    fn checks_an_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        std::fs::write(&path, "[server]\nport = 9000\n").unwrap();
        check(Some(&path)).unwrap();
    }
}
