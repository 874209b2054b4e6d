//! Host checks before touching the bus
//!
//! All checks run and every problem is reported at once, so the operator
//! can fix them in one go.

use crate::config::{Config, Preflight};
use crate::error::{RebarError, Result};
use std::path::PathBuf;
use tracing::{debug, info};

/// Check privileges, boot parameter and required tools
///
/// # Errors
///
/// Returns `RebarError::Precondition` listing every failed check.
pub fn check(config: &Config) -> Result<()> {
    info!("Running preflight checks");

    let root = rustix::process::geteuid().is_root();
    let cmdline = match std::fs::read_to_string(&config.paths.cmdline) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!("Cannot read {}: {e}", config.paths.cmdline.display());
            None
        }
    };

    let problems = evaluate(&config.preflight, root, cmdline.as_deref(), |tool| {
        find_in_path(tool).is_some()
    });
    if problems.is_empty() {
        info!("Preflight checks passed");
        Ok(())
    } else {
        Err(RebarError::precondition(problems.join("; ")))
    }
}

fn evaluate(
    preflight: &Preflight,
    root: bool,
    cmdline: Option<&str>,
    has_tool: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut problems = Vec::new();

    if !root {
        problems.push("must run as root".to_string());
    }

    let parameter = preflight.boot_parameter.trim();
    if !parameter.is_empty() {
        match cmdline {
            Some(text) if cmdline_has_parameter(text, parameter) => {
                debug!("Boot parameter {parameter} present");
            }
            Some(_) => problems.push(format!("boot parameter {parameter} not set")),
            None => problems.push("kernel command line unreadable".to_string()),
        }
    }

    for tool in &preflight.required_tools {
        if !has_tool(tool) {
            problems.push(format!("{tool} not found in PATH"));
        }
    }

    problems
}

/// Whether the kernel command line carries `parameter`
///
/// `key=value` parameters also match when the value is one entry of a
/// comma-separated list (`pci=noaer,realloc`) or carries its own argument
/// (`pci=realloc=on`). An explicit `=off` does not count.
pub fn cmdline_has_parameter(cmdline: &str, parameter: &str) -> bool {
    let Some((key, value)) = parameter.split_once('=') else {
        return cmdline.split_whitespace().any(|token| token == parameter);
    };

    cmdline
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .filter(|(k, _)| *k == key)
        .flat_map(|(_, values)| values.split(','))
        .any(|item| match item.split_once('=') {
            None => item == value,
            Some((name, arg)) => name == value && arg != "off",
        })
}

/// Searches PATH for an executable, returning the first match.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_plain_and_listed_values() {
        let cmdline = "BOOT_IMAGE=/vmlinuz root=UUID=abcd ro quiet pci=realloc\n";
        assert!(cmdline_has_parameter(cmdline, "pci=realloc"));
        assert!(cmdline_has_parameter("pci=noaer,realloc", "pci=realloc"));
        assert!(cmdline_has_parameter("pci=realloc=on", "pci=realloc"));
        assert!(cmdline_has_parameter("quiet splash", "quiet"));
    }

    #[test]
    fn rejects_near_misses() {
        assert!(!cmdline_has_parameter("pci=noaer", "pci=realloc"));
        assert!(!cmdline_has_parameter("pci=realloc=off", "pci=realloc"));
        assert!(!cmdline_has_parameter("xpci=realloc", "pci=realloc"));
        assert!(!cmdline_has_parameter("pci=reallocate", "pci=realloc"));
        assert!(!cmdline_has_parameter("", "pci=realloc"));
    }

    #[test]
    fn collects_every_problem() {
        let preflight = Preflight::default();
        let problems = evaluate(&preflight, false, Some("quiet"), |_| false);
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(problems[0].contains("root"));
        assert!(problems[1].contains("pci=realloc"));
        assert!(problems[2].contains("modprobe"));
    }

    #[test]
    fn passes_when_satisfied() {
        let preflight = Preflight::default();
        assert!(evaluate(&preflight, true, Some("pci=realloc"), |_| true).is_empty());
    }

    #[test]
    fn empty_boot_parameter_is_not_checked() {
        let preflight = Preflight {
            boot_parameter: String::new(),
            required_tools: Vec::new(),
        };
        assert!(evaluate(&preflight, true, None, |_| false).is_empty());
        assert!(!evaluate(&Preflight::default(), true, None, |_| true).is_empty());
    }
}
