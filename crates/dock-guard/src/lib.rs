//! Command safety validator for user-scripted execution.
//!
//! Pure decision logic, no I/O: given a command string and the configured
//! whitelist, produce a [`Verdict`]. The validator never panics and never
//! errors — malformed input is a denial, not a failure.
//!
//! Layered checks:
//! 1. Quote-aware tokenization (a quoted span is one argument).
//! 2. The base command must be whitelisted.
//! 3. Structural rules per command family: path confinement for `rm`/`mv`/`cp`,
//!    a docker subcommand allow-list with a strict `docker rm` shape, exact
//!    process-kill shapes for `pkill`, and recursive validation of commands
//!    wrapped in `docker exec ... bash -c "..."`.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Nested `docker exec` wrappers beyond this depth are denied outright.
const MAX_EXEC_DEPTH: usize = 8;

/// Docker subcommands users may invoke.
const DOCKER_SUBCOMMANDS: &[&str] = &[
    "run", "start", "stop", "restart", "ps", "logs", "inspect", "pull", "build", "rmi", "volume",
    "rm", "exec",
];

/// System path prefixes that file operations may never touch.
const FORBIDDEN_PREFIXES: &[&str] = &["/etc", "/bin", "/usr", "/var"];

// ─── Verdict ─────────────────────────────────────────────────────────────────

/// The outcome of validating one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Command passed every check.
    Permitted,
    /// Command is denied — the reason is safe to surface to the caller.
    Denied { reason: String },
}

impl Verdict {
    pub fn is_permitted(&self) -> bool {
        matches!(self, Self::Permitted)
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }
}

// ─── Whitelist ───────────────────────────────────────────────────────────────

/// The set of permitted base commands.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, command: &str) -> bool {
        self.entries.contains(command)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Tokenizer ───────────────────────────────────────────────────────────────

/// Split a command line into arguments, honoring single quotes, double quotes,
/// and backslash escapes. Quotes are stripped from the resulting token.
pub fn tokenize(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                in_token = true;
                let quote = c;
                let mut closed = false;
                while let Some(qc) = chars.next() {
                    if qc == quote {
                        closed = true;
                        break;
                    }
                    // Backslash escapes inside double quotes only
                    if quote == '"' && qc == '\\' {
                        match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err("trailing backslash".to_string()),
                        }
                        continue;
                    }
                    current.push(qc);
                }
                if !closed {
                    return Err("unbalanced quote".to_string());
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate a command against the whitelist and structural rules.
pub fn validate(command: &str, whitelist: &Whitelist) -> Verdict {
    validate_at_depth(command, whitelist, 0)
}

fn validate_at_depth(command: &str, whitelist: &Whitelist, depth: usize) -> Verdict {
    if depth > MAX_EXEC_DEPTH {
        return Verdict::denied("Command nesting too deep");
    }

    let tokens = match tokenize(command) {
        Ok(tokens) => tokens,
        Err(reason) => return Verdict::denied(format!("Malformed command: {reason}")),
    };

    validate_tokens(&tokens, whitelist, depth)
}

fn validate_tokens(tokens: &[String], whitelist: &Whitelist, depth: usize) -> Verdict {
    let Some(base) = tokens.first() else {
        return Verdict::denied("Empty command");
    };

    if !whitelist.contains(base) {
        return Verdict::denied(format!("Command not allowed: {base}"));
    }

    match base.as_str() {
        "rm" | "mv" | "cp" => check_file_operation(base, &tokens[1..]),
        "docker" => check_docker(&tokens[1..], whitelist, depth),
        "pkill" => check_pkill(&tokens[1..]),
        // apt-get, curl, sudo, and any other whitelisted command pass on
        // membership alone.
        _ => Verdict::Permitted,
    }
}

// ─── File operations ─────────────────────────────────────────────────────────

/// `rm`, `mv`, `cp`: every non-flag argument must be a path confined to the
/// `/app` tree. One bad path denies the whole command.
fn check_file_operation(base: &str, args: &[String]) -> Verdict {
    for arg in args.iter().filter(|a| !a.starts_with('-')) {
        if let Some(reason) = path_violation(arg) {
            return Verdict::denied(format!("{base}: {reason}: {arg}"));
        }
    }
    Verdict::Permitted
}

/// Returns the rule a path breaks, or None if it is confined to `/app`.
fn path_violation(path: &str) -> Option<&'static str> {
    let normalized = normalize_path(path);

    if normalized == "/" {
        return Some("refusing to operate on filesystem root");
    }
    if normalized.split('/').any(|seg| seg == "..") {
        return Some("parent traversal not allowed");
    }
    for prefix in FORBIDDEN_PREFIXES {
        if normalized == *prefix || normalized.starts_with(&format!("{prefix}/")) {
            return Some("system path not allowed");
        }
    }
    if normalized != "/app" && !normalized.starts_with("/app/") {
        return Some("path outside /app");
    }
    None
}

/// Collapse duplicate separators and strip a trailing slash (keeping root).
fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

// ─── Docker ──────────────────────────────────────────────────────────────────

fn check_docker(args: &[String], whitelist: &Whitelist, depth: usize) -> Verdict {
    let Some(subcommand) = args.first() else {
        return Verdict::denied("docker: missing subcommand");
    };

    if !DOCKER_SUBCOMMANDS.contains(&subcommand.as_str()) {
        return Verdict::denied(format!("docker: subcommand not allowed: {subcommand}"));
    }

    match subcommand.as_str() {
        "rm" => check_docker_rm(&args[1..]),
        "exec" => check_docker_exec(&args[1..], whitelist, depth),
        _ => Verdict::Permitted,
    }
}

/// `docker rm` is only permitted in the literal shape `docker rm [-f] <id>`.
fn check_docker_rm(args: &[String]) -> Verdict {
    let rest: Vec<&String> = match args {
        [flag, rest @ ..] if flag == "-f" => rest.iter().collect(),
        _ => args.iter().collect(),
    };

    match rest.as_slice() {
        [id] if !id.starts_with('-') => Verdict::Permitted,
        [] => Verdict::denied("docker rm: missing container id"),
        _ => Verdict::denied("docker rm: exactly one container id required"),
    }
}

/// `docker exec`: skip exec flags, take the container id, then validate the
/// inner command. A `bash -c "<payload>"` (or `sh -c`) wrapper is unwrapped
/// and its payload validated as a full command string.
fn check_docker_exec(args: &[String], whitelist: &Whitelist, depth: usize) -> Verdict {
    let mut i = 0;

    // Flags before the container id; -u/-w/-e take a value
    while i < args.len() && args[i].starts_with('-') {
        match args[i].as_str() {
            "-u" | "--user" | "-w" | "--workdir" | "-e" | "--env" => i += 2,
            _ => i += 1,
        }
    }

    if i >= args.len() {
        return Verdict::denied("docker exec: missing container id");
    }
    let _container = &args[i];
    i += 1;

    let inner = &args[i..];
    if inner.is_empty() {
        return Verdict::denied("docker exec: missing command");
    }

    let is_shell = matches!(inner[0].as_str(), "bash" | "sh" | "/bin/bash" | "/bin/sh");
    if is_shell && inner.len() >= 3 && inner[1] == "-c" {
        // The payload arrives as one quoted token; re-validate it as a
        // complete command line.
        return validate_at_depth(&inner[2], whitelist, depth + 1);
    }

    if depth + 1 > MAX_EXEC_DEPTH {
        return Verdict::denied("Command nesting too deep");
    }
    validate_tokens(inner, whitelist, depth + 1)
}

// ─── pkill ───────────────────────────────────────────────────────────────────

/// Only two process-kill shapes are permitted: the dev server and the tunnel.
fn check_pkill(args: &[String]) -> Verdict {
    let rest: &[String] = match args {
        [flag, rest @ ..] if flag == "-f" => rest,
        rest => rest,
    };

    if rest.iter().any(|a| a.starts_with('-')) {
        return Verdict::denied("pkill: only the -f flag is allowed");
    }

    // The pattern may arrive quoted (one token) or split across tokens.
    let pattern = rest.join(" ");
    match pattern.as_str() {
        "npm run dev" | "cloudflared" => Verdict::Permitted,
        "" => Verdict::denied("pkill: missing pattern"),
        other => Verdict::denied(format!("pkill: pattern not allowed: {other}")),
    }
}
