//! Shell command normalization and the read-only command policy.
//!
//! The policy is a conservative lexical screen, not a shell parser. It exists so
//! that the terminal tool stays read-only even when the model ignores its
//! instructions; anything it cannot classify is allowed through to the sandbox.

use std::sync::LazyLock;

use regex::Regex;

static BASH_LC_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*bash\s+-lc(?:\s+|$)").expect("valid regex"));
static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'[^']*'").expect("valid regex"));
static DOUBLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:[^"\\]|\\.)*""#).expect("valid regex"));
static REDIRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d*>>?\s*(&\d+|&-|[^\s;|&<>]+)").expect("valid regex"));
static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&&|\|\||[;|\n]|\$\(|`").expect("valid regex"));

/// Programs that modify the filesystem no matter how they are invoked.
const MUTATING_PROGRAMS: &[&str] = &[
    "rm", "rmdir", "mv", "cp", "chmod", "chown", "chgrp", "touch", "mkdir", "tee", "dd",
    "truncate", "ln", "shred", "install", "patch", "unlink",
];

/// Wrappers whose first operand is the program that actually runs.
const PASSTHROUGH_PROGRAMS: &[&str] = &["sudo", "env", "command", "exec", "xargs", "nice", "time"];

/// Shells whose `-c` operand is a whole nested command line.
const SHELL_PROGRAMS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh", "fish"];

/// `git` subcommands that change the working tree, index, refs or remotes.
const MUTATING_GIT_SUBCOMMANDS: &[&str] = &[
    "add", "am", "apply", "checkout", "cherry-pick", "clean", "commit", "fetch", "gc", "init",
    "merge", "mv", "pull", "push", "rebase", "reset", "restore", "revert", "rm", "stash", "switch",
    "update-ref", "worktree",
];

/// Flags that turn the listing forms of `git branch` / `git tag` into writes.
const MUTATING_REF_FLAGS: &[&str] = &[
    "-d", "-D", "--delete", "-m", "-M", "--move", "-c", "-C", "--copy", "-f", "--force",
];

/// Remove a leading `bash -lc` wrapper and one pair of matching quotes wrapping
/// the entire remaining command.
///
/// ```
/// use evaluator::core::command::strip_bash_lc_prefix;
/// assert_eq!(strip_bash_lc_prefix("bash -lc 'ls -la'"), "ls -la");
/// assert_eq!(strip_bash_lc_prefix("echo 'partial quote"), "echo 'partial quote");
/// ```
pub fn strip_bash_lc_prefix(command: &str) -> String {
    let without_prefix = BASH_LC_PREFIX.replace(command, "");
    let cleaned = without_prefix.trim();
    let bytes = cleaned.as_bytes();
    let wrapped = bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[0] == bytes[bytes.len() - 1];
    if wrapped {
        return cleaned[1..cleaned.len() - 1].to_string();
    }
    cleaned.to_string()
}

/// Check that `command` does not obviously mutate the repository.
///
/// Returns a human-readable reason on rejection; the reason is shown to the
/// model as a tool observation.
pub fn check_read_only(command: &str) -> Result<(), String> {
    let unquoted = DOUBLE_QUOTED.replace_all(command, "\"\"");
    let unquoted = SINGLE_QUOTED.replace_all(&unquoted, "''");

    for capture in REDIRECT.captures_iter(&unquoted) {
        let target = &capture[1];
        if !target.starts_with('&') && target != "/dev/null" {
            return Err(format!(
                "output redirection to '{target}' is not allowed; tools are read-only"
            ));
        }
    }

    for segment in SEPARATORS.split(&unquoted) {
        check_segment(segment)?;
    }
    Ok(())
}

fn check_segment(segment: &str) -> Result<(), String> {
    let mut tokens = segment
        .split_whitespace()
        .skip_while(|token| is_env_assignment(token) || PASSTHROUGH_PROGRAMS.contains(token));
    let Some(program) = tokens.next() else {
        return Ok(());
    };
    let args: Vec<&str> = tokens.collect();
    check_invocation(program, &args)
}

fn check_invocation(program: &str, args: &[&str]) -> Result<(), String> {
    let program = program.rsplit('/').next().unwrap_or(program);

    if MUTATING_PROGRAMS.contains(&program) {
        return Err(format!("'{program}' modifies the filesystem; tools are read-only"));
    }
    if runs_inline_code(program, args) {
        return Err(format!(
            "'{program}' with inline code is not allowed; run read-only commands directly"
        ));
    }
    match program {
        "sed" | "perl" if args.iter().any(|arg| is_in_place_flag(arg)) => Err(format!(
            "'{program}' with in-place editing is not allowed; tools are read-only"
        )),
        "git" => check_git(args),
        "find" => check_find(args),
        _ => Ok(()),
    }
}

/// `eval`, `sh -c`, `python -c`, `node -e` and friends hide a second program
/// inside a quoted operand the screen cannot see.
fn runs_inline_code(program: &str, args: &[&str]) -> bool {
    match program {
        "eval" => true,
        "perl" | "ruby" => has_short_flag(args, &['e', 'E']),
        "node" | "nodejs" | "deno" | "bun" => args.iter().any(|arg| {
            matches!(*arg, "-e" | "-p" | "--eval" | "--print")
                || arg.starts_with("--eval=")
                || arg.starts_with("--print=")
        }),
        _ if SHELL_PROGRAMS.contains(&program) => has_short_flag(args, &['c']),
        _ if program.starts_with("python") => has_short_flag(args, &['c']),
        _ => false,
    }
}

/// Any single-dash flag cluster containing one of `wanted`, e.g. `-c` or `-lc`.
fn has_short_flag(args: &[&str], wanted: &[char]) -> bool {
    args.iter().any(|arg| {
        arg.strip_prefix('-')
            .is_some_and(|flags| !flags.starts_with('-') && flags.contains(wanted))
    })
}

fn check_git(args: &[&str]) -> Result<(), String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if matches!(*arg, "-C" | "-c" | "--git-dir" | "--work-tree") {
            iter.next();
            continue;
        }
        if arg.starts_with('-') {
            continue;
        }
        let rest = iter.as_slice();
        let mutating = MUTATING_GIT_SUBCOMMANDS.contains(arg)
            || (matches!(*arg, "branch" | "tag")
                && rest.iter().any(|flag| MUTATING_REF_FLAGS.contains(flag)))
            || (*arg == "tag" && creates_tag(rest));
        if mutating {
            return Err(format!(
                "'git {arg}' changes repository state; only read-only git commands are allowed"
            ));
        }
        return Ok(());
    }
    Ok(())
}

/// `git tag NAME` creates a tag; `git tag`, `git tag -l PATTERN` and
/// `git tag --contains REV` only list.
fn creates_tag(args: &[&str]) -> bool {
    let listing = args
        .iter()
        .any(|arg| matches!(*arg, "-l" | "--list" | "--contains" | "--points-at" | "--merged"));
    !listing && args.iter().any(|arg| !arg.starts_with('-'))
}

fn check_find(args: &[&str]) -> Result<(), String> {
    for (index, arg) in args.iter().enumerate() {
        if *arg == "-delete" {
            return Err("'find -delete' is not allowed; tools are read-only".to_string());
        }
        if matches!(*arg, "-exec" | "-execdir" | "-ok" | "-okdir")
            && let Some(program) = args.get(index + 1)
        {
            let rest = &args[index + 2..];
            let end = rest
                .iter()
                .position(|token| matches!(*token, ";" | "\\;" | "+"))
                .unwrap_or(rest.len());
            check_invocation(program, &rest[..end])
                .map_err(|reason| format!("'find {arg}' is refused: {reason}"))?;
        }
    }
    Ok(())
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// `-i`, `-i.bak`, `-Ei`, `-pi` and `--in-place[=SUFFIX]`.
fn is_in_place_flag(arg: &str) -> bool {
    if arg == "--in-place" || arg.starts_with("--in-place=") {
        return true;
    }
    match arg.strip_prefix('-') {
        Some(flags) if !flags.starts_with('-') => flags
            .chars()
            .take_while(char::is_ascii_alphabetic)
            .any(|c| c == 'i'),
        _ => false,
    }
}
