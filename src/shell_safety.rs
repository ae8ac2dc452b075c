//! Shell Safety — Command Injection Prevention
//!
//! Provides sanitization and validation utilities for command execution paths.
//! Used wherever subprocess commands are constructed, especially SSH remote
//! execution where arguments are joined into shell strings.
//!
//! # Threat Model
//!
//! - **SSH remote execution:** `ssh host "cmd arg1 arg2"` invokes a shell on the
//!   remote host. Metacharacters in arguments can execute arbitrary commands.
//! - **Direct execution:** `Command::new(cmd).args(args)` does NOT invoke a shell,
//!   so metacharacters are harmless. But we validate anyway as defense-in-depth.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kbisect_rs::shell_safety::{escape_for_ssh, validate_arg};
//!
//! // For SSH remote commands: escape each argument
//! let safe_arg = escape_for_ssh(user_input);
//! let cmd = format!("sbatch --parsable {}", safe_arg);
//! Command::new("ssh").args([host, &cmd]).output()?;
//!
//! // For direct commands: validate (defense-in-depth)
//! validate_arg(user_input)?;
//! Command::new("cargo").arg(user_input).output()?;
//! ```

/// Shell metacharacters that can cause command injection when interpreted
/// by a shell (bash/sh/zsh).
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '`', '$', '(', ')', '{', '}', '<', '>', '\n', '\r', '!', '#', '~', '*', '?',
    '[', ']', '\\', '"', '\'',
];

/// Subset of metacharacters that indicate chaining/injection intent
/// (vs. globbing characters that might appear in legitimate args).
const INJECTION_CHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '\n', '\r'];

/// Validation error for argument checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgValidationError {
    /// The problematic character found.
    pub character: char,
    /// Position in the input string.
    pub position: usize,
    /// The original input (truncated to 100 chars).
    pub input_preview: String,
}

impl std::fmt::Display for ArgValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dangerous character '{}' at position {} in: {}",
            self.character.escape_default(),
            self.position,
            self.input_preview
        )
    }
}

impl std::error::Error for ArgValidationError {}

/// Escape a string for safe inclusion in an SSH command string.
///
/// Wraps the argument in single quotes and escapes any embedded single quotes
/// using the `'\''` pattern (end quote, escaped quote, start quote).
///
/// This is the POSIX-standard way to prevent shell interpretation:
/// - Single-quoted strings pass through literally (no `$`, `\`, `` ` `` expansion)
/// - The only character that needs escaping inside `'...'` is `'` itself
///
/// # Examples
///
/// ```rust,ignore
/// assert_eq!(escape_for_ssh("hello"), "'hello'");
/// assert_eq!(escape_for_ssh("it's"), "'it'\\''s'");
/// assert_eq!(escape_for_ssh("$(rm -rf /)"), "'$(rm -rf /)'");
/// ```
pub fn escape_for_ssh(arg: &str) -> String {
    // Replace each single quote with: end-quote, backslash-quote, start-quote
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

/// Validate that an argument contains no injection-class metacharacters.
///
/// Use this for defense-in-depth on arguments passed to `Command::new().arg()`,
/// which doesn't invoke a shell but where we still want to catch suspicious input.
///
/// Returns Ok(()) if clean, Err with details if a dangerous character is found.
pub fn validate_arg(arg: &str) -> Result<(), ArgValidationError> {
    for (pos, ch) in arg.chars().enumerate() {
        if INJECTION_CHARACTERS.contains(&ch) {
            return Err(ArgValidationError {
                character: ch,
                position: pos,
                input_preview: if arg.len() > 100 {
                    format!("{}...", &arg[..100])
                } else {
                    arg.to_string()
                },
            });
        }
    }
    Ok(())
}

/// Validate that an argument contains no shell metacharacters at all.
///
/// Stricter than [`validate_arg`] — also rejects globbing characters, quotes,
/// and other characters that have special meaning in shells.
pub fn validate_strict(arg: &str) -> Result<(), ArgValidationError> {
    for (pos, ch) in arg.chars().enumerate() {
        if SHELL_METACHARACTERS.contains(&ch) {
            return Err(ArgValidationError {
                character: ch,
                position: pos,
                input_preview: if arg.len() > 100 {
                    format!("{}...", &arg[..100])
                } else {
                    arg.to_string()
                },
            });
        }
    }
    Ok(())
}

/// Build a safe SSH command string from a program and arguments.
///
/// Each argument is individually escaped with [`escape_for_ssh`], then joined.
/// The result is safe to pass as `ssh host "<result>"`.
///
/// # Example
///
/// ```rust,ignore
/// let cmd = build_ssh_command("sbatch", &["--parsable", "/path/to/script.slurm"]);
/// // Returns: "sbatch '--parsable' '/path/to/script.slurm'"
/// ```
pub fn build_ssh_command(program: &str, args: &[&str]) -> String {
    let mut parts = vec![escape_for_ssh(program)];
    for arg in args {
        parts.push(escape_for_ssh(arg));
    }
    parts.join(" ")
}

/// Sanitize a string for use as a filename or identifier component.
///
/// Replaces any character that is not alphanumeric, `-`, `_`, or `.` with `_`.
/// Also prevents path traversal by replacing `/` and `\`.
pub fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
