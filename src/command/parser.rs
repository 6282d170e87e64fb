//! Text command parsing.
//!
//! Two command surfaces share one grammar entry point:
//!
//! - a positioning-language subset (`G0`/`G1` moves with `X` and `F` words,
//!   `G90`/`G91` mode switches), and
//! - a terminal-style set (`<number>`, `speed <v>`, `cancel`, `pos`, `status`,
//!   `help`, `quit`).
//!
//! Parsing is pure: it produces a [`Command`] and never consults or mutates
//! control state. Token matching is case-insensitive.

use thiserror::Error;

use crate::config::Protocol;
use crate::control::PositioningMode;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("Unknown or unsupported command: {0}")]
    Unknown(String),
    #[error("Invalid number '{value}' in: {line}")]
    InvalidNumber { line: String, value: String },
    #[error("Usage: {0}")]
    Usage(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    /// `G0`
    Rapid,
    /// `G1`
    Linear,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Positioning-language move; `x` is read in the current positioning mode.
    Move { kind: MoveKind, x: Option<f64>, feedrate: Option<f64> },
    /// Terminal-style bare number: always absolute.
    MoveTo(f64),
    SetMode(PositioningMode),
    SpeedLimit(f64),
    Cancel,
    QueryPosition,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "Commands: <pos> | speed <0-1000> | cancel | pos | status | help | quit\n\
G-code: G0 X<mm> | G1 X<mm> [F<feed>] | G90 (absolute) | G91 (relative)";

/// Parse one trimmed line under the given protocol selection.
pub fn parse_line(line: &str, protocol: Protocol) -> Result<Command, CommandError> {
    let line = line.trim();
    let is_gcode = is_positioning_line(line);
    match (protocol, is_gcode) {
        (Protocol::Gcode, true) | (Protocol::Both, true) => parse_positioning(line),
        (Protocol::Terminal, false) | (Protocol::Both, false) => parse_terminal(line),
        _ => Err(CommandError::Unknown(line.to_string())),
    }
}

/// `G` followed by a digit.
fn is_positioning_line(line: &str) -> bool {
    let mut chars = line.chars();
    matches!(chars.next(), Some('g' | 'G')) && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn parse_positioning(line: &str) -> Result<Command, CommandError> {
    let upper = line.to_ascii_uppercase();
    let code_len = upper[1..].chars().take_while(|c| c.is_ascii_digit()).count();
    let code: u32 = upper[1..1 + code_len]
        .parse()
        .map_err(|_| CommandError::Unknown(upper.clone()))?;
    let params = &upper[1 + code_len..];

    match code {
        0 => Ok(Command::Move { kind: MoveKind::Rapid, x: finite_param(params, 'X', line)?, feedrate: None }),
        1 => Ok(Command::Move {
            kind: MoveKind::Linear,
            x: finite_param(params, 'X', line)?,
            feedrate: finite_param(params, 'F', line)?,
        }),
        90 => Ok(Command::SetMode(PositioningMode::Absolute)),
        91 => Ok(Command::SetMode(PositioningMode::Relative)),
        _ => Err(CommandError::Unknown(upper)),
    }
}

/// Value of the word introduced by `letter`, or `None` when the letter is
/// absent or nothing numeric follows it (the caller supplies the default).
pub fn extract_param(params: &str, letter: char) -> Option<f64> {
    param_text(params, letter).and_then(|text| text.parse().ok())
}

fn param_text(params: &str, letter: char) -> Option<&str> {
    let start = params.find(letter)? + letter.len_utf8();
    scan_number(&params[start..])
}

/// Like [`extract_param`], but a value too large to represent is an error
/// rather than infinity.
fn finite_param(params: &str, letter: char, line: &str) -> Result<Option<f64>, CommandError> {
    match extract_param(params, letter) {
        Some(v) if !v.is_finite() => Err(CommandError::InvalidNumber {
            line: line.to_string(),
            value: format!("{}{}", letter, param_text(params, letter).unwrap_or_default()),
        }),
        other => Ok(other),
    }
}

/// Leading numeric text: an optional leading `-`, digits, at most one `.`.
/// Stops at the first character outside that set. `None` if no digit was seen.
pub fn scan_number(text: &str) -> Option<&str> {
    let mut end = 0;
    let mut seen_point = false;
    let mut seen_digit = false;
    for (i, c) in text.char_indices() {
        match c {
            '-' if i == 0 => {}
            '.' if !seen_point => seen_point = true,
            d if d.is_ascii_digit() => seen_digit = true,
            _ => break,
        }
        end = i + c.len_utf8();
    }
    seen_digit.then(|| &text[..end])
}

fn parse_terminal(line: &str) -> Result<Command, CommandError> {
    let lower = line.to_ascii_lowercase();
    let mut words = lower.split_whitespace();
    let Some(head) = words.next() else {
        return Err(CommandError::Unknown(line.to_string()));
    };

    let command = match head {
        "quit" | "exit" | "q" => Command::Quit,
        "help" | "?" => Command::Help,
        "cancel" => Command::Cancel,
        "pos" => Command::QueryPosition,
        "status" => Command::Status,
        "speed" => {
            let (Some(value), None) = (words.next(), words.next()) else {
                return Err(CommandError::Usage("speed <0-1000>"));
            };
            return parse_finite(value, line).map(Command::SpeedLimit);
        }
        _ => {
            if words.next().is_some() {
                return Err(CommandError::Unknown(line.to_string()));
            }
            return match head.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Command::MoveTo(v)),
                _ => Err(CommandError::Unknown(line.to_string())),
            };
        }
    };

    if words.next().is_some() {
        return Err(CommandError::Unknown(line.to_string()));
    }
    Ok(command)
}

fn parse_finite(value: &str, line: &str) -> Result<f64, CommandError> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(CommandError::InvalidNumber { line: line.to_string(), value: value.to_string() }),
    }
}
