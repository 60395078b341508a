//! Resource pattern grammar
//!
//! Policies address commands through a small, closed grammar:
//!
//! - `*`: every command in the module,
//! - `cmd`: exact terminal command at the module root,
//! - `group:*`: every command under `group`, any depth,
//! - `group:cmd`: a command directly under `group`,
//! - `group/sub:*`, `group/sub:cmd`: nested-group forms.
//!
//! Patterns are parsed exactly once, when a policy is loaded; matching is a
//! slice comparison with no allocation.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty resource pattern")]
    Empty,
    #[error("resource pattern {pattern:?} has an empty segment")]
    EmptySegment { pattern: String },
    #[error("resource pattern {pattern:?} has more than one ':' separator")]
    ExtraSeparator { pattern: String },
    #[error("resource pattern {pattern:?} has a misplaced '/': groups nest before the ':'")]
    MissingSeparator { pattern: String },
    #[error("resource pattern {pattern:?} contains whitespace")]
    Whitespace { pattern: String },
    #[error("'*' is only valid alone or after ':' in {pattern:?}")]
    MisplacedWildcard { pattern: String },
}

/// One parsed resource pattern from a policy statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePattern {
    /// `*`
    All,
    /// `cmd`
    Command(String),
    /// `group:*` / `group/sub:*`
    GroupAll(Vec<String>),
    /// `group:cmd` / `group/sub:cmd`
    GroupCommand(Vec<String>, String),
}

/// The `/`-separated location of a command inside a module tree: zero or
/// more group names, then the terminal command name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandPath {
    pub groups: Vec<String>,
    pub command: String,
}

impl CommandPath {
    pub fn new(groups: Vec<String>, command: impl Into<String>) -> Self {
        Self { groups, command: command.into() }
    }

    /// A root-level command with no enclosing group.
    pub fn root(command: impl Into<String>) -> Self {
        Self { groups: Vec::new(), command: command.into() }
    }

    /// Parse `group/sub/cmd` into groups + terminal command name.
    pub fn parse(path: &str) -> Result<Self, PatternError> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }
        let mut segments: Vec<String> = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(PatternError::EmptySegment { pattern: path.to_string() });
            }
            segments.push(segment.to_string());
        }
        let command = segments.pop().expect("at least one segment");
        Ok(Self { groups: segments, command })
    }
}

impl fmt::Display for CommandPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in &self.groups {
            write!(f, "{group}/")?;
        }
        write!(f, "{}", self.command)
    }
}

impl ResourcePattern {
    /// Whether this pattern selects the given command location.
    pub fn matches(&self, path: &CommandPath) -> bool {
        match self {
            Self::All => true,
            Self::Command(cmd) => path.groups.is_empty() && path.command == *cmd,
            Self::GroupAll(groups) => {
                path.groups.len() >= groups.len() && path.groups[..groups.len()] == groups[..]
            }
            Self::GroupCommand(groups, cmd) => path.groups == *groups && path.command == *cmd,
        }
    }
}

fn parse_group_path(raw: &str, pattern: &str) -> Result<Vec<String>, PatternError> {
    let mut groups = Vec::new();
    for segment in raw.split('/') {
        if segment.is_empty() {
            return Err(PatternError::EmptySegment { pattern: pattern.to_string() });
        }
        if segment == "*" {
            return Err(PatternError::MisplacedWildcard { pattern: pattern.to_string() });
        }
        groups.push(segment.to_string());
    }
    Ok(groups)
}

impl FromStr for ResourcePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PatternError::Empty);
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(PatternError::Whitespace { pattern: s.to_string() });
        }
        if s == "*" {
            return Ok(Self::All);
        }
        match s.split_once(':') {
            None => {
                if s.contains('*') {
                    return Err(PatternError::MisplacedWildcard { pattern: s.to_string() });
                }
                if s.contains('/') {
                    // `group/cmd` without ':' is not part of the grammar
                    return Err(PatternError::MissingSeparator { pattern: s.to_string() });
                }
                Ok(Self::Command(s.to_string()))
            }
            Some((group_part, command_part)) => {
                if command_part.contains(':') {
                    return Err(PatternError::ExtraSeparator { pattern: s.to_string() });
                }
                if group_part.is_empty() || command_part.is_empty() {
                    return Err(PatternError::EmptySegment { pattern: s.to_string() });
                }
                let groups = parse_group_path(group_part, s)?;
                if command_part == "*" {
                    Ok(Self::GroupAll(groups))
                } else {
                    if command_part.contains('*') {
                        return Err(PatternError::MisplacedWildcard { pattern: s.to_string() });
                    }
                    if command_part.contains('/') {
                        return Err(PatternError::MissingSeparator { pattern: s.to_string() });
                    }
                    Ok(Self::GroupCommand(groups, command_part.to_string()))
                }
            }
        }
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Command(cmd) => write!(f, "{cmd}"),
            Self::GroupAll(groups) => write!(f, "{}:*", groups.join("/")),
            Self::GroupCommand(groups, cmd) => write!(f, "{}:{cmd}", groups.join("/")),
        }
    }
}

// Patterns travel as plain strings in persisted policies and over the wire.
impl Serialize for ResourcePattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourcePattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
