pub mod schema;
pub mod validation;

pub use schema::{
    ClusterSpec, GpuRequest, GpuSpec, Ipv4Cidr, NetworkSpec, NodeResources, NodeRole, NodeSpec,
    RawClusterConfig, StorageBackend, StorageSpec,
};
pub use validation::{validate, ValidationError, ValidationErrors};

use std::path::Path;
use thiserror::Error;

/// Errors while turning a cluster document into a [`ClusterSpec`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse cluster document: {0}")]
    ParseError(String),

    #[error("{0}")]
    Invalid(#[from] ValidationErrors),
}

/// Document syntax, chosen from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => DocumentFormat::Yaml,
            _ => DocumentFormat::Json,
        }
    }
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Strip C-style comments from JSONC content, leaving string literals intact.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                result.push(c);
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
                result.push(c);
            }
            '/' if !in_string && chars.peek() == Some(&'/') => {
                for nc in chars.by_ref() {
                    if nc == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            '/' if !in_string && chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for nc in chars.by_ref() {
                    if prev == '*' && nc == '/' {
                        break;
                    }
                    prev = nc;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

/// Parse a cluster document without validating it
pub fn parse_raw_config(
    content: &str,
    format: DocumentFormat,
) -> Result<RawClusterConfig, ConfigError> {
    match format {
        DocumentFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
        }
        DocumentFormat::Json => serde_json::from_str(&strip_jsonc_comments(content))
            .map_err(|e| ConfigError::ParseError(e.to_string())),
    }
}

/// Parse and validate a cluster document
pub fn parse_cluster_config(
    content: &str,
    format: DocumentFormat,
) -> Result<ClusterSpec, ConfigError> {
    let raw = parse_raw_config(content, format)?;
    Ok(validate(&raw)?)
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load, parse and validate a cluster document from disk.
pub fn load_cluster_file(path: &Path) -> Result<ClusterSpec, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_cluster_config(&content, DocumentFormat::from_path(path))
}
