//! Structured output parsing for device command responses.
//!
//! A [`SchemaRegistry`] maps `(dialect, command)` pairs to extraction
//! schemas. Parsing is strictly best-effort: when no schema exists for a
//! command, or the schema matches nothing in the output, the caller falls
//! back to the raw text — absence of structure is never an error.
//!
//! Extra schemas can be loaded from a template directory supplied as an
//! explicit configuration value; the registry never inspects the process
//! environment to find templates.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::dialect::{CISCO_IOS, CISCO_NXOS};

/// Errors raised while building or loading extraction schemas.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Template directory or file could not be read.
    #[error("failed to read template {0}: {1}")]
    Io(String, #[source] std::io::Error),

    /// Template file was not valid JSON for the schema spec.
    #[error("failed to parse template {0}: {1}")]
    Json(String, #[source] serde_json::Error),

    /// A field or record pattern failed to compile.
    #[error("invalid pattern in template for '{dialect}/{command}': {source}")]
    InvalidPattern {
        dialect: String,
        command: String,
        #[source]
        source: regex::Error,
    },

    /// Template declared neither fields nor a record pattern.
    #[error("template for '{0}/{1}' declares no extraction rules")]
    EmptyTemplate(String, String),
}

/// One named field extracted by the first capture group of its pattern.
struct FieldRule {
    name: String,
    pattern: Regex,
}

/// How a schema turns raw text into records.
enum SchemaKind {
    /// Independent per-field patterns producing a single record.
    SingleRecord { fields: Vec<FieldRule> },
    /// One record per pattern match; named capture groups become fields.
    RecordPerMatch { pattern: Regex },
}

/// Compiled extraction schema for one `(dialect, command)` pair.
pub struct CommandSchema {
    dialect: String,
    command: String,
    kind: SchemaKind,
}

/// Serializable schema description, as stored in template files.
///
/// Exactly one of `fields` / `record_pattern` should be populated.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchemaSpec {
    /// Dialect the schema applies to.
    pub dialect: String,
    /// Command text the schema applies to.
    pub command: String,
    /// Per-field patterns for single-record extraction.
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Record pattern with named capture groups for list output.
    #[serde(default)]
    pub record_pattern: Option<String>,
}

/// Serializable field rule.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FieldSpec {
    /// Field name in the produced record.
    pub name: String,
    /// Pattern whose first capture group is the field value.
    pub pattern: String,
}

impl SchemaSpec {
    /// Compiles the spec into a usable schema.
    pub fn compile(self) -> Result<CommandSchema, SchemaError> {
        let invalid = |source| SchemaError::InvalidPattern {
            dialect: self.dialect.clone(),
            command: self.command.clone(),
            source,
        };

        let kind = if let Some(pattern) = &self.record_pattern {
            SchemaKind::RecordPerMatch {
                pattern: Regex::new(pattern).map_err(invalid)?,
            }
        } else if !self.fields.is_empty() {
            let mut fields = Vec::with_capacity(self.fields.len());
            for field in &self.fields {
                fields.push(FieldRule {
                    name: field.name.clone(),
                    pattern: Regex::new(&field.pattern).map_err(invalid)?,
                });
            }
            SchemaKind::SingleRecord { fields }
        } else {
            return Err(SchemaError::EmptyTemplate(self.dialect, self.command));
        };

        Ok(CommandSchema {
            dialect: self.dialect,
            command: self.command,
            kind,
        })
    }
}

impl CommandSchema {
    /// Applies the schema to raw output.
    ///
    /// Returns `None` when nothing matched, so the caller can fall back to
    /// the raw text.
    pub fn extract(&self, raw: &str) -> Option<Vec<HashMap<String, String>>> {
        match &self.kind {
            SchemaKind::SingleRecord { fields } => {
                let mut record = HashMap::new();
                for field in fields {
                    if let Some(caps) = field.pattern.captures(raw)
                        && let Some(value) = caps.get(1)
                    {
                        record.insert(field.name.clone(), value.as_str().to_string());
                    }
                }
                if record.is_empty() {
                    None
                } else {
                    Some(vec![record])
                }
            }
            SchemaKind::RecordPerMatch { pattern } => {
                let names: Vec<&str> = pattern.capture_names().flatten().collect();
                let records: Vec<HashMap<String, String>> = pattern
                    .captures_iter(raw)
                    .map(|caps| {
                        names
                            .iter()
                            .filter_map(|name| {
                                caps.name(name)
                                    .map(|m| ((*name).to_string(), m.as_str().to_string()))
                            })
                            .collect()
                    })
                    .collect();
                if records.is_empty() { None } else { Some(records) }
            }
        }
    }
}

/// Registry of extraction schemas keyed by `(dialect, command)`.
pub struct SchemaRegistry {
    schemas: HashMap<(String, String), CommandSchema>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    /// Creates a registry preloaded with the built-in device schemas.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for spec in builtin_specs() {
            match spec.compile() {
                Ok(schema) => registry.register(schema),
                Err(err) => panic!("invalid builtin schema: {err}"),
            }
        }
        registry
    }

    /// Registers a schema, replacing any previous one for the same pair.
    pub fn register(&mut self, schema: CommandSchema) {
        self.schemas.insert(
            (schema.dialect.clone(), schema.command.clone()),
            schema,
        );
    }

    /// Loads every `.json` schema spec from an explicitly supplied
    /// template directory. Returns the number of schemas loaded.
    pub fn load_template_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, SchemaError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|err| SchemaError::Io(dir.display().to_string(), err))?;

        let mut loaded = 0;
        for entry in entries {
            let entry = entry.map_err(|err| SchemaError::Io(dir.display().to_string(), err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let name = path.display().to_string();
            let content = std::fs::read_to_string(&path)
                .map_err(|err| SchemaError::Io(name.clone(), err))?;
            let spec: SchemaSpec =
                serde_json::from_str(&content).map_err(|err| SchemaError::Json(name, err))?;
            self.register(spec.compile()?);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Looks up the schema for a `(dialect, command)` pair.
    pub fn schema_for(&self, dialect: &str, command: &str) -> Option<&CommandSchema> {
        self.schemas
            .get(&(dialect.to_string(), command.to_string()))
    }

    /// Parses raw command output into records when a schema exists and
    /// matches. `None` means "use the raw text".
    pub fn parse(
        &self,
        dialect: &str,
        command: &str,
        raw: &str,
    ) -> Option<Vec<HashMap<String, String>>> {
        self.schema_for(dialect, command)
            .and_then(|schema| schema.extract(raw))
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn field(name: &str, pattern: &str) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        pattern: pattern.to_string(),
    }
}

/// Built-in schema specs for the supported dialect families.
fn builtin_specs() -> Vec<SchemaSpec> {
    let inventory_pattern = concat!(
        r#"(?m)^NAME:\s*"(?P<name>[^"]*)",\s*DESCR:\s*"(?P<descr>[^"]*)"\s*\r?\n"#,
        r"\s*PID:\s*(?P<pid>\S*)\s*,\s*VID:\s*(?P<vid>\S*)\s*,\s*SN:\s*(?P<sn>\S+)",
    );

    vec![
        SchemaSpec {
            dialect: CISCO_IOS.to_string(),
            command: "show version".to_string(),
            fields: vec![
                field("hostname", r"(?m)^(\S+)\s+uptime is"),
                field("version", r"Version\s+([^,\s]+)"),
                field("boot_loader", r"(?m)^BOOTLDR:\s*.*?Version\s+([^,\s]+)"),
                field("model", r"(?mi)^cisco\s+(\S+)\s+\("),
                field(
                    "serial",
                    r"(?mi)^(?:System serial number\s*:|Processor board ID)\s*(\S+)",
                ),
            ],
            record_pattern: None,
        },
        SchemaSpec {
            dialect: CISCO_NXOS.to_string(),
            command: "show version".to_string(),
            fields: vec![
                field("hostname", r"(?m)^\s*Device name:\s*(\S+)"),
                field("version", r"(?m)^\s*(?:NXOS|system):\s*version\s*(\S+)"),
                field("boot_loader", r"(?m)^\s*BIOS:\s*version\s*(\S+)"),
            ],
            record_pattern: None,
        },
        SchemaSpec {
            dialect: CISCO_IOS.to_string(),
            command: "show inventory".to_string(),
            fields: Vec::new(),
            record_pattern: Some(inventory_pattern.to_string()),
        },
        SchemaSpec {
            dialect: CISCO_NXOS.to_string(),
            command: "show inventory".to_string(),
            fields: Vec::new(),
            record_pattern: Some(inventory_pattern.to_string()),
        },
    ]
}
