use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;

use crate::domain::SourceKey;
use crate::error::ParseError;

const EXT: &str = r"(?P<ext>[A-Za-z0-9]+(?:\.[A-Za-z0-9]+)?)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingRule {
    Bulk,
    BulkTagged,
    InstanceOnly,
    FieldOnly,
}

impl NamingRule {
    pub const PRIORITY: [NamingRule; 4] = [
        NamingRule::Bulk,
        NamingRule::BulkTagged,
        NamingRule::InstanceOnly,
        NamingRule::FieldOnly,
    ];

    fn pattern(self) -> &'static Regex {
        static BULK: LazyLock<Regex> = LazyLock::new(|| {
            compile(&format!(
                r"^(?P<eid>\d+)_(?P<field>\d+)_(?P<instance>\d+)_(?P<array>\d+)\.{EXT}$"
            ))
        });
        static BULK_TAGGED: LazyLock<Regex> = LazyLock::new(|| {
            compile(&format!(
                r"^(?P<eid>\d+)_(?P<field>\d+)_(?P<instance>\d+)_(?P<array>\d+)_(?P<tags>[A-Za-z0-9]+(?:_[A-Za-z0-9]+)*)\.{EXT}$"
            ))
        });
        static INSTANCE_ONLY: LazyLock<Regex> = LazyLock::new(|| {
            compile(&format!(
                r"^(?P<eid>\d+)_(?P<field>\d+)_(?P<instance>\d+)\.{EXT}$"
            ))
        });
        static FIELD_ONLY: LazyLock<Regex> =
            LazyLock::new(|| compile(&format!(r"^(?P<eid>\d+)_(?P<field>\d+)\.{EXT}$")));

        match self {
            NamingRule::Bulk => &*BULK,
            NamingRule::BulkTagged => &*BULK_TAGGED,
            NamingRule::InstanceOnly => &*INSTANCE_ONLY,
            NamingRule::FieldOnly => &*FIELD_ONLY,
        }
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("naming patterns are valid regular expressions")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuredIdentifier {
    pub subject: String,
    pub instance: Option<u32>,
    pub field: u32,
    pub array: u32,
    pub tags: Vec<String>,
    pub extension: String,
    pub rule: NamingRule,
}

impl StructuredIdentifier {
    pub fn source_key(&self) -> SourceKey {
        SourceKey::new(
            &self.subject,
            self.instance,
            self.field,
            self.array,
            &self.tags,
            &self.extension,
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NamingParser;

impl NamingParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, file_name: &str) -> Result<StructuredIdentifier, ParseError> {
        for rule in NamingRule::PRIORITY {
            if let Some(caps) = rule.pattern().captures(file_name) {
                return build(rule, file_name, &caps);
            }
        }
        Err(ParseError::UnrecognizedPattern(file_name.to_string()))
    }
}

fn build(
    rule: NamingRule,
    file_name: &str,
    caps: &Captures<'_>,
) -> Result<StructuredIdentifier, ParseError> {
    let number = |group: &str| -> Result<Option<u32>, ParseError> {
        caps.name(group)
            .map(|m| {
                m.as_str().parse::<u32>().map_err(|_| ParseError::InvalidNumber {
                    name: file_name.to_string(),
                    token: m.as_str().to_string(),
                })
            })
            .transpose()
    };

    let subject = caps
        .name("eid")
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ParseError::UnrecognizedPattern(file_name.to_string()))?;
    let field =
        number("field")?.ok_or_else(|| ParseError::UnrecognizedPattern(file_name.to_string()))?;
    let instance = number("instance")?;
    let array = number("array")?.unwrap_or(0);
    let tags = caps
        .name("tags")
        .map(|m| m.as_str().split('_').map(|tag| tag.to_lowercase()).collect())
        .unwrap_or_default();
    let extension = caps
        .name("ext")
        .map(|m| m.as_str().to_lowercase())
        .ok_or_else(|| ParseError::UnrecognizedPattern(file_name.to_string()))?;

    Ok(StructuredIdentifier {
        subject,
        instance,
        field,
        array,
        tags,
        extension,
        rule,
    })
}
