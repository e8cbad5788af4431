// src/catalog.rs
//
// Parameter catalog: the configuration-limits document (`action.max.yaml`)
// parsed into an ordered `section -> key -> Limit` structure.
//
// Section and key order come straight from the document and define the flat
// action layout, so both levels are IndexMaps. The loader is strict about
// document *shape* (a mapping of mappings) and lenient about individual
// values: a value that cannot be read as a limit is dropped with a warning.

use std::fs;
use std::io;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use thiserror::Error;
use tracing::{info, warn};

/// Upper bound and unit suffix for one tunable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    /// Largest value the parameter may take (the action component 1.0).
    pub max_value: f64,
    /// Unit suffix reattached verbatim when rendering, e.g. `"ms"` or `" MB"`.
    pub unit: Option<String>,
}

impl Limit {
    pub fn new(max_value: f64, unit: Option<&str>) -> Self {
        Self {
            max_value,
            unit: unit.map(str::to_string),
        }
    }

    /// Render an integer magnitude with this limit's unit suffix.
    pub fn render(&self, value: i64) -> String {
        match &self.unit {
            Some(unit) => format!("{value}{unit}"),
            None => value.to_string(),
        }
    }
}

/// Why a raw catalog value could not be read as a [`Limit`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimitParseError {
    #[error("value is empty")]
    Empty,
    #[error("value '{0}' does not start with a digit")]
    NoLeadingDigits(String),
    #[error("unit suffix of '{0}' contains digits")]
    DigitsInUnit(String),
    #[error("magnitude of '{0}' does not fit in 64 bits")]
    Overflow(String),
    #[error("numeric value {0} is negative or not finite")]
    InvalidNumber(f64),
    #[error("unsupported value type: {0}")]
    UnsupportedType(&'static str),
}

/// Split a `<digits><unit>` string into magnitude and unit.
///
/// The magnitude is the run of leading ASCII digits; everything after it is
/// the unit, kept verbatim (including inner whitespace such as `"99 MB"`).
/// Strings that do not start with a digit (`"v1.2"`, `"-5"`) and strings
/// whose suffix contains further digits (`"1.5s"`) are rejected, since
/// neither would survive a render/re-parse cycle.
pub fn parse_limit(raw: &str) -> Result<Limit, LimitParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LimitParseError::Empty);
    }

    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if digits_end == 0 {
        return Err(LimitParseError::NoLeadingDigits(trimmed.to_string()));
    }

    let (digits, suffix) = trimmed.split_at(digits_end);
    if suffix.chars().any(|c| c.is_ascii_digit()) {
        return Err(LimitParseError::DigitsInUnit(trimmed.to_string()));
    }

    let magnitude: u64 = digits
        .parse()
        .map_err(|_| LimitParseError::Overflow(trimmed.to_string()))?;

    Ok(Limit {
        max_value: magnitude as f64,
        unit: if suffix.is_empty() {
            None
        } else {
            Some(suffix.to_string())
        },
    })
}

/// Read one YAML leaf as a limit. Numbers carry no unit.
fn parse_value(value: &YamlValue) -> Result<Limit, LimitParseError> {
    match value {
        YamlValue::Number(n) => {
            let v = n.as_f64().ok_or(LimitParseError::UnsupportedType("number"))?;
            if !v.is_finite() || v < 0.0 {
                return Err(LimitParseError::InvalidNumber(v));
            }
            Ok(Limit {
                max_value: v,
                unit: None,
            })
        }
        YamlValue::String(s) => parse_limit(s),
        YamlValue::Bool(_) => Err(LimitParseError::UnsupportedType("bool")),
        YamlValue::Null => Err(LimitParseError::UnsupportedType("null")),
        YamlValue::Sequence(_) => Err(LimitParseError::UnsupportedType("sequence")),
        YamlValue::Mapping(_) => Err(LimitParseError::UnsupportedType("mapping")),
        YamlValue::Tagged(_) => Err(LimitParseError::UnsupportedType("tagged")),
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("limits file '{path}' not found")]
    Missing { path: String },
    #[error("failed to read limits file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse limits YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid limits document at '{location}': {message}")]
    Structure { location: String, message: String },
}

impl CatalogError {
    fn structure(location: impl Into<String>, message: impl Into<String>) -> Self {
        CatalogError::Structure {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Ordered `section -> key -> Limit` catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    sections: IndexMap<String, IndexMap<String, Limit>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key, creating its section on first use.
    pub fn insert(&mut self, section: &str, key: &str, limit: Limit) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), limit);
    }

    /// Total number of keys across all sections.
    pub fn len(&self) -> usize {
        self.sections.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    pub fn section(&self, name: &str) -> Option<&IndexMap<String, Limit>> {
        self.sections.get(name)
    }

    /// Walk every `(section, key, limit)` in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &Limit)> {
        self.sections.iter().flat_map(|(section, keys)| {
            keys.iter()
                .map(move |(key, limit)| (section.as_str(), key.as_str(), limit))
        })
    }

    /// First limit registered under `key`, in any section.
    pub fn limit(&self, key: &str) -> Option<&Limit> {
        self.sections.values().find_map(|keys| keys.get(key))
    }

    /// Parse a limits document.
    ///
    /// The document must be a mapping of section names to mappings of
    /// parameter keys; anything else is a structural error. Individual values
    /// that are not limits are dropped with a warning.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CatalogError> {
        let doc: YamlValue = serde_yaml::from_str(yaml)?;
        let mut catalog = Catalog::new();

        let top = match doc {
            YamlValue::Null => return Ok(catalog),
            YamlValue::Mapping(map) => map,
            _ => return Err(CatalogError::structure("<root>", "expected a mapping of sections")),
        };

        let mut dropped = 0usize;
        for (section_key, section_value) in top {
            let section = match section_key {
                YamlValue::String(s) => s,
                other => {
                    return Err(CatalogError::structure(
                        "<root>",
                        format!("section name must be a string, got {other:?}"),
                    ))
                }
            };

            let entries = match section_value {
                YamlValue::Null => {
                    catalog.sections.entry(section).or_default();
                    continue;
                }
                YamlValue::Mapping(map) => map,
                _ => {
                    return Err(CatalogError::structure(
                        section,
                        "expected a mapping of parameter keys",
                    ))
                }
            };

            let keys = catalog.sections.entry(section.clone()).or_default();
            for (raw_key, raw_value) in entries {
                let key = match raw_key {
                    YamlValue::String(s) => s,
                    other => {
                        return Err(CatalogError::structure(
                            section,
                            format!("parameter key must be a string, got {other:?}"),
                        ))
                    }
                };
                if matches!(raw_value, YamlValue::Mapping(_) | YamlValue::Sequence(_)) {
                    return Err(CatalogError::structure(
                        format!("{section}.{key}"),
                        "nested collections are not limits",
                    ));
                }
                match parse_value(&raw_value) {
                    Ok(limit) => {
                        keys.insert(key, limit);
                    }
                    Err(err) => {
                        dropped += 1;
                        warn!(section = %section, key = %key, error = %err, "dropping catalog entry");
                    }
                }
            }
        }

        catalog.warn_duplicate_keys();
        info!(
            sections = catalog.sections.len(),
            keys = catalog.len(),
            dropped,
            "parameter catalog loaded"
        );
        Ok(catalog)
    }

    /// Load a limits document from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                CatalogError::Missing { path: display.clone() }
            } else {
                CatalogError::Io {
                    path: display.clone(),
                    source,
                }
            }
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Load a limits document, degrading to an empty catalog on any error.
    ///
    /// An empty catalog gives a zero-dimensional action space; the
    /// environment still boots and steps.
    pub fn load_or_empty<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(error = %err, "limits unavailable, continuing with an empty catalog");
                Catalog::new()
            }
        }
    }

    /// Decoded configuration documents are flat, so a key repeated across
    /// sections collapses to whichever section is rendered last.
    fn warn_duplicate_keys(&self) {
        let mut seen: IndexMap<&str, &str> = IndexMap::new();
        for (section, key, _) in self.iter() {
            if let Some(first) = seen.insert(key, section) {
                warn!(key, first_section = first, section, "key appears in more than one section");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS_YAML: &str = r#"
configtx:
  BatchTimeout: 10s
  MaxMessageCount: 1000
  AbsoluteMaxBytes: 99 MB
  PreferredMaxBytes: 2048 KB
orderer:
  ORDERER_GENERAL_KEEPALIVE_SERVERTIMEOUT: 60s
peer:
  CORE_PEER_GOSSIP_PULLPEERNUM: 10
  CORE_PEER_GOSSIP_PULLINTERVAL: 20s
  CORE_PEER_KEEPALIVE_MININTERVAL: 300s
  CORE_PEER_DISCOVERY_AUTHCACHEPURGERETENTIONRATIO: 0.75
"#;

    #[test]
    fn parse_limit_splits_digits_and_unit() {
        assert_eq!(parse_limit("500ms").unwrap(), Limit::new(500.0, Some("ms")));
        assert_eq!(parse_limit("10s").unwrap(), Limit::new(10.0, Some("s")));
        assert_eq!(parse_limit("99 MB").unwrap(), Limit::new(99.0, Some(" MB")));
    }

    #[test]
    fn parse_limit_bare_digits_have_no_unit() {
        assert_eq!(parse_limit("1000").unwrap(), Limit::new(1000.0, None));
        assert_eq!(parse_limit(" 42 ").unwrap(), Limit::new(42.0, None));
        assert_eq!(parse_limit("0").unwrap(), Limit::new(0.0, None));
    }

    #[test]
    fn parse_limit_rejects_non_digit_prefix() {
        assert!(matches!(parse_limit("v1.2"), Err(LimitParseError::NoLeadingDigits(_))));
        assert!(matches!(parse_limit("-5"), Err(LimitParseError::NoLeadingDigits(_))));
        assert!(matches!(parse_limit("ms"), Err(LimitParseError::NoLeadingDigits(_))));
        assert!(matches!(parse_limit("true"), Err(LimitParseError::NoLeadingDigits(_))));
    }

    #[test]
    fn parse_limit_rejects_digits_in_unit() {
        assert!(matches!(parse_limit("1.5s"), Err(LimitParseError::DigitsInUnit(_))));
        assert!(matches!(parse_limit("10m30s"), Err(LimitParseError::DigitsInUnit(_))));
    }

    #[test]
    fn parse_limit_rejects_empty_and_overflow() {
        assert_eq!(parse_limit(""), Err(LimitParseError::Empty));
        assert_eq!(parse_limit("   "), Err(LimitParseError::Empty));
        assert!(matches!(
            parse_limit("99999999999999999999999s"),
            Err(LimitParseError::Overflow(_))
        ));
    }

    #[test]
    fn render_reattaches_unit_verbatim() {
        assert_eq!(Limit::new(99.0, Some(" MB")).render(50), "50 MB");
        assert_eq!(Limit::new(1000.0, None).render(7), "7");
    }

    #[test]
    fn catalog_preserves_document_order() {
        let catalog = Catalog::from_yaml_str(LIMITS_YAML).unwrap();
        let sections: Vec<_> = catalog.section_names().collect();
        assert_eq!(sections, vec!["configtx", "orderer", "peer"]);

        let keys: Vec<_> = catalog.iter().map(|(_, k, _)| k).collect();
        assert_eq!(keys[0], "BatchTimeout");
        assert_eq!(keys[3], "PreferredMaxBytes");
        assert_eq!(keys[4], "ORDERER_GENERAL_KEEPALIVE_SERVERTIMEOUT");
        assert_eq!(catalog.len(), 9);
    }

    #[test]
    fn catalog_reads_numbers_and_suffixed_strings() {
        let catalog = Catalog::from_yaml_str(LIMITS_YAML).unwrap();
        assert_eq!(catalog.limit("MaxMessageCount"), Some(&Limit::new(1000.0, None)));
        assert_eq!(catalog.limit("BatchTimeout"), Some(&Limit::new(10.0, Some("s"))));
        assert_eq!(
            catalog.limit("CORE_PEER_DISCOVERY_AUTHCACHEPURGERETENTIONRATIO"),
            Some(&Limit::new(0.75, None))
        );
    }

    #[test]
    fn catalog_drops_unparseable_values() {
        let yaml = r#"
peer:
  GOOD: 5s
  VERSIONED: v1.2
  FLAG: true
  EMPTY:
  NEGATIVE: -3
"#;
        let catalog = Catalog::from_yaml_str(yaml).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.limit("GOOD").is_some());
        assert!(catalog.limit("VERSIONED").is_none());
        assert!(catalog.limit("NEGATIVE").is_none());
    }

    #[test]
    fn catalog_rejects_structurally_invalid_documents() {
        assert!(matches!(
            Catalog::from_yaml_str("- a\n- b\n"),
            Err(CatalogError::Structure { .. })
        ));
        assert!(matches!(
            Catalog::from_yaml_str("peer: 5\n"),
            Err(CatalogError::Structure { .. })
        ));
        assert!(matches!(
            Catalog::from_yaml_str("peer:\n  NESTED:\n    inner: 1\n"),
            Err(CatalogError::Structure { .. })
        ));
        assert!(matches!(
            Catalog::from_yaml_str("peer: [1, 2"),
            Err(CatalogError::Parse(_))
        ));
    }

    #[test]
    fn empty_document_is_empty_catalog() {
        let catalog = Catalog::from_yaml_str("").unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn missing_file_reports_missing_and_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("action.max.yaml");
        assert!(matches!(Catalog::load(&path), Err(CatalogError::Missing { .. })));
        assert!(Catalog::load_or_empty(&path).is_empty());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("action.max.yaml");
        fs::write(&path, LIMITS_YAML).unwrap();
        let catalog = Catalog::load(&path).unwrap();
        assert_eq!(catalog.len(), 9);
    }
}
