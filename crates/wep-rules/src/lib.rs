//! Per-sheet cleaning and deduplication rules.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use wep_core::{columns, Table, TableError};

/// Values that look like a profile URL but carry no profile path.
pub const PROFILE_URL_PLACEHOLDERS: [&str; 2] =
    ["https://linkedin.com/in/", "https://www.linkedin.com/in/"];

/// Logical role of one exported sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetRole {
    Registrants,
    Crm,
    Attended,
    DidNotAttend,
    Polls,
    EmojiReactions,
    QuestionsAnswers,
}

impl SheetRole {
    pub const ALL: [SheetRole; 7] = [
        SheetRole::Registrants,
        SheetRole::Crm,
        SheetRole::Attended,
        SheetRole::DidNotAttend,
        SheetRole::Polls,
        SheetRole::EmojiReactions,
        SheetRole::QuestionsAnswers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registrants => "registrants",
            Self::Crm => "crm",
            Self::Attended => "attended",
            Self::DidNotAttend => "did_not_attend",
            Self::Polls => "polls",
            Self::EmojiReactions => "emoji_reactions",
            Self::QuestionsAnswers => "questions_answers",
        }
    }

    /// Registrants and CRM must exist; every other sheet degrades to empty.
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Registrants | Self::Crm)
    }
}

impl fmt::Display for SheetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRules {
    #[serde(default)]
    pub required_key: Option<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Exact values, per column, that count as empty.
    #[serde(default)]
    pub blank_value_placeholders: BTreeMap<String, Vec<String>>,
}

impl SheetRules {
    pub fn placeholders_for(&self, column: &str) -> &[String] {
        self.blank_value_placeholders
            .get(column)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn profile_placeholders(column: &str) -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([(
        column.to_string(),
        PROFILE_URL_PLACEHOLDERS.iter().map(|s| s.to_string()).collect(),
    )])
}

/// Rule set used for `role` when no configuration overrides it.
pub fn default_sheet_rules(role: SheetRole) -> SheetRules {
    match role {
        SheetRole::Registrants => SheetRules {
            required_key: Some(columns::BMID.to_string()),
            required_fields: vec![columns::FIRST_NAME.to_string(), columns::LAST_NAME.to_string()],
            blank_value_placeholders: profile_placeholders(columns::REGISTRANT_PROFILE),
        },
        SheetRole::Crm => SheetRules {
            required_key: None,
            required_fields: Vec::new(),
            blank_value_placeholders: profile_placeholders(columns::CRM_PROFILE),
        },
        SheetRole::Attended
        | SheetRole::DidNotAttend
        | SheetRole::Polls
        | SheetRole::EmojiReactions
        | SheetRole::QuestionsAnswers => SheetRules {
            required_key: Some(columns::BMID.to_string()),
            ..SheetRules::default()
        },
    }
}

pub fn default_dedup_policy(role: SheetRole) -> DedupPolicy {
    match role {
        SheetRole::Registrants | SheetRole::Attended | SheetRole::DidNotAttend => DedupPolicy::KeepFirst,
        SheetRole::EmojiReactions => DedupPolicy::DropAllOnDuplicate,
        SheetRole::Crm | SheetRole::Polls | SheetRole::QuestionsAnswers => DedupPolicy::KeepAll,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanStats {
    pub rows_in: usize,
    pub rows_out: usize,
    pub dropped_missing_key: usize,
    pub dropped_missing_fields: usize,
    pub values_blanked: usize,
}

/// Collapses embedded line breaks to single spaces and trims.
pub fn normalize_value(raw: &str) -> String {
    if !raw.contains(['\n', '\r']) {
        return raw.trim().to_string();
    }
    raw.replace("\r\n", " ")
        .replace(['\r', '\n'], " ")
        .trim()
        .to_string()
}

pub fn clean(table: &Table, rules: &SheetRules) -> Result<Table, TableError> {
    clean_with_stats(table, rules).map(|(table, _)| table)
}

/// Normalises every value, blanks placeholders, then drops records missing the
/// required key or any required field. The input table is left untouched.
pub fn clean_with_stats(table: &Table, rules: &SheetRules) -> Result<(Table, CleanStats), TableError> {
    let key_idx = rules
        .required_key
        .as_deref()
        .map(|key| table.require_column(key))
        .transpose()?;
    let field_idx = rules
        .required_fields
        .iter()
        .map(|field| table.require_column(field))
        .collect::<Result<Vec<_>, _>>()?;

    let mut stats = CleanStats {
        rows_in: table.len(),
        ..CleanStats::default()
    };

    let normalized = table.map_values(|column, raw| {
        let value = normalize_value(raw);
        if !value.is_empty() && rules.placeholders_for(column).iter().any(|p| *p == value) {
            stats.values_blanked += 1;
            String::new()
        } else {
            value
        }
    });

    let cleaned = normalized.filter(|record| {
        if key_idx.is_some_and(|idx| record.at(idx).is_empty()) {
            stats.dropped_missing_key += 1;
            return false;
        }
        if field_idx.iter().any(|&idx| record.at(idx).is_empty()) {
            stats.dropped_missing_fields += 1;
            return false;
        }
        true
    });
    stats.rows_out = cleaned.len();

    debug!(
        rows_in = stats.rows_in,
        rows_out = stats.rows_out,
        missing_key = stats.dropped_missing_key,
        missing_fields = stats.dropped_missing_fields,
        blanked = stats.values_blanked,
        "cleaned table"
    );
    Ok((cleaned, stats))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    KeepFirst,
    /// Repeated keys signal a corrupted export; every copy is discarded.
    DropAllOnDuplicate,
    #[default]
    KeepAll,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub rows_in: usize,
    pub rows_out: usize,
    pub duplicate_keys: usize,
}

impl DedupStats {
    pub fn rows_removed(&self) -> usize {
        self.rows_in - self.rows_out
    }
}

pub fn dedupe(table: &Table, key_column: &str, policy: DedupPolicy) -> Result<Table, TableError> {
    dedupe_with_stats(table, key_column, policy).map(|(table, _)| table)
}

/// Records with an empty key never take part in duplicate detection.
pub fn dedupe_with_stats(
    table: &Table,
    key_column: &str,
    policy: DedupPolicy,
) -> Result<(Table, DedupStats), TableError> {
    let key_idx = table.require_column(key_column)?;

    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for record in table.records() {
        let key = record.at(key_idx);
        if !key.is_empty() {
            *occurrences.entry(key).or_default() += 1;
        }
    }
    let duplicate_keys = occurrences.values().filter(|&&n| n > 1).count();

    let deduped = match policy {
        DedupPolicy::KeepAll => table.clone(),
        DedupPolicy::KeepFirst => {
            let mut seen: HashSet<String> = HashSet::new();
            table.filter(|record| {
                let key = record.at(key_idx);
                key.is_empty() || seen.insert(key.to_string())
            })
        }
        DedupPolicy::DropAllOnDuplicate => table.filter(|record| {
            let key = record.at(key_idx);
            key.is_empty() || occurrences.get(key).copied().unwrap_or_default() < 2
        }),
    };

    let stats = DedupStats {
        rows_in: table.len(),
        rows_out: deduped.len(),
        duplicate_keys,
    };
    Ok((deduped, stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registrants() -> Table {
        Table::from_rows(
            ["BMID", "First Name", "Last Name", "LinkedIn URL"],
            [
                ["", "Ann", "Lee", "https://linkedin.com/in/ann"],
                ["B123", "", "", "https://linkedin.com/in/nobody"],
                ["B124", "Jo", "Doe", "https://linkedin.com/in/"],
                ["B125", " Max\r\nvon ", "Berg", "https://www.linkedin.com/in/"],
            ],
        )
        .unwrap()
    }

    #[test]
    fn key_and_name_rules_drop_records_but_placeholders_only_blank() {
        let rules = default_sheet_rules(SheetRole::Registrants);
        let (cleaned, stats) = clean_with_stats(&registrants(), &rules).unwrap();

        let ids: Vec<_> = cleaned.records().map(|r| r.value("BMID")).collect();
        assert_eq!(ids, vec!["B124", "B125"]);
        assert_eq!(cleaned.record(0).unwrap().value("LinkedIn URL"), "");
        assert_eq!(cleaned.record(1).unwrap().value("LinkedIn URL"), "");
        assert_eq!(cleaned.record(1).unwrap().value("First Name"), "Max von");
        assert_eq!(stats.dropped_missing_key, 1);
        assert_eq!(stats.dropped_missing_fields, 1);
        assert_eq!(stats.values_blanked, 2);
    }

    #[test]
    fn cleaning_is_idempotent() {
        let rules = default_sheet_rules(SheetRole::Registrants);
        let once = clean(&registrants(), &rules).unwrap();
        let twice = clean(&once, &rules).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn placeholder_in_required_field_is_blanked_before_the_drop_check() {
        let rules = SheetRules {
            required_key: Some("BMID".into()),
            required_fields: vec!["url".into()],
            blank_value_placeholders: profile_placeholders("url"),
        };
        let table = Table::from_rows(
            ["BMID", "url"],
            [["B1", " https://linkedin.com/in/\n"], ["B2", "https://linkedin.com/in/b2"]],
        )
        .unwrap();
        let cleaned = clean(&table, &rules).unwrap();
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned.record(0).unwrap().value("BMID"), "B2");
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let table = Table::from_rows(["Name"], [["x"]]).unwrap();
        let err = clean(&table, &default_sheet_rules(SheetRole::Polls)).unwrap_err();
        assert_eq!(err, TableError::UnknownColumn("BMID".into()));
    }

    #[test]
    fn normalize_value_collapses_each_break_to_one_space() {
        assert_eq!(normalize_value("a\r\nb\nc\rd"), "a b c d");
        assert_eq!(normalize_value("\n  padded \n"), "padded");
        assert_eq!(normalize_value("plain"), "plain");
    }

    fn keyed(rows: &[(&str, &str)]) -> Table {
        Table::from_rows(["BMID", "v"], rows.iter().map(|(k, v)| [*k, *v])).unwrap()
    }

    #[test]
    fn keep_first_emits_first_occurrence_per_key() {
        let table = keyed(&[("B1", "a"), ("B2", "b"), ("B1", "c"), ("B3", "d"), ("B2", "e")]);
        let (out, stats) = dedupe_with_stats(&table, "BMID", DedupPolicy::KeepFirst).unwrap();
        let rows: Vec<_> = out.records().map(|r| (r.value("BMID"), r.value("v"))).collect();
        assert_eq!(rows, vec![("B1", "a"), ("B2", "b"), ("B3", "d")]);
        assert_eq!(stats.rows_removed(), 2);
        assert_eq!(stats.duplicate_keys, 2);
    }

    #[test]
    fn drop_all_on_duplicate_removes_every_copy() {
        let table = keyed(&[("B1", "a"), ("B2", "b"), ("B1", "c")]);
        let out = dedupe(&table, "BMID", DedupPolicy::DropAllOnDuplicate).unwrap();
        let ids: Vec<_> = out.records().map(|r| r.value("BMID")).collect();
        assert_eq!(ids, vec!["B2"]);
    }

    #[test]
    fn keep_all_is_identity() {
        let table = keyed(&[("B1", "a"), ("B1", "a")]);
        assert_eq!(dedupe(&table, "BMID", DedupPolicy::KeepAll).unwrap(), table);
    }

    #[test]
    fn empty_keys_never_establish_seen_state() {
        let table = keyed(&[("", "a"), ("", "b"), ("B1", "c")]);
        let first = dedupe(&table, "BMID", DedupPolicy::KeepFirst).unwrap();
        assert_eq!(first.len(), 3);
        let drop_all = dedupe(&table, "BMID", DedupPolicy::DropAllOnDuplicate).unwrap();
        assert_eq!(drop_all.len(), 3);
    }

    #[test]
    fn rules_deserialize_from_yaml_with_defaults() {
        let yaml = "required_key: BMID\nblank_value_placeholders:\n  url: ['https://linkedin.com/in/']\n";
        let rules: SheetRules = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.required_key.as_deref(), Some("BMID"));
        assert!(rules.required_fields.is_empty());
        assert_eq!(rules.placeholders_for("url").len(), 1);
        assert!(rules.placeholders_for("other").is_empty());

        let policy: DedupPolicy = serde_yaml::from_str("drop_all_on_duplicate").unwrap();
        assert_eq!(policy, DedupPolicy::DropAllOnDuplicate);
    }
}
