//! Record linkage and engagement aggregation over cleaned webinar sheets.

pub mod convert;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;
use wep_core::{columns, AttendanceStatus, Record, Table, TableError};
use wep_rules::{
    clean_with_stats, dedupe_with_stats, default_dedup_policy, default_sheet_rules, CleanStats,
    DedupPolicy, DedupStats, SheetRole, SheetRules, PROFILE_URL_PLACEHOLDERS,
};
use wep_tabular::{read_table, write_atomic, TableWriter, WrittenFile};

pub use convert::{ConvertError, SpreadsheetConverter, SsconvertConverter};

pub const DEFAULT_OUTPUT_FILE: &str = "webinar_clay_import.csv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAlias {
    pub from: String,
    pub to: String,
}

/// How profile URLs are turned into join keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileKeyConfig {
    pub host_aliases: Vec<HostAlias>,
    pub placeholders: Vec<String>,
}

impl Default for ProfileKeyConfig {
    fn default() -> Self {
        Self {
            host_aliases: vec![HostAlias {
                from: "https://www.linkedin.com/in/".to_string(),
                to: "https://linkedin.com/in/".to_string(),
            }],
            placeholders: PROFILE_URL_PLACEHOLDERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProfileKeyConfig {
    fn rewrite_hosts(&self, raw: &str) -> String {
        self.host_aliases
            .iter()
            .fold(raw.trim().to_string(), |acc, alias| acc.replace(&alias.from, &alias.to))
    }

    /// Case-sensitive. Placeholder values resolve to the empty key, which never matches.
    pub fn normalize(&self, raw: &str) -> String {
        let key = self.rewrite_hosts(raw);
        if self.placeholders.iter().any(|p| self.rewrite_hosts(p) == key) {
            String::new()
        } else {
            key
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentColumn {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinStats {
    pub primary_rows: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub empty_primary_keys: usize,
    pub secondary_keys: usize,
    pub missing_source_columns: Vec<String>,
}

impl JoinStats {
    pub fn match_rate(&self) -> f64 {
        if self.primary_rows == 0 {
            0.0
        } else {
            self.matched as f64 / self.primary_rows as f64
        }
    }
}

/// Left-joins `secondary` onto `primary`. The last secondary record wins for a
/// repeated key; misses and empty keys get empty enrichment values.
pub fn left_join<PK, SK>(
    primary: &Table,
    secondary: &Table,
    primary_key: PK,
    secondary_key: SK,
    enrichment_columns: &[EnrichmentColumn],
) -> Result<(Table, JoinStats), TableError>
where
    PK: Fn(&Record<'_>) -> String,
    SK: Fn(&Record<'_>) -> String,
{
    let mut lookup: HashMap<String, usize> = HashMap::new();
    for (idx, record) in secondary.records().enumerate() {
        let key = secondary_key(&record);
        if !key.is_empty() {
            lookup.insert(key, idx);
        }
    }

    let source_idx: Vec<Option<usize>> = enrichment_columns
        .iter()
        .map(|c| secondary.column_index(&c.source))
        .collect();
    let mut stats = JoinStats {
        primary_rows: primary.len(),
        secondary_keys: lookup.len(),
        missing_source_columns: enrichment_columns
            .iter()
            .zip(&source_idx)
            .filter(|(_, idx)| idx.is_none())
            .map(|(c, _)| c.source.clone())
            .collect(),
        ..JoinStats::default()
    };

    let targets: Vec<String> = enrichment_columns.iter().map(|c| c.target.clone()).collect();
    let joined = primary.append_columns(&targets, |record| {
        let key = primary_key(record);
        if key.is_empty() {
            stats.empty_primary_keys += 1;
        }
        let hit = (!key.is_empty())
            .then(|| lookup.get(&key))
            .flatten()
            .and_then(|&row| secondary.record(row));
        match hit {
            Some(matched) => {
                stats.matched += 1;
                source_idx
                    .iter()
                    .map(|idx| idx.map(|i| matched.at(i).to_string()).unwrap_or_default())
                    .collect()
            }
            None => {
                stats.unmatched += 1;
                vec![String::new(); targets.len()]
            }
        }
    })?;

    Ok((joined, stats))
}

/// Parses a reaction cell; blanks, text and negatives count as zero.
pub fn parse_count(raw: &str) -> u64 {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<u64>() {
        return n;
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => v.floor() as u64,
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CountRule {
    /// One per log row.
    Presence,
    /// Sum of every numeric column other than the key and `exclude_columns`.
    WeightedSum {
        #[serde(default)]
        exclude_columns: Vec<String>,
    },
}

impl CountRule {
    pub fn count(&self, record: &Record<'_>, key_column: &str) -> u64 {
        match self {
            Self::Presence => 1,
            Self::WeightedSum { exclude_columns } => record
                .fields()
                .filter(|(column, _)| {
                    *column != key_column && !exclude_columns.iter().any(|e| e == column)
                })
                .map(|(_, value)| parse_count(value))
                .fold(0u64, u64::saturating_add),
        }
    }
}

/// Sets `output_column` on every base record to the total `count_fn` accumulates
/// over log rows sharing its key. Rows with an empty key contribute nothing.
pub fn aggregate_counts<F>(
    base: &Table,
    log: &Table,
    key_column: &str,
    count_fn: F,
    output_column: &str,
) -> Result<Table, TableError>
where
    F: Fn(&Record<'_>) -> u64,
{
    aggregate_counts_keyed(base, key_column, log, key_column, count_fn, output_column)
}

/// [`aggregate_counts`] for a log whose identifier column is named differently.
pub fn aggregate_counts_keyed<F>(
    base: &Table,
    base_key_column: &str,
    log: &Table,
    log_key_column: &str,
    count_fn: F,
    output_column: &str,
) -> Result<Table, TableError>
where
    F: Fn(&Record<'_>) -> u64,
{
    let base_key = base.require_column(base_key_column)?;
    let log_key = log.require_column(log_key_column)?;

    let mut totals: HashMap<&str, u64> = HashMap::new();
    for record in log.records() {
        let key = record.at(log_key);
        if key.is_empty() {
            continue;
        }
        let entry = totals.entry(key).or_default();
        *entry = entry.saturating_add(count_fn(&record));
    }

    Ok(base.set_column(output_column, |record| {
        totals
            .get(record.at(base_key))
            .copied()
            .unwrap_or_default()
            .to_string()
    }))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceStats {
    pub attended: usize,
    pub did_not_attend: usize,
    pub registered_only: usize,
    pub conflicts: usize,
}

/// A key listed as both attended and not attended resolves to attended.
pub fn classify_attendance(
    base: &Table,
    key_column: &str,
    attended: &Table,
    did_not_attend: &Table,
    output_column: &str,
) -> Result<(Table, AttendanceStats), TableError> {
    classify_attendance_keyed(
        base,
        key_column,
        (attended, key_column),
        (did_not_attend, key_column),
        output_column,
    )
}

/// [`classify_attendance`] where each list names its identifier column itself.
pub fn classify_attendance_keyed(
    base: &Table,
    base_key_column: &str,
    attended: (&Table, &str),
    did_not_attend: (&Table, &str),
    output_column: &str,
) -> Result<(Table, AttendanceStats), TableError> {
    let base_key = base.require_column(base_key_column)?;
    let key_set = |(table, key_column): (&Table, &str)| -> Result<HashSet<String>, TableError> {
        let idx = table.require_column(key_column)?;
        Ok(table
            .records()
            .map(|r| r.at(idx).to_string())
            .filter(|k| !k.is_empty())
            .collect())
    };
    let attended = key_set(attended)?;
    let absent = key_set(did_not_attend)?;

    let mut stats = AttendanceStats::default();
    let table = base.set_column(output_column, |record| {
        let key = record.at(base_key);
        let in_attended = attended.contains(key);
        let in_absent = absent.contains(key);
        let status = if in_attended {
            if in_absent {
                stats.conflicts += 1;
            }
            stats.attended += 1;
            AttendanceStatus::Attended
        } else if in_absent {
            stats.did_not_attend += 1;
            AttendanceStatus::DidNotAttend
        } else {
            stats.registered_only += 1;
            AttendanceStatus::RegisteredOnly
        };
        status.as_str().to_string()
    });
    if stats.conflicts > 0 {
        warn!(conflicts = stats.conflicts, "keys listed as both attended and did-not-attend");
    }
    Ok((table, stats))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetConfig {
    pub role: SheetRole,
    pub file_name: String,
    #[serde(default)]
    pub skip_lines: usize,
    pub key_column: String,
    #[serde(default)]
    pub rules: SheetRules,
    #[serde(default)]
    pub dedup: DedupPolicy,
}

impl SheetConfig {
    pub fn with_defaults(role: SheetRole, file_name: &str, skip_lines: usize) -> Self {
        let key_column = match role {
            SheetRole::Crm => columns::CRM_PROFILE,
            _ => columns::BMID,
        };
        Self {
            role,
            file_name: file_name.to_string(),
            skip_lines,
            key_column: key_column.to_string(),
            rules: default_sheet_rules(role),
            dedup: default_dedup_policy(role),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub registrant_profile: String,
    pub crm_profile: String,
    pub crm_enrichment: Vec<String>,
    /// Prefix applied to a CRM column whose name already exists on the registrant side.
    pub crm_collision_prefix: String,
    pub attendance_status: String,
    pub poll_responses: String,
    pub emoji_reactions: String,
    pub qa_questions: String,
    pub emoji_exclude_columns: Vec<String>,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            registrant_profile: columns::REGISTRANT_PROFILE.to_string(),
            crm_profile: columns::CRM_PROFILE.to_string(),
            crm_enrichment: [
                "first_name",
                "last_name",
                "company_name",
                "company_domain",
                "industry",
                "customer_status",
                "created_date",
                "last_activity_date",
                "annual_recurring_revenue",
                "employee_count",
                "account_tier",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            crm_collision_prefix: "crm_".to_string(),
            attendance_status: columns::ATTENDANCE_STATUS.to_string(),
            poll_responses: columns::POLL_RESPONSES.to_string(),
            emoji_reactions: columns::EMOJI_REACTIONS.to_string(),
            qa_questions: columns::QA_QUESTIONS.to_string(),
            emoji_exclude_columns: [columns::FIRST_NAME, columns::LAST_NAME, "Name", "Email"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub sheets: Vec<SheetConfig>,
    #[serde(default)]
    pub columns: ColumnConfig,
    #[serde(default)]
    pub profile_key: ProfileKeyConfig,
    #[serde(default = "default_output_file_name")]
    pub output_file_name: String,
    #[serde(default = "default_true")]
    pub write_cleaned_sheets: bool,
}

fn default_output_file_name() -> String {
    DEFAULT_OUTPUT_FILE.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sheets: vec![
                SheetConfig::with_defaults(SheetRole::Registrants, "registered list.csv", 16),
                SheetConfig::with_defaults(SheetRole::Crm, "CRM.csv", 0),
                SheetConfig::with_defaults(SheetRole::Attended, "attend list.csv", 1),
                SheetConfig::with_defaults(SheetRole::DidNotAttend, "did not attend list.csv", 1),
                SheetConfig::with_defaults(SheetRole::Polls, "polls.csv", 0),
                SheetConfig::with_defaults(SheetRole::EmojiReactions, "emoji eeaction.csv", 0),
                SheetConfig::with_defaults(SheetRole::QuestionsAnswers, "Q&A.csv", 0),
            ],
            columns: ColumnConfig::default(),
            profile_key: ProfileKeyConfig::default(),
            output_file_name: default_output_file_name(),
            write_cleaned_sheets: true,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing pipeline config")
    }

    pub fn sheet(&self, role: SheetRole) -> Option<&SheetConfig> {
        self.sheets.iter().find(|s| s.role == role)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for sheet in &self.sheets {
            if !seen.insert(sheet.role) {
                bail!("sheet role {} configured more than once", sheet.role);
            }
        }
        for role in SheetRole::ALL.iter().filter(|r| r.is_required()) {
            if !seen.contains(role) {
                bail!("required sheet role {role} is not configured");
            }
        }
        let outputs = [
            &self.columns.attendance_status,
            &self.columns.poll_responses,
            &self.columns.emoji_reactions,
            &self.columns.qa_questions,
        ];
        let distinct: HashSet<_> = outputs.iter().collect();
        if distinct.len() != outputs.len() {
            bail!("attendance and counter output columns must be distinct");
        }
        if self.output_file_name.trim().is_empty() {
            bail!("output_file_name must not be empty");
        }
        Ok(())
    }
}

/// Where a run reads sheet exports from and writes its results to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl RunPaths {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn from_env() -> Self {
        Self {
            input_dir: std::env::var("WEP_INPUT_DIR")
                .unwrap_or_else(|_| "raw_data".to_string())
                .into(),
            output_dir: std::env::var("WEP_OUTPUT_DIR")
                .unwrap_or_else(|_| "output".to_string())
                .into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetSummary {
    pub role: SheetRole,
    pub file_name: String,
    pub present: bool,
    pub clean: CleanStats,
    pub dedup: DedupStats,
}

#[derive(Debug, Clone, Default)]
pub struct LoadedSheets {
    tables: BTreeMap<SheetRole, Table>,
    summaries: Vec<SheetSummary>,
}

impl LoadedSheets {
    pub fn insert(&mut self, role: SheetRole, table: Table) {
        self.tables.insert(role, table);
    }

    pub fn table(&self, role: SheetRole) -> Option<&Table> {
        self.tables.get(&role)
    }

    pub fn require(&self, role: SheetRole) -> Result<&Table> {
        self.table(role)
            .with_context(|| format!("sheet {role} was not loaded"))
    }

    pub fn tables(&self) -> impl Iterator<Item = (SheetRole, &Table)> {
        self.tables.iter().map(|(role, table)| (*role, table))
    }

    pub fn summaries(&self) -> &[SheetSummary] {
        &self.summaries
    }
}

/// Reads, cleans and deduplicates every configured sheet. Missing optional sheets are
/// recorded as absent; a missing registrants or CRM sheet fails the run.
pub fn load_sheets(config: &PipelineConfig, input_dir: &Path) -> Result<LoadedSheets> {
    let mut loaded = LoadedSheets::default();
    for sheet in &config.sheets {
        let span = info_span!("sheet", role = %sheet.role, file = %sheet.file_name);
        let _guard = span.enter();

        let path = input_dir.join(&sheet.file_name);
        if !path.is_file() {
            if sheet.role.is_required() {
                return Err(TableError::MissingRequiredInput {
                    role: sheet.role.to_string(),
                    path: path.display().to_string(),
                }
                .into());
            }
            warn!(path = %path.display(), "optional sheet missing; treating as empty");
            loaded.summaries.push(SheetSummary {
                role: sheet.role,
                file_name: sheet.file_name.clone(),
                present: false,
                clean: CleanStats::default(),
                dedup: DedupStats::default(),
            });
            continue;
        }

        let raw = read_table(&path, sheet.skip_lines)?;
        let (cleaned, clean) = clean_with_stats(&raw, &sheet.rules)
            .with_context(|| format!("cleaning {}", path.display()))?;
        let (deduped, dedup) = dedupe_with_stats(&cleaned, &sheet.key_column, sheet.dedup)
            .with_context(|| format!("deduplicating {}", path.display()))?;
        info!(
            rows_read = clean.rows_in,
            rows_kept = dedup.rows_out,
            dropped_missing_key = clean.dropped_missing_key,
            dropped_missing_fields = clean.dropped_missing_fields,
            duplicates_removed = dedup.rows_removed(),
            "sheet loaded"
        );

        loaded.insert(sheet.role, deduped);
        loaded.summaries.push(SheetSummary {
            role: sheet.role,
            file_name: sheet.file_name.clone(),
            present: true,
            clean,
            dedup,
        });
    }
    Ok(loaded)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountStats {
    pub column: String,
    pub log_present: bool,
    pub log_rows: usize,
    pub total: u64,
    pub people_with_any: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pass", rename_all = "snake_case")]
pub enum PassSummary {
    CrmJoin(JoinStats),
    Attendance(AttendanceStats),
    Counts(CountStats),
}

#[derive(Debug, Clone)]
pub struct PassOutput {
    pub table: Table,
    pub summary: PassSummary,
}

/// One stage applied to the registrant table. Each pass reads its own sheets and
/// writes only its own columns.
pub trait EnrichmentPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, base: &Table, sheets: &LoadedSheets) -> Result<PassOutput>;
}

pub struct CrmJoinPass {
    registrant_profile: String,
    crm_profile: String,
    enrichment: Vec<String>,
    collision_prefix: String,
    profile_key: ProfileKeyConfig,
}

impl CrmJoinPass {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            registrant_profile: config.columns.registrant_profile.clone(),
            crm_profile: config.columns.crm_profile.clone(),
            enrichment: config.columns.crm_enrichment.clone(),
            collision_prefix: config.columns.crm_collision_prefix.clone(),
            profile_key: config.profile_key.clone(),
        }
    }

    fn enrichment_columns(&self, base: &Table) -> Vec<EnrichmentColumn> {
        self.enrichment
            .iter()
            .map(|source| {
                let target = if base.column_index(source).is_some() {
                    format!("{}{}", self.collision_prefix, source)
                } else {
                    source.clone()
                };
                EnrichmentColumn {
                    source: source.clone(),
                    target,
                }
            })
            .collect()
    }
}

impl EnrichmentPass for CrmJoinPass {
    fn name(&self) -> &'static str {
        "crm_join"
    }

    fn apply(&self, base: &Table, sheets: &LoadedSheets) -> Result<PassOutput> {
        let crm = sheets.require(SheetRole::Crm)?;
        base.require_column(&self.registrant_profile)?;
        crm.require_column(&self.crm_profile)?;

        let (table, stats) = left_join(
            base,
            crm,
            |r| self.profile_key.normalize(r.value(&self.registrant_profile)),
            |r| self.profile_key.normalize(r.value(&self.crm_profile)),
            &self.enrichment_columns(base),
        )?;
        if !stats.missing_source_columns.is_empty() {
            warn!(columns = ?stats.missing_source_columns, "CRM export lacks enrichment columns; left empty");
        }
        info!(
            matched = stats.matched,
            of = stats.primary_rows,
            rate = %format!("{:.1}%", stats.match_rate() * 100.0),
            "joined registrants to CRM"
        );
        Ok(PassOutput {
            table,
            summary: PassSummary::CrmJoin(stats),
        })
    }
}

pub struct AttendancePass {
    key_column: String,
    attended_key: String,
    did_not_attend_key: String,
    output_column: String,
}

impl AttendancePass {
    pub fn new(key_column: impl Into<String>, output_column: impl Into<String>) -> Self {
        let key_column = key_column.into();
        Self {
            attended_key: key_column.clone(),
            did_not_attend_key: key_column.clone(),
            key_column,
            output_column: output_column.into(),
        }
    }

    pub fn with_list_keys(
        mut self,
        attended_key: impl Into<String>,
        did_not_attend_key: impl Into<String>,
    ) -> Self {
        self.attended_key = attended_key.into();
        self.did_not_attend_key = did_not_attend_key.into();
        self
    }
}

impl EnrichmentPass for AttendancePass {
    fn name(&self) -> &'static str {
        "attendance"
    }

    fn apply(&self, base: &Table, sheets: &LoadedSheets) -> Result<PassOutput> {
        let no_attended = Table::new(vec![self.attended_key.clone()])?;
        let no_absent = Table::new(vec![self.did_not_attend_key.clone()])?;
        let attended = sheets.table(SheetRole::Attended).unwrap_or(&no_attended);
        let absent = sheets.table(SheetRole::DidNotAttend).unwrap_or(&no_absent);
        let (table, stats) = classify_attendance_keyed(
            base,
            &self.key_column,
            (attended, &self.attended_key),
            (absent, &self.did_not_attend_key),
            &self.output_column,
        )?;
        info!(
            attended = stats.attended,
            did_not_attend = stats.did_not_attend,
            registered_only = stats.registered_only,
            "classified attendance"
        );
        Ok(PassOutput {
            table,
            summary: PassSummary::Attendance(stats),
        })
    }
}

pub struct CountPass {
    role: SheetRole,
    key_column: String,
    log_key_column: String,
    rule: CountRule,
    output_column: String,
}

impl CountPass {
    pub fn new(
        role: SheetRole,
        key_column: impl Into<String>,
        rule: CountRule,
        output_column: impl Into<String>,
    ) -> Self {
        let key_column = key_column.into();
        Self {
            role,
            log_key_column: key_column.clone(),
            key_column,
            rule,
            output_column: output_column.into(),
        }
    }

    pub fn with_log_key(mut self, log_key_column: impl Into<String>) -> Self {
        self.log_key_column = log_key_column.into();
        self
    }
}

impl EnrichmentPass for CountPass {
    fn name(&self) -> &'static str {
        match self.role {
            SheetRole::Polls => "poll_counts",
            SheetRole::EmojiReactions => "emoji_counts",
            SheetRole::QuestionsAnswers => "qa_counts",
            _ => "counts",
        }
    }

    fn apply(&self, base: &Table, sheets: &LoadedSheets) -> Result<PassOutput> {
        let mut stats = CountStats {
            column: self.output_column.clone(),
            ..CountStats::default()
        };
        let table = match sheets.table(self.role) {
            Some(log) => {
                stats.log_present = true;
                stats.log_rows = log.len();
                aggregate_counts_keyed(
                    base,
                    &self.key_column,
                    log,
                    &self.log_key_column,
                    |r| self.rule.count(r, &self.log_key_column),
                    &self.output_column,
                )?
            }
            None => base.set_column(&self.output_column, |_| "0".to_string()),
        };

        let idx = table.require_column(&self.output_column)?;
        for record in table.records() {
            let n = parse_count(record.at(idx));
            stats.total += n;
            if n > 0 {
                stats.people_with_any += 1;
            }
        }
        debug!(column = %self.output_column, total = stats.total, "aggregated interactions");
        Ok(PassOutput {
            table,
            summary: PassSummary::Counts(stats),
        })
    }
}

pub fn default_passes(config: &PipelineConfig) -> Vec<Box<dyn EnrichmentPass>> {
    let key_of = |role: SheetRole| {
        config
            .sheet(role)
            .map(|s| s.key_column.clone())
            .unwrap_or_else(|| columns::BMID.to_string())
    };
    let cols = &config.columns;
    let base_key = key_of(SheetRole::Registrants);
    let count_pass = |role: SheetRole, rule: CountRule, output: &str| {
        CountPass::new(role, base_key.clone(), rule, output).with_log_key(key_of(role))
    };
    vec![
        Box::new(CrmJoinPass::from_config(config)),
        Box::new(
            AttendancePass::new(base_key.clone(), cols.attendance_status.clone())
                .with_list_keys(key_of(SheetRole::Attended), key_of(SheetRole::DidNotAttend)),
        ),
        Box::new(count_pass(SheetRole::Polls, CountRule::Presence, &cols.poll_responses)),
        Box::new(count_pass(
            SheetRole::EmojiReactions,
            CountRule::WeightedSum {
                exclude_columns: cols.emoji_exclude_columns.clone(),
            },
            &cols.emoji_reactions,
        )),
        Box::new(count_pass(SheetRole::QuestionsAnswers, CountRule::Presence, &cols.qa_questions)),
    ]
}

/// Checks the invariants every enriched table must hold before it is written.
pub fn verify_enriched(table: &Table, key_column: &str, config: &ColumnConfig) -> Result<()> {
    let key = table.require_column(key_column)?;
    let status = table.require_column(&config.attendance_status)?;
    let counters = [&config.poll_responses, &config.emoji_reactions, &config.qa_questions]
        .into_iter()
        .map(|c| table.require_column(c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen = HashSet::new();
    for (row, record) in table.records().enumerate() {
        let id = record.at(key);
        if id.is_empty() || !seen.insert(id) {
            bail!("row {}: identifier {id:?} is empty or repeated", row + 1);
        }
        if record.at(status).parse::<AttendanceStatus>().is_err() {
            bail!("row {}: invalid attendance status {:?}", row + 1, record.at(status));
        }
        for &idx in &counters {
            if record.at(idx).parse::<u64>().is_err() {
                bail!("row {}: counter {:?} is not a non-negative integer", row + 1, record.at(idx));
            }
        }
        if record.values().iter().any(|v| v.contains(['\n', '\r'])) {
            bail!("row {}: value contains a raw line break", row + 1);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_dir: String,
    pub output_file: String,
    pub reports_dir: String,
    pub enriched_rows: usize,
    pub sheets: Vec<SheetSummary>,
    pub passes: Vec<PassSummary>,
}

impl RunSummary {
    pub fn crm_join(&self) -> Option<&JoinStats> {
        self.passes.iter().find_map(|p| match p {
            PassSummary::CrmJoin(stats) => Some(stats),
            _ => None,
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    paths: RunPaths,
    passes: Vec<Box<dyn EnrichmentPass>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, paths: RunPaths) -> Result<Self> {
        config.validate()?;
        let passes = default_passes(&config);
        Ok(Self {
            config,
            paths,
            passes,
        })
    }

    pub fn with_passes(mut self, passes: Vec<Box<dyn EnrichmentPass>>) -> Self {
        self.passes = passes;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Loads every sheet and folds the passes over the registrant table.
    pub fn enrich(&self) -> Result<(Table, LoadedSheets, Vec<PassSummary>)> {
        let sheets = load_sheets(&self.config, &self.paths.input_dir)?;
        let mut table = sheets.require(SheetRole::Registrants)?.clone();
        let mut summaries = Vec::with_capacity(self.passes.len());
        for pass in &self.passes {
            let span = info_span!("pass", name = pass.name());
            let _guard = span.enter();
            let output = pass
                .apply(&table, &sheets)
                .with_context(|| format!("running {} pass", pass.name()))?;
            table = output.table;
            summaries.push(output.summary);
        }
        Ok((table, sheets, summaries))
    }

    pub fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        let _guard = span.enter();
        info!(input = %self.paths.input_dir.display(), "starting run");

        let (enriched, sheets, passes) = self.enrich()?;
        let key_column = self
            .config
            .sheet(SheetRole::Registrants)
            .map(|s| s.key_column.as_str())
            .unwrap_or(columns::BMID);
        verify_enriched(&enriched, key_column, &self.config.columns)?;

        let output_dir = &self.paths.output_dir;
        let mut written = Vec::new();
        let output_path = output_dir.join(&self.config.output_file_name);
        let output = TableWriter::new()
            .with_column_order(enriched.columns().to_vec())
            .write_path(&enriched, &output_path)
            .with_context(|| format!("writing {}", output_path.display()))?;
        written.push(("enriched".to_string(), output));

        if self.config.write_cleaned_sheets {
            for (role, table) in sheets.tables() {
                let Some(sheet) = self.config.sheet(role) else {
                    continue;
                };
                let path = output_dir.join("cleaned").join(&sheet.file_name);
                let file = TableWriter::new()
                    .write_path(table, &path)
                    .with_context(|| format!("writing {}", path.display()))?;
                written.push((format!("cleaned_{role}"), file));
            }
        }

        let reports_dir = output_dir.join("reports").join(run_id.to_string());
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_dir: self.paths.input_dir.display().to_string(),
            output_file: output_path.display().to_string(),
            reports_dir: reports_dir.display().to_string(),
            enriched_rows: enriched.len(),
            sheets: sheets.summaries().to_vec(),
            passes,
        };
        write_reports(&summary, &reports_dir, output_dir, &written)?;
        info!(rows = summary.enriched_rows, output = %summary.output_file, "run complete");
        Ok(summary)
    }
}

fn manifest_entry(name: &str, base: &Path, file: &WrittenFile) -> ManifestEntry {
    ManifestEntry {
        name: name.to_string(),
        path: file
            .path
            .strip_prefix(base)
            .unwrap_or(file.path.as_path())
            .display()
            .to_string(),
        sha256: file.sha256.clone(),
        bytes: file.byte_size as u64,
    }
}

fn write_reports(
    summary: &RunSummary,
    reports_dir: &Path,
    output_dir: &Path,
    written: &[(String, WrittenFile)],
) -> Result<()> {
    let mut manifest: Vec<ManifestEntry> = written
        .iter()
        .map(|(name, file)| manifest_entry(name, output_dir, file))
        .collect();

    let markdown = render_summary_markdown(summary);
    let md = write_atomic(reports_dir.join("summary.md"), markdown.as_bytes())
        .context("writing summary.md")?;
    manifest.push(manifest_entry("summary", output_dir, &md));

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    let js = write_atomic(reports_dir.join("run_summary.json"), &json)
        .context("writing run_summary.json")?;
    manifest.push(manifest_entry("run_summary", output_dir, &js));

    let bytes = serde_json::to_vec_pretty(&serde_json::json!({
        "schema_version": 1,
        "files": manifest,
    }))
    .context("serializing manifest")?;
    write_atomic(reports_dir.join("manifest.json"), &bytes).context("writing manifest.json")?;
    Ok(())
}

fn percent(part: usize, whole: usize) -> String {
    if whole == 0 {
        "0.0%".to_string()
    } else {
        format!("{:.1}%", part as f64 / whole as f64 * 100.0)
    }
}

pub fn render_summary_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Webinar Engagement Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Input: `{}`", summary.input_dir),
        format!("- Output: `{}`", summary.output_file),
        format!("- Enriched records: {}", summary.enriched_rows),
        String::new(),
        "## Sheets".to_string(),
        String::new(),
        "| sheet | file | read | missing key | missing names | blanked values | duplicates removed | kept |"
            .to_string(),
        "|---|---|---|---|---|---|---|---|".to_string(),
    ];
    for sheet in &summary.sheets {
        if sheet.present {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} |",
                sheet.role,
                sheet.file_name,
                sheet.clean.rows_in,
                sheet.clean.dropped_missing_key,
                sheet.clean.dropped_missing_fields,
                sheet.clean.values_blanked,
                sheet.dedup.rows_removed(),
                sheet.dedup.rows_out
            ));
        } else {
            lines.push(format!("| {} | {} | missing | - | - | - | - | 0 |", sheet.role, sheet.file_name));
        }
    }

    for pass in &summary.passes {
        lines.push(String::new());
        match pass {
            PassSummary::CrmJoin(stats) => {
                lines.push("## CRM Match".to_string());
                lines.push(format!(
                    "- matched: {} of {} ({})",
                    stats.matched,
                    stats.primary_rows,
                    percent(stats.matched, stats.primary_rows)
                ));
                lines.push(format!("- without profile URL: {}", stats.empty_primary_keys));
                if !stats.missing_source_columns.is_empty() {
                    lines.push(format!(
                        "- CRM columns not found: {}",
                        stats.missing_source_columns.join(", ")
                    ));
                }
            }
            PassSummary::Attendance(stats) => {
                let total = stats.attended + stats.did_not_attend + stats.registered_only;
                lines.push("## Attendance".to_string());
                lines.push(format!("- attended: {} ({})", stats.attended, percent(stats.attended, total)));
                lines.push(format!("- did not attend: {}", stats.did_not_attend));
                lines.push(format!("- registered only: {}", stats.registered_only));
                if stats.conflicts > 0 {
                    lines.push(format!("- listed in both attendance sheets: {}", stats.conflicts));
                }
            }
            PassSummary::Counts(stats) => {
                lines.push(format!("## {}", stats.column));
                if stats.log_present {
                    lines.push(format!(
                        "- total: {} across {} people ({} log rows)",
                        stats.total, stats.people_with_any, stats.log_rows
                    ));
                } else {
                    lines.push("- log missing; all counts are zero".to_string());
                }
            }
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the newest `runs` reports under `output_dir/reports`.
pub fn report_runs_markdown(output_dir: &Path, runs: usize) -> Result<String> {
    let reports_root = output_dir.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path().join("run_summary.json");
            let text = std::fs::read_to_string(&path).ok()?;
            match serde_json::from_str::<RunSummary>(&text) {
                Ok(summary) => Some(summary),
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable run summary");
                    None
                }
            }
        })
        .collect::<Vec<_>>();
    dirs.sort_by_key(|s| s.started_at);
    dirs.reverse();

    let mut lines = vec!["# Webinar Engagement Reports".to_string(), String::new()];
    for summary in dirs.into_iter().take(runs) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- enriched records: {}", summary.enriched_rows));
        if let Some(join) = summary.crm_join() {
            lines.push(format!(
                "- CRM matches: {} ({})",
                join.matched,
                percent(join.matched, join.primary_rows)
            ));
        }
        lines.push(format!("- output: `{}`", summary.output_file));
        lines.push(format!("- reports: `{}`", summary.reports_dir));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
