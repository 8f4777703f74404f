use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const NO_FILE_PATH_MESSAGE: &str = "No file path found in marker format";
pub const NO_CODE_BLOCK_MESSAGE: &str = "No correctly formatted code block found to apply.";
pub const DEFAULT_MODEL_NAME: &str = "gemini-pro";
pub const DEFAULT_SOURCE_SUFFIX: &str = ".rs";

/// Directory names never offered as selectable context folders.
pub const EXCLUDED_FOLDERS: [&str; 8] = [
    ".git",
    ".idea",
    ".venv",
    "__pycache__",
    "media",
    "node_modules",
    "target",
    "venv",
];

pub const API_KEY_VAR: &str = "GOOGLE_API_KEY";
pub const MODEL_NAME_VAR: &str = "GEMINI_MODEL";
pub const PROMPT_SUFFIX_VAR: &str = "GEMINI_CONFIG";
pub const SOURCE_SUFFIX_VAR: &str = "CODE_DESK_SOURCE_SUFFIX";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DeskError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("file system error: {0}")]
    FileSystem(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QueryId(pub Ulid);

impl QueryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Model,
}

impl TurnRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub text: String,
}

impl HistoryTurn {
    #[must_use]
    pub fn user(text: &str) -> Self {
        Self {
            role: TurnRole::User,
            text: text.to_string(),
        }
    }

    #[must_use]
    pub fn model(text: &str) -> Self {
        Self {
            role: TurnRole::Model,
            text: text.to_string(),
        }
    }
}

/// One persisted AI interaction.
///
/// Core fields are immutable after insert; only `existing_content` and
/// `is_integrated` change later, and `is_integrated` moves false→true once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRecord {
    pub id: QueryId,
    pub question: String,
    pub response: String,
    pub created_at: OffsetDateTime,
    pub raw_response: Option<Value>,
    pub token_count: Option<u32>,
    pub request_payload: Option<Value>,
    pub existing_content: Option<String>,
    pub is_integrated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewQueryRecord {
    pub question: String,
    pub response: String,
    pub raw_response: Option<Value>,
    pub token_count: Option<u32>,
    pub request_payload: Option<Value>,
}

impl NewQueryRecord {
    /// Validates an interaction before insert.
    ///
    /// # Errors
    /// Returns [`DeskError::Validation`] when required fields are empty.
    pub fn validate(&self) -> Result<(), DeskError> {
        if self.question.trim().is_empty() {
            return Err(DeskError::Validation(
                "question MUST be provided".to_string(),
            ));
        }

        if self.response.trim().is_empty() {
            return Err(DeskError::Validation(
                "response MUST be provided".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct QueryUpdate {
    pub existing_content: Option<String>,
    pub is_integrated: Option<bool>,
}

/// A `(path, language-hint, code)` triple parsed out of a response.
///
/// Paths are relative to the project root. Duplicates are allowed; the last
/// block for a path wins when applied.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FileBlock {
    pub path: String,
    pub language: Option<String>,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Written,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BlockOutcome {
    pub path: String,
    pub outcome: WriteOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApplyReport {
    pub outcomes: Vec<BlockOutcome>,
}

impl ApplyReport {
    /// True only when at least one block was applied and none failed. An
    /// empty report is "nothing to apply", never success.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        !self.outcomes.is_empty()
            && self
                .outcomes
                .iter()
                .all(|entry| entry.outcome == WriteOutcome::Written)
    }

    #[must_use]
    pub fn render(&self) -> String {
        if self.outcomes.is_empty() {
            return NO_CODE_BLOCK_MESSAGE.to_string();
        }

        let lines: Vec<String> = self
            .outcomes
            .iter()
            .map(|entry| match &entry.outcome {
                WriteOutcome::Written => {
                    format!("SUCCESS: File '{}' written successfully.", entry.path)
                }
                WriteOutcome::Failed { reason } => {
                    format!(
                        "ERROR: Could not write file '{}'. Reason: {reason}.",
                        entry.path
                    )
                }
            })
            .collect();

        lines.join("\n")
    }
}

static FILE_MARKER_PATTERN: Lazy<Regex> = Lazy::new(|| compile_pattern(r"###\s*([\w\-\./]+)"));

static CODE_BLOCK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    compile_pattern(r"(?s)###\s*(?P<filepath>[\w\-\./]+)\s*\n```(?P<language>\w+)?\n(?P<code>.*?)\n```")
});

fn compile_pattern(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("built-in pattern failed to compile: {err}"),
    }
}

/// Scans a response for `### path` markers and returns the distinct paths.
///
/// The set is sorted, which fixes the iteration order downstream consumers
/// see. An empty result means "nothing to do", not an error.
#[must_use]
pub fn extract_file_references(response_text: &str) -> BTreeSet<String> {
    FILE_MARKER_PATTERN
        .captures_iter(response_text)
        .filter_map(|captures| captures.get(1))
        .map(|group| group.as_str().to_string())
        .collect()
}

/// Scans a response for `### path` markers immediately followed by a fenced
/// code block, in document order. Code bodies are trimmed of leading and
/// trailing whitespace.
#[must_use]
pub fn extract_code_blocks(response_text: &str) -> Vec<FileBlock> {
    CODE_BLOCK_PATTERN
        .captures_iter(response_text)
        .filter_map(|captures| {
            let path = captures.name("filepath")?.as_str().to_string();
            let language = captures
                .name("language")
                .map(|group| group.as_str().to_string());
            let code = captures.name("code")?.as_str().trim().to_string();
            Some(FileBlock {
                path,
                language,
                code,
            })
        })
        .collect()
}

/// Reads the current on-disk content of every referenced path.
///
/// Directory references (trailing slash) are soft: their problems come back
/// as inline `ERROR:` text. Plain file references are strict and abort the
/// whole fetch on the first unreadable path, so a returned snapshot is
/// always complete. Paths are joined onto `root` with no containment
/// check, like [`apply_file_blocks`].
///
/// # Errors
/// Returns [`DeskError::FileSystem`] when a referenced file does not exist
/// or cannot be read.
pub fn fetch_existing_content(
    root: &Path,
    paths: &BTreeSet<String>,
    source_suffix: &str,
) -> Result<String, DeskError> {
    tracing::info!(paths = paths.len(), "reading existing content for referenced files");

    if paths.is_empty() {
        return Ok(NO_FILE_PATH_MESSAGE.to_string());
    }

    let mut content = String::new();
    for path in paths {
        if path.ends_with('/') {
            let folder_name = path.trim_end_matches('/');
            content.push_str(&read_folder_contents(root, folder_name, source_suffix));
        } else {
            let file_path = root.join(path.trim());
            let file_content = fs::read_to_string(&file_path).map_err(|err| {
                DeskError::FileSystem(format!("could not read file '{path}': {err}"))
            })?;
            content.push_str(&file_content);
        }
    }

    Ok(content)
}

/// Writes each block to its path under `root`, best-effort: one failing
/// write never prevents later blocks from being attempted.
///
/// Block paths are joined onto `root` with no containment check, so `..`
/// segments and absolute paths resolve outside the project root. Callers
/// decide which responses to trust before applying them.
#[must_use]
pub fn apply_file_blocks(root: &Path, blocks: &[FileBlock]) -> ApplyReport {
    tracing::info!(blocks = blocks.len(), "applying code blocks to files");

    let mut outcomes = Vec::with_capacity(blocks.len());
    for block in blocks {
        let outcome = match write_block(root, block) {
            Ok(()) => WriteOutcome::Written,
            Err(reason) => {
                tracing::warn!(path = %block.path, error = %reason, "file block write failed");
                WriteOutcome::Failed { reason }
            }
        };
        outcomes.push(BlockOutcome {
            path: block.path.clone(),
            outcome,
        });
    }

    ApplyReport { outcomes }
}

fn write_block(root: &Path, block: &FileBlock) -> Result<(), String> {
    let target_path = root.join(block.path.trim());
    tracing::info!(path = %target_path.display(), "writing file block");

    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }

    fs::write(&target_path, block.code.trim()).map_err(|err| err.to_string())
}

/// Concatenates every `source_suffix` file directly inside `folder_name`,
/// each prefixed with a banner, filenames in lexicographic order.
///
/// Failures are soft: a missing folder or an unreadable file replaces the
/// whole listing with an inline `ERROR:` message.
#[must_use]
pub fn read_folder_contents(root: &Path, folder_name: &str, source_suffix: &str) -> String {
    let folder_path = root.join(folder_name);
    if !folder_path.is_dir() {
        return format!("ERROR: Folder '{folder_name}' not found.");
    }

    match folder_listing(&folder_path, source_suffix) {
        Ok(content) => content,
        Err(err) => format!("ERROR reading files from '{folder_name}': {err}"),
    }
}

fn folder_listing(folder_path: &Path, source_suffix: &str) -> Result<String, std::io::Error> {
    let mut names = Vec::new();
    for entry in fs::read_dir(folder_path)? {
        let entry = entry?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    let mut full_content = String::new();
    for name in names {
        if !name.ends_with(source_suffix) {
            continue;
        }
        let file_content = fs::read_to_string(folder_path.join(&name))?;
        full_content.push_str(&format!("\n\n--- Content of file: {name} ---\n\n"));
        full_content.push_str(&file_content);
    }

    Ok(full_content)
}

/// Lists selectable top-level directories under the project root, excluding
/// [`EXCLUDED_FOLDERS`], sorted.
///
/// # Errors
/// Returns [`DeskError::FileSystem`] when the project root cannot be read.
pub fn list_project_folders(root: &Path) -> Result<Vec<String>, DeskError> {
    let entries = fs::read_dir(root)
        .map_err(|err| DeskError::FileSystem(format!("could not read project root: {err}")))?;

    let mut folders = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|err| DeskError::FileSystem(format!("could not read project root: {err}")))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() && !EXCLUDED_FOLDERS.contains(&name.as_str()) {
            folders.push(name);
        }
    }

    folders.sort();
    Ok(folders)
}

/// Model configuration read once at command startup.
///
/// The prompt suffix is required even when empty; only a present-but-empty
/// value skips the suffix at compose time. The API key stays optional here
/// because only the real provider needs it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ModelSettings {
    pub model_name: String,
    pub api_key: Option<String>,
    pub prompt_suffix: String,
    pub source_suffix: String,
}

impl ModelSettings {
    /// Reads configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`DeskError::Configuration`] when the prompt suffix variable
    /// is absent.
    pub fn from_env() -> Result<Self, DeskError> {
        let prompt_suffix = std::env::var(PROMPT_SUFFIX_VAR).map_err(|_| {
            DeskError::Configuration(format!("{PROMPT_SUFFIX_VAR} MUST be set (may be empty)"))
        })?;

        Ok(Self {
            model_name: std::env::var(MODEL_NAME_VAR)
                .unwrap_or_else(|_| DEFAULT_MODEL_NAME.to_string()),
            api_key: std::env::var(API_KEY_VAR).ok(),
            prompt_suffix,
            source_suffix: std::env::var(SOURCE_SUFFIX_VAR)
                .unwrap_or_else(|_| DEFAULT_SOURCE_SUFFIX.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComposedPrompt {
    pub prompt: String,
    pub turns: Vec<HistoryTurn>,
}

/// Builds outbound prompts from a question, optional folder context, and
/// replayed history.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    root: PathBuf,
    prompt_suffix: String,
    source_suffix: String,
}

impl PromptComposer {
    #[must_use]
    pub fn new(root: &Path, settings: &ModelSettings) -> Self {
        Self {
            root: root.to_path_buf(),
            prompt_suffix: settings.prompt_suffix.clone(),
            source_suffix: settings.source_suffix.clone(),
        }
    }

    /// Composes the final prompt text plus replay turns.
    ///
    /// `history` is expected newest-first, as the store returns it; turns
    /// come out oldest-first as question/response pairs.
    #[must_use]
    pub fn compose(
        &self,
        question: &str,
        folder: Option<&str>,
        history: &[QueryRecord],
    ) -> ComposedPrompt {
        let mut prompt = question.to_string();
        if let Some(folder_name) = folder {
            let folder_content =
                read_folder_contents(&self.root, folder_name, &self.source_suffix);
            prompt = format!(
                "Question: '{question}'\n\nContext from folder '{folder_name}':\n{folder_content}"
            );
        }

        if !self.prompt_suffix.is_empty() {
            prompt = format!("{prompt}, ({})", self.prompt_suffix);
        }

        let mut turns = Vec::with_capacity(history.len() * 2);
        for record in history.iter().rev() {
            turns.push(HistoryTurn::user(&record.question));
            turns.push(HistoryTurn::model(&record.response));
        }

        ComposedPrompt { prompt, turns }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DeskError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DeskError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DeskError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DeskError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DeskError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DeskError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| DeskError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
        match result {
            Ok(value) => panic!("expected Err(..), got Ok({value:?})"),
            Err(err) => err,
        }
    }

    fn temp_root(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("code-desk-{label}-{}", Ulid::new()));
        match fs::create_dir_all(&dir) {
            Ok(()) => dir,
            Err(err) => panic!("failed to create temp root: {err}"),
        }
    }

    fn write_fixture(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                panic!("failed to create fixture dirs: {err}");
            }
        }
        if let Err(err) = fs::write(&path, content) {
            panic!("failed to write fixture file: {err}");
        }
    }

    fn block(path: &str, code: &str) -> FileBlock {
        FileBlock {
            path: path.to_string(),
            language: Some("rust".to_string()),
            code: code.to_string(),
        }
    }

    fn fixture_settings(prompt_suffix: &str) -> ModelSettings {
        ModelSettings {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            api_key: None,
            prompt_suffix: prompt_suffix.to_string(),
            source_suffix: ".rs".to_string(),
        }
    }

    fn fixture_record(question: &str, response: &str) -> QueryRecord {
        QueryRecord {
            id: QueryId::new(),
            question: question.to_string(),
            response: response.to_string(),
            created_at: now_utc(),
            raw_response: None,
            token_count: None,
            request_payload: None,
            existing_content: None,
            is_integrated: false,
        }
    }

    #[test]
    fn no_marker_yields_empty_reference_set() {
        let references = extract_file_references("plain prose, no paths here");
        assert!(references.is_empty());
    }

    #[test]
    fn references_are_distinct_and_order_independent() {
        let references = extract_file_references("### src/x.py and ### src/y.py");
        let expected: BTreeSet<String> =
            ["src/x.py".to_string(), "src/y.py".to_string()].into();
        assert_eq!(references, expected);
    }

    #[test]
    fn repeated_markers_deduplicate() {
        let references = extract_file_references("### src/lib.rs\ntext\n### src/lib.rs");
        assert_eq!(references.len(), 1);
        assert!(references.contains("src/lib.rs"));
    }

    #[test]
    fn marker_accepts_hyphens_dots_and_slashes() {
        let references = extract_file_references("### crates/code-desk.core/v1.0/mod.rs");
        assert!(references.contains("crates/code-desk.core/v1.0/mod.rs"));
    }

    #[test]
    fn code_blocks_come_back_in_document_order_with_duplicates() {
        let response = "### a/b.py\n```python\nX\n```\n### a/b.py\n```python\nY\n```";
        let blocks = extract_code_blocks(response);

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].path, "a/b.py");
        assert_eq!(blocks[0].code, "X");
        assert_eq!(blocks[1].path, "a/b.py");
        assert_eq!(blocks[1].code, "Y");
    }

    #[test]
    fn code_block_language_tag_is_optional() {
        let response = "### notes.txt\n```\nplain body\n```";
        let blocks = extract_code_blocks(response);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, None);
        assert_eq!(blocks[0].code, "plain body");
    }

    #[test]
    fn code_block_body_is_trimmed_but_inner_whitespace_survives() {
        let response = "### src/main.rs\n```rust\n\nfn main() {\n    run();\n}\n\n```";
        let blocks = extract_code_blocks(response);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].code, "fn main() {\n    run();\n}");
    }

    #[test]
    fn marker_without_fence_yields_no_block() {
        let blocks = extract_code_blocks("### src/lib.rs\nno fence follows");
        assert!(blocks.is_empty());
    }

    #[test]
    fn empty_path_set_returns_fixed_message() {
        let root = temp_root("fetch-empty");
        let content = must_ok(fetch_existing_content(&root, &BTreeSet::new(), ".rs"));
        assert_eq!(content, NO_FILE_PATH_MESSAGE);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn fetch_reads_single_file_unbannered() {
        let root = temp_root("fetch-single");
        write_fixture(&root, "src/lib.rs", "pub fn answer() -> u8 { 42 }");

        let paths: BTreeSet<String> = ["src/lib.rs".to_string()].into();
        let content = must_ok(fetch_existing_content(&root, &paths, ".rs"));

        assert_eq!(content, "pub fn answer() -> u8 { 42 }");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn fetch_fails_fast_on_missing_file() {
        let root = temp_root("fetch-missing");
        write_fixture(&root, "present.rs", "present");

        let paths: BTreeSet<String> =
            ["absent.rs".to_string(), "present.rs".to_string()].into();
        let err = must_err(fetch_existing_content(&root, &paths, ".rs"));

        assert!(matches!(err, DeskError::FileSystem(_)));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn fetch_directory_branch_banners_in_lexicographic_order() {
        let root = temp_root("fetch-dir");
        write_fixture(&root, "app/beta.rs", "beta body");
        write_fixture(&root, "app/alpha.rs", "alpha body");
        write_fixture(&root, "app/skip.txt", "not source");

        let paths: BTreeSet<String> = ["app/".to_string()].into();
        let content = must_ok(fetch_existing_content(&root, &paths, ".rs"));

        assert_eq!(
            content,
            "\n\n--- Content of file: alpha.rs ---\n\nalpha body\
             \n\n--- Content of file: beta.rs ---\n\nbeta body"
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn fetch_directory_branch_is_soft_on_missing_folder() {
        let root = temp_root("fetch-dir-missing");
        let paths: BTreeSet<String> = ["ghost/".to_string()].into();

        let content = must_ok(fetch_existing_content(&root, &paths, ".rs"));
        assert_eq!(content, "ERROR: Folder 'ghost' not found.");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn apply_writes_blocks_and_reports_success() {
        let root = temp_root("apply-ok");
        let blocks = vec![block("src/gen.rs", "pub fn gen() {}")];

        let report = apply_file_blocks(&root, &blocks);

        assert!(report.all_succeeded());
        assert_eq!(
            report.render(),
            "SUCCESS: File 'src/gen.rs' written successfully."
        );
        assert_eq!(
            must_ok(fs::read_to_string(root.join("src/gen.rs"))),
            "pub fn gen() {}"
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn apply_last_write_wins_for_duplicate_paths() {
        let root = temp_root("apply-dup");
        let blocks = vec![block("a/b.py", "X"), block("a/b.py", "Y")];

        let report = apply_file_blocks(&root, &blocks);

        assert!(report.all_succeeded());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(must_ok(fs::read_to_string(root.join("a/b.py"))), "Y");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn apply_twice_is_idempotent() {
        let root = temp_root("apply-idem");
        let blocks = vec![block("src/twice.rs", "fn twice() {}")];

        let first = apply_file_blocks(&root, &blocks);
        let second = apply_file_blocks(&root, &blocks);

        assert!(first.all_succeeded());
        assert!(second.all_succeeded());
        assert_eq!(
            must_ok(fs::read_to_string(root.join("src/twice.rs"))),
            "fn twice() {}"
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn apply_partial_failure_keeps_earlier_writes() {
        let root = temp_root("apply-partial");
        let blocks = vec![
            block("occupied", "first body"),
            block("occupied/nested.rs", "never lands"),
        ];

        let report = apply_file_blocks(&root, &blocks);

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].outcome, WriteOutcome::Written);
        assert!(matches!(
            report.outcomes[1].outcome,
            WriteOutcome::Failed { .. }
        ));
        assert!(!report.all_succeeded());
        assert_eq!(
            must_ok(fs::read_to_string(root.join("occupied"))),
            "first body"
        );

        let rendered = report.render();
        assert!(rendered.starts_with("SUCCESS: File 'occupied' written successfully.\n"));
        assert!(rendered.contains("ERROR: Could not write file 'occupied/nested.rs'. Reason:"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn apply_joins_paths_onto_the_root_without_containment() {
        let outer = temp_root("apply-escape");
        let root = outer.join("project");
        must_ok(fs::create_dir_all(&root));

        let report = apply_file_blocks(&root, &[block("../escaped.rs", "fn escaped() {}")]);

        assert!(report.all_succeeded());
        assert_eq!(
            must_ok(fs::read_to_string(outer.join("escaped.rs"))),
            "fn escaped() {}"
        );
        let _ = fs::remove_dir_all(&outer);
    }

    #[test]
    fn empty_apply_renders_sentinel_and_never_succeeds() {
        let report = ApplyReport::default();
        assert!(!report.all_succeeded());
        assert_eq!(report.render(), NO_CODE_BLOCK_MESSAGE);
    }

    #[test]
    fn apply_then_fetch_round_trips_exact_content() {
        let root = temp_root("round-trip");
        let body = "fn round_trip() {\n    // body\n}";
        let report = apply_file_blocks(&root, &[block("src/rt.rs", body)]);
        assert!(report.all_succeeded());

        let paths: BTreeSet<String> = ["src/rt.rs".to_string()].into();
        let content = must_ok(fetch_existing_content(&root, &paths, ".rs"));
        assert_eq!(content, body);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn folder_listing_missing_folder_is_inline_error() {
        let root = temp_root("folder-missing");
        let content = read_folder_contents(&root, "nope", ".rs");
        assert_eq!(content, "ERROR: Folder 'nope' not found.");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn project_folders_exclude_tooling_directories() {
        let root = temp_root("folders");
        for name in ["src", "docs", ".git", "target", "venv"] {
            must_ok(fs::create_dir_all(root.join(name)));
        }
        write_fixture(&root, "loose.rs", "not a folder");

        let folders = must_ok(list_project_folders(&root));
        assert_eq!(folders, vec!["docs".to_string(), "src".to_string()]);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn composer_appends_suffix_in_parentheses() {
        let root = temp_root("compose-suffix");
        let composer = PromptComposer::new(&root, &fixture_settings("answer in rust"));

        let composed = composer.compose("how do I loop?", None, &[]);
        assert_eq!(composed.prompt, "how do I loop?, (answer in rust)");
        assert!(composed.turns.is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn composer_skips_empty_suffix() {
        let root = temp_root("compose-no-suffix");
        let composer = PromptComposer::new(&root, &fixture_settings(""));

        let composed = composer.compose("how do I loop?", None, &[]);
        assert_eq!(composed.prompt, "how do I loop?");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn composer_wraps_question_with_folder_context() {
        let root = temp_root("compose-folder");
        write_fixture(&root, "app/main.rs", "fn main() {}");
        let composer = PromptComposer::new(&root, &fixture_settings(""));

        let composed = composer.compose("what does this do?", Some("app"), &[]);
        assert_eq!(
            composed.prompt,
            "Question: 'what does this do?'\n\nContext from folder 'app':\
             \n\n\n--- Content of file: main.rs ---\n\nfn main() {}"
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn composer_replays_history_oldest_first() {
        let root = temp_root("compose-history");
        let composer = PromptComposer::new(&root, &fixture_settings(""));

        // Store order: newest first.
        let history = vec![
            fixture_record("newest question", "newest answer"),
            fixture_record("oldest question", "oldest answer"),
        ];

        let composed = composer.compose("next", None, &history);
        assert_eq!(composed.turns.len(), 4);
        assert_eq!(composed.turns[0], HistoryTurn::user("oldest question"));
        assert_eq!(composed.turns[1], HistoryTurn::model("oldest answer"));
        assert_eq!(composed.turns[2], HistoryTurn::user("newest question"));
        assert_eq!(composed.turns[3], HistoryTurn::model("newest answer"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn new_record_requires_question_and_response() {
        let missing_question = NewQueryRecord {
            question: "  ".to_string(),
            response: "body".to_string(),
            raw_response: None,
            token_count: None,
            request_payload: None,
        };
        assert!(matches!(
            must_err(missing_question.validate()),
            DeskError::Validation(_)
        ));

        let missing_response = NewQueryRecord {
            question: "q".to_string(),
            response: String::new(),
            raw_response: None,
            token_count: None,
            request_payload: None,
        };
        assert!(missing_response.validate().is_err());
    }

    #[test]
    fn rfc3339_helpers_round_trip() {
        let parsed = must_ok(parse_rfc3339_utc("2026-03-01T09:30:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-03-01T09:30:00Z");
    }

    #[test]
    fn rfc3339_rejects_non_utc_offsets() {
        let err = must_err(parse_rfc3339_utc("2026-03-01T09:30:00+02:00"));
        assert!(matches!(err, DeskError::Validation(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn extracted_references_stay_within_the_path_charset(
            paths in proptest::collection::vec("[a-z]{1,8}(/[a-z0-9_.-]{1,12}){0,3}", 1..6)
        ) {
            let mut response = String::new();
            for path in &paths {
                response.push_str(&format!("### {path}\nsome prose\n"));
            }

            let references = extract_file_references(&response);
            for reference in &references {
                prop_assert!(reference
                    .chars()
                    .all(|ch| ch.is_alphanumeric() || "-_./".contains(ch)));
            }
            for path in &paths {
                prop_assert!(references.contains(path.as_str()));
            }
        }

        #[test]
        fn rendered_blocks_re_extract_to_the_same_paths(
            entries in proptest::collection::vec(
                ("[a-z]{1,6}/[a-z]{1,6}\\.rs", "[ -~]{0,40}"),
                1..5,
            )
        ) {
            let mut response = String::new();
            for (path, body) in &entries {
                response.push_str(&format!("### {path}\n```rust\n{body}\n```\n"));
            }

            let blocks = extract_code_blocks(&response);
            prop_assert_eq!(blocks.len(), entries.len());
            for (block, (path, body)) in blocks.iter().zip(entries.iter()) {
                prop_assert_eq!(&block.path, path);
                prop_assert_eq!(&block.code, &body.trim().to_string());
            }
        }
    }
}
