//! Quick fixes to editor diagnostics

use lsp_types::{
    Diagnostic, DiagnosticSeverity, DiagnosticTag, NumberOrString, Position, Range,
};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;
use url::Url;

use crate::protocol::requests::QuickFix;

pub const DIAGNOSTIC_SOURCE: &str = "csharp";

/// Unreachable code, unused variable, unnecessary using
const FADEOUT_IDS: [&str; 3] = ["CS0162", "CS0219", "CS8019"];

/// Convert one quick fix, or `None` when it should not be shown
pub fn to_diagnostic(quick_fix: &QuickFix, suppress_hidden: bool) -> Option<Diagnostic> {
    let level = quick_fix
        .log_level
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let fadeout = is_fadeout(quick_fix);

    let severity = match level.as_str() {
        "none" => DiagnosticSeverity::HINT,
        "hidden" if fadeout => DiagnosticSeverity::HINT,
        "error" => DiagnosticSeverity::ERROR,
        "warning" => DiagnosticSeverity::WARNING,
        "info" => DiagnosticSeverity::INFORMATION,
        "hidden" if !suppress_hidden => DiagnosticSeverity::HINT,
        _ => return None,
    };

    let labels: Vec<&str> = quick_fix.projects.iter().map(|p| project_label(p)).collect();

    Some(Diagnostic {
        range: Range::new(
            Position::new(quick_fix.line, quick_fix.column),
            Position::new(quick_fix.end_line, quick_fix.end_column),
        ),
        severity: Some(severity),
        code: quick_fix.id.clone().map(NumberOrString::String),
        source: Some(DIAGNOSTIC_SOURCE.to_string()),
        message: format!("{} [{}]", quick_fix.text, labels.join(", ")),
        tags: fadeout.then(|| vec![DiagnosticTag::UNNECESSARY]),
        ..Diagnostic::default()
    })
}

/// Diagnostics of one document's result
pub fn document_diagnostics(quick_fixes: &[QuickFix], suppress_hidden: bool) -> Vec<Diagnostic> {
    quick_fixes
        .iter()
        .filter_map(|fix| to_diagnostic(fix, suppress_hidden))
        .collect()
}

/// Group a workspace result per file, ordered by file URI
///
/// Paths spelled differently that name the same file share one group.
pub fn group_by_file(
    quick_fixes: &[QuickFix],
    suppress_hidden: bool,
) -> BTreeMap<Url, Vec<Diagnostic>> {
    let mut sorted: Vec<&QuickFix> = quick_fixes.iter().collect();
    sorted.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    let mut grouped: BTreeMap<Url, Vec<Diagnostic>> = BTreeMap::new();
    for fix in sorted {
        let Some(diagnostic) = to_diagnostic(fix, suppress_hidden) else {
            continue;
        };
        match Url::from_file_path(Path::new(&fix.file_name)) {
            Ok(uri) => grouped.entry(uri).or_default().push(diagnostic),
            Err(()) => debug!("Skipping diagnostics for non-absolute path {}", fix.file_name),
        }
    }
    grouped
}

fn is_fadeout(quick_fix: &QuickFix) -> bool {
    quick_fix
        .tags
        .iter()
        .any(|tag| tag.eq_ignore_ascii_case("unnecessary"))
        || quick_fix
            .id
            .as_deref()
            .is_some_and(|id| FADEOUT_IDS.contains(&id))
}

/// `Solution+App` is shown as `App`
fn project_label(project: &str) -> &str {
    project.split_once('+').map_or(project, |(_, name)| name)
}
