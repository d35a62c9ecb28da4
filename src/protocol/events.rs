//! Server events
//!
//! Event names are matched into [`EventKind`]; bodies the client acts on
//! get typed views below. Unknown names are kept verbatim in
//! [`EventKind::Other`] so subscribers can still ask for them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Server finished its own startup
    Started,
    ProjectAdded,
    ProjectChanged,
    ProjectRemoved,
    PackageRestoreStarted,
    PackageRestoreFinished,
    /// Progress of workspace-wide analyzer runs
    BackgroundDiagnosticStatus,
    ProjectDiagnosticStatus,
    Diagnostic,
    UnresolvedDependencies,
    Log,
    Error,
    Other(String),
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "started" => EventKind::Started,
            "ProjectAdded" => EventKind::ProjectAdded,
            "ProjectChanged" => EventKind::ProjectChanged,
            "ProjectRemoved" => EventKind::ProjectRemoved,
            "PackageRestoreStarted" => EventKind::PackageRestoreStarted,
            "PackageRestoreFinished" => EventKind::PackageRestoreFinished,
            "BackgroundDiagnosticStatus" => EventKind::BackgroundDiagnosticStatus,
            "ProjectDiagnosticStatus" => EventKind::ProjectDiagnosticStatus,
            "Diagnostic" => EventKind::Diagnostic,
            "UnresolvedDependencies" => EventKind::UnresolvedDependencies,
            "log" => EventKind::Log,
            "Error" => EventKind::Error,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EventKind::Started => "started",
            EventKind::ProjectAdded => "ProjectAdded",
            EventKind::ProjectChanged => "ProjectChanged",
            EventKind::ProjectRemoved => "ProjectRemoved",
            EventKind::PackageRestoreStarted => "PackageRestoreStarted",
            EventKind::PackageRestoreFinished => "PackageRestoreFinished",
            EventKind::BackgroundDiagnosticStatus => "BackgroundDiagnosticStatus",
            EventKind::ProjectDiagnosticStatus => "ProjectDiagnosticStatus",
            EventKind::Diagnostic => "Diagnostic",
            EventKind::UnresolvedDependencies => "UnresolvedDependencies",
            EventKind::Log => "log",
            EventKind::Error => "Error",
            EventKind::Other(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One event as delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub kind: EventKind,
    pub body: serde_json::Value,
    /// Generation of the connection that delivered it; 0 when untagged
    pub connection: u64,
}

impl ServerEvent {
    pub fn new(kind: EventKind, body: serde_json::Value) -> Self {
        Self {
            kind,
            body,
            connection: 0,
        }
    }

    /// Decode the body into a typed view
    pub fn body_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

// ============================================================================
// Project events
// ============================================================================

/// Body of ProjectAdded / ProjectChanged / ProjectRemoved
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProjectInformation {
    pub ms_build_project: Option<MsBuildProject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MsBuildProject {
    pub path: PathBuf,
    pub assembly_name: Option<String>,
    pub target_framework: Option<String>,
    pub source_files: Option<Vec<PathBuf>>,
}

impl ProjectInformation {
    /// Project path and source-file count, when the server reported files
    pub fn file_count(&self) -> Option<(PathBuf, usize)> {
        let project = self.ms_build_project.as_ref()?;
        let files = project.source_files.as_ref()?;
        Some((project.path.clone(), files.len()))
    }
}

// ============================================================================
// Background analysis
// ============================================================================

/// Phase carried by BackgroundDiagnosticStatus
///
/// The server sends the numeric enum value; names are accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStatusKind")]
pub enum BackgroundDiagnosticStatusKind {
    Started,
    Progress,
    Finished,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStatusKind {
    Number(u64),
    Name(String),
}

impl TryFrom<RawStatusKind> for BackgroundDiagnosticStatusKind {
    type Error = String;

    fn try_from(raw: RawStatusKind) -> Result<Self, Self::Error> {
        match raw {
            RawStatusKind::Number(0) => Ok(Self::Started),
            RawStatusKind::Number(1) => Ok(Self::Progress),
            RawStatusKind::Number(2) => Ok(Self::Finished),
            RawStatusKind::Name(name) => match name.as_str() {
                "Started" => Ok(Self::Started),
                "Progress" => Ok(Self::Progress),
                "Finished" => Ok(Self::Finished),
                _ => Err(format!("unknown background diagnostic status: {name}")),
            },
            RawStatusKind::Number(n) => Err(format!("unknown background diagnostic status: {n}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackgroundDiagnosticStatus {
    #[serde(rename = "Type")]
    pub kind: BackgroundDiagnosticStatusKind,
    #[serde(default)]
    pub number_projects: u64,
    #[serde(default)]
    pub number_files_total: u64,
    #[serde(default)]
    pub number_files_remaining: u64,
}

impl BackgroundDiagnosticStatus {
    pub fn is_finished(&self) -> bool {
        self.kind == BackgroundDiagnosticStatusKind::Finished
    }
}

// ============================================================================
// Server log forwarding
// ============================================================================

/// Body of a `log` event
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogMessage {
    pub log_level: String,
    pub name: String,
    pub message: String,
}

/// Body of `UnresolvedDependencies`; the project needs a package restore
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UnresolvedDependencies {
    pub file_name: String,
    pub unresolved_dependencies: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_names_round_trip() {
        for name in [
            "started",
            "ProjectAdded",
            "PackageRestoreFinished",
            "BackgroundDiagnosticStatus",
            "log",
        ] {
            assert_eq!(EventKind::from_name(name).name(), name);
        }

        let custom = EventKind::from_name("TestMessage");
        assert_eq!(custom, EventKind::Other("TestMessage".to_string()));
        assert_eq!(custom.to_string(), "TestMessage");
    }

    #[test]
    fn test_project_information_file_count() {
        let event = ServerEvent::new(
            EventKind::ProjectAdded,
            json!({
                "MsBuildProject": {
                    "Path": "/w/App/App.csproj",
                    "AssemblyName": "App",
                    "SourceFiles": ["/w/App/a.cs", "/w/App/b.cs"]
                }
            }),
        );

        let info: ProjectInformation = event.body_as().unwrap();
        assert_eq!(
            info.file_count(),
            Some((PathBuf::from("/w/App/App.csproj"), 2))
        );
    }

    #[test]
    fn test_unresolved_dependencies_body() {
        let event = ServerEvent::new(
            EventKind::from_name("UnresolvedDependencies"),
            json!({
                "FileName": "/w/App/App.csproj",
                "UnresolvedDependencies": [{"Name": "Newtonsoft.Json", "Version": "13.0.1"}]
            }),
        );

        assert_eq!(event.kind, EventKind::UnresolvedDependencies);
        let body: UnresolvedDependencies = event.body_as().unwrap();
        assert_eq!(body.file_name, "/w/App/App.csproj");
        assert_eq!(body.unresolved_dependencies.len(), 1);
    }

    #[test]
    fn test_project_without_source_files_has_no_count() {
        let info: ProjectInformation =
            serde_json::from_value(json!({"MsBuildProject": {"Path": "/w/a.csproj"}})).unwrap();
        assert_eq!(info.file_count(), None);

        let empty: ProjectInformation = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.file_count(), None);
    }

    #[test]
    fn test_background_status_numeric_and_named() {
        let numeric: BackgroundDiagnosticStatus = serde_json::from_value(json!({
            "Type": 2, "NumberProjects": 3, "NumberFilesTotal": 10, "NumberFilesRemaining": 0
        }))
        .unwrap();
        assert!(numeric.is_finished());
        assert_eq!(numeric.number_files_total, 10);

        let named: BackgroundDiagnosticStatus =
            serde_json::from_value(json!({"Type": "Progress"})).unwrap();
        assert_eq!(named.kind, BackgroundDiagnosticStatusKind::Progress);
        assert!(!named.is_finished());

        assert!(serde_json::from_value::<BackgroundDiagnosticStatus>(json!({"Type": 9})).is_err());
    }
}
