//! Turning a resolved server into a concrete command line

use std::path::{Path, PathBuf};

use crate::config::ClientOptions;
use crate::install::resolver::LaunchDescriptor;
use crate::server::error::ServerError;

/// Fully specified server command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchTarget {
    /// Build the command that serves `workspace` (a directory or a solution/project file)
    pub fn for_workspace(
        descriptor: &LaunchDescriptor,
        workspace: &Path,
        options: &ClientOptions,
    ) -> Result<Self, ServerError> {
        let mut args = Vec::new();

        let program = match descriptor {
            LaunchDescriptor::RuntimeHosted { dll } => {
                if !dll.exists() {
                    return Err(ServerError::ExecutableNotFound(dll.display().to_string()));
                }
                args.push(dll.display().to_string());
                options.dotnet_path.clone()
            }
            LaunchDescriptor::Native {
                executable,
                mono_fallback,
            } => match mono_fallback {
                // launcher script missing: run the framework build under mono
                Some(fallback) if !executable.exists() && fallback.exists() => {
                    args.push(fallback.display().to_string());
                    options.mono_path.clone()
                }
                _ if executable.exists() => executable.clone(),
                _ => {
                    return Err(ServerError::ExecutableNotFound(
                        executable.display().to_string(),
                    ));
                }
            },
        };

        args.extend(server_arguments(workspace, options, std::process::id()));

        Ok(Self {
            program,
            args,
            working_dir: working_dir_for(workspace),
        })
    }

    /// Human-readable command line for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Arguments understood by the server itself
fn server_arguments(workspace: &Path, options: &ClientOptions, host_pid: u32) -> Vec<String> {
    let mut args = vec![
        "-s".to_string(),
        workspace.display().to_string(),
        "--hostPID".to_string(),
        host_pid.to_string(),
        "--encoding".to_string(),
        "utf-8".to_string(),
        "--loglevel".to_string(),
        options.logging_level.clone(),
    ];

    if options.enable_roslyn_analyzers {
        args.push("RoslynExtensionsOptions:EnableAnalyzersSupport=true".to_string());
    }

    args.extend(options.extra_args.iter().cloned());
    args
}

/// Solution or project files run from their containing directory
fn working_dir_for(workspace: &Path) -> PathBuf {
    if workspace.is_file() {
        workspace
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        workspace.to_path_buf()
    }
}
