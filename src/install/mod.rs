//! Server provisioning
//!
//! Resolves a version specifier to a launch descriptor and installs the
//! matching package when it is not present yet.

pub mod error;
pub mod installer;
pub mod integrity;
pub mod platform;
pub mod provision;
pub mod resolver;
pub mod source;

pub use error::InstallError;
pub use installer::{DependencyInstaller, InstallOutcome};
pub use platform::PlatformInformation;
pub use provision::{Provisioned, Provisioner};
pub use resolver::{LaunchDescriptor, ResolvedServer, VersionResolver};
pub use source::{DirectoryExtractor, MirrorPackageSource, PackageExtractor, PackageSource};
