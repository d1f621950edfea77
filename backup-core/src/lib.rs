pub mod artifact;
pub mod command_stream;
pub mod error;
pub mod model;
pub mod system_check;

pub use error::{BackupError, GatewayError, GatewayErrorKind, GatewayResult, Result};
pub use model::{ExportArtifact, RetentionPolicy, Snapshot, StoredArtifact, VmIdentity};
