pub mod backup;
pub mod inventory;
pub mod merge;
pub mod properties;
pub mod remote;
pub mod settings;
pub mod sync;
pub mod topology;
pub mod writer;

pub use backup::{ArchiveMode, ManagedFile};
pub use inventory::{resolve_from_cloud, resolve_static, AwsCliInventory, CloudInventory, CloudQuery};
pub use merge::{upsert, LineFormat, MergeError};
pub use properties::{PropertySet, PropertyValue};
pub use remote::{CommandOutput, LocalShell, RemoteCommand, RemoteError, RemoteShell, SshOptions, SshShell};
pub use settings::{Settings, Transport};
pub use sync::{SyncGate, SyncOutcome};
pub use topology::{ClusterTopology, Host, HostRole};
pub use writer::{ConfigTarget, ConfigWriter, MergePolicy, WriteOutcome};
