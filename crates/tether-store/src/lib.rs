pub mod credentials;
pub mod error;
pub mod keyed;
pub mod registry;
pub mod snapshot;

pub use credentials::{CredentialStore, FsCredentialStore};
pub use error::StoreError;
pub use keyed::{KeyedStore, ReadPolicy, StoreConfig, StoreEvent, StoreStats};
pub use registry::RegistryFile;
pub use snapshot::Durability;
