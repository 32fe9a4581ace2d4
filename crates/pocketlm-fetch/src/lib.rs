pub mod catalog;
pub mod error;
pub mod layout;
pub mod manager;
pub mod store;
pub mod transport;

mod tests;

pub use catalog::{CatalogCache, CatalogDocument, CatalogError, JsonFileCatalog, ModelCatalog};
pub use error::{FetchError, FetchErrorKind};
pub use layout::{DiscoveredFile, FileKind, ModelLayout};
pub use manager::{DownloadConfig, DownloadManager, JobSignal, sha256_file};
pub use store::DownloadStore;
pub use transport::{ByteStream, HttpTransport, HttpTransportConfig, TransferResponse, Transport};
