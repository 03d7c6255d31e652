//! Data layer for a used-car dealership catalog: the canonical list of
//! cars, its local persistence, and an optional mirror of that list kept
//! in a GitHub repository.

pub mod cache;
pub mod display;
pub mod events;
pub mod model;
pub mod normalize;
pub mod query;
pub mod remote;
pub mod store;

pub use cache::{FileStorage, MemoryStorage, Storage, StorageError};
pub use events::{Event, EventBus};
pub use model::{Numeric, RawRecord, RemoteMirrorConfig, RemoteMirrorState, VehicleRecord};
pub use normalize::{normalize_collection, parse_collection, slugify, ShapeError};
pub use query::{CatalogQuery, SortOrder};
pub use remote::{
    HttpRequest, HttpResponse, HttpTransport, Method, PushReceipt, RemoteMirror, RemoteSnapshot,
    ReqwestTransport, SyncError,
};
pub use store::{CatalogError, CatalogStore, DefaultDataset};
