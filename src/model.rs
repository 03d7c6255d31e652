pub mod remote;
pub mod storage;
pub mod vehicle;

pub use remote::{RemoteMirrorConfig, RemoteMirrorState};
pub use storage::{StoredCatalog, StoredPayload};
pub use vehicle::{Numeric, RawRecord, VehicleRecord};
