pub mod hashing;

mod resource_id;
pub use resource_id::ResourceId;

pub mod handle;
pub use handle::{GenericHandle, Handle, HandleState, Resource, WeakHandle};

pub mod header;
pub use header::{CompressionMethod, ResourceHeader};
