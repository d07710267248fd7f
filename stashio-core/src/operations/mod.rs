//! One struct per transport operation that touches storage or the ring,
//! keeping the server handlers thin.

pub mod fetch_chunks;
pub mod get_destination;
pub mod receive_info;
pub mod store_chunks;

pub use fetch_chunks::{FetchChunksOperation, FetchChunksRequest};
pub use get_destination::GetDestinationOperation;
pub use receive_info::ReceiveInfoOperation;
pub use store_chunks::{StoreChunksOperation, StoreChunksRequest, StoreChunksResult};
