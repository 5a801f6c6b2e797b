//! Shared-memory handler table: the root data store of bpftime-rs, plus
//! its snapshot codec.

pub mod error;
pub mod shm;
pub mod slot;
pub mod snapshot;
pub mod table;

pub use error::{CodecError, TableError};
pub use shm::ShmSegment;
pub use slot::{
    EpollHandle, Handler, LinkHandle, MapAttr, MapHandle, MapStorage, MapType, PerfEventHandle,
    PerfEventType, ProgramHandle,
};
pub use snapshot::{export_table, import_table};
pub use table::{HandlerTable, DEFAULT_MAX_SIZE};
