pub mod documents;
pub mod error;
pub mod merge;
pub mod page;
pub mod query;

pub use documents::{
    DataKey, Datum, DatumPage, Descriptor, Document, Event, EventPage, Fields, Resource, RunStart,
    RunStop,
};
pub use error::{Error, Result};
pub use merge::{merge_by_time, Timed};
pub use page::{repack, RecordPage, DEFAULT_PAGE_SIZE};
pub use query::Query;
