pub mod cursor;
pub mod event;
pub mod kind;
pub mod record;

pub use cursor::{CursorError, FeedCursor, KindPosition};
pub use event::{ChangeEvent, EventType};
pub use kind::{parse_kind_list, KindError, KindRegistry, KindSpec};
pub use record::{format_timestamp, now, parse_timestamp, Record, RecordDecodeError, RecordRow};
