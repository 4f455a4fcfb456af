pub mod cursor;
pub mod lock;

pub use cursor::{Cursor, CursorStore, PersistenceError};
pub use lock::RunLock;
