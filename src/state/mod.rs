mod store;
mod view;

pub use store::{FileStateStore, MemoryStateStore};
pub use view::{ACTIVE_VIEW_KEY, ActiveView, AppState};
