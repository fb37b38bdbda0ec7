mod file_record;
mod identity;

pub use file_record::{FileKey, FileRecord, ROOT_FOLDER};
pub use identity::Identity;
