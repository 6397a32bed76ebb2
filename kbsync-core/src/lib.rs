mod dify;
mod status;
mod wimi;

pub use dify::{Dataset, DifyClient, DifyError, DocumentInfo};
pub use status::ApiErrorClass;
pub use wimi::{
    DirEntry, EntryList, FileEntry, Project, WimiClient, WimiCredentials, WimiError, WimiSession,
};
