pub mod entry;
pub mod selection;

pub use entry::{
    entry_id, file_id, rollup, tab_id, DownloadState, SelectionState, SyncEntry, SyncFile,
    SyncTab, TabType,
};
pub use selection::{
    apply_selections, course_id_of_key, recompute_selection, select_course, select_file, select_tab,
    selected_course_ids, selection_keys,
};
