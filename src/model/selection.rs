//! Pure selection edits over a [`SyncEntry`].
//!
//! Every edit takes the entry by value, changes the touched leaves and runs
//! [`recompute_selection`] so parents always agree with their children.

use super::entry::{SelectionState, SyncEntry, TabType};

/// Recompute parent selection states bottom-up.
///
/// - The files tab mirrors the files (when there are any).
/// - The entry's children are its selectable tabs, plus the files themselves
///   when the course has no files tab. With no children the entry keeps its
///   explicit state.
/// - The additional-content tab is selected only for a full-content sync.
pub fn recompute_selection(mut entry: SyncEntry) -> SyncEntry {
    if !entry.files.is_empty() {
        let all = entry.files.iter().all(|f| f.is_selected());
        let any = entry.files.iter().any(|f| f.selection_state.is_any());
        let files_state = SelectionState::from_children(all, any);
        for tab in entry.tabs.iter_mut().filter(|t| t.tab_type == TabType::Files) {
            tab.selection_state = files_state;
        }
    }

    let has_files_tab = entry.tabs.iter().any(|t| t.tab_type == TabType::Files);
    let mut children: Vec<SelectionState> = entry
        .tabs
        .iter()
        .filter(|t| t.tab_type != TabType::AdditionalContent)
        .map(|t| t.selection_state)
        .collect();
    if !has_files_tab {
        children.extend(entry.files.iter().map(|f| f.selection_state));
    }

    if !children.is_empty() {
        let all = children.iter().all(|s| *s == SelectionState::Selected);
        let any = children.iter().any(SelectionState::is_any);
        entry.selection_state = SelectionState::from_children(all, any);
    }

    let full = entry.is_full_content_sync();
    for tab in entry
        .tabs
        .iter_mut()
        .filter(|t| t.tab_type == TabType::AdditionalContent)
    {
        tab.selection_state = SelectionState::from_bool(full);
    }

    entry
}

/// Select or deselect the whole course.
pub fn select_course(mut entry: SyncEntry, selected: bool) -> SyncEntry {
    let state = SelectionState::from_bool(selected);
    entry.selection_state = state;
    for tab in &mut entry.tabs {
        tab.selection_state = state;
    }
    for file in &mut entry.files {
        file.selection_state = state;
    }
    recompute_selection(entry)
}

/// Toggle one tab. Toggling the files tab toggles every file.
/// Unknown ids leave the entry unchanged apart from the recompute.
pub fn select_tab(mut entry: SyncEntry, tab_id: &str, selected: bool) -> SyncEntry {
    let state = SelectionState::from_bool(selected);
    let mut is_files_tab = false;
    if let Some(tab) = entry.tab_mut(tab_id) {
        if tab.tab_type == TabType::AdditionalContent {
            // Follows the course; not user selectable.
            return recompute_selection(entry);
        }
        tab.selection_state = state;
        is_files_tab = tab.tab_type == TabType::Files;
    }
    if is_files_tab {
        for file in &mut entry.files {
            file.selection_state = state;
        }
    }
    recompute_selection(entry)
}

pub fn select_file(mut entry: SyncEntry, file_id: &str, selected: bool) -> SyncEntry {
    if let Some(file) = entry.file_mut(file_id) {
        file.selection_state = SelectionState::from_bool(selected);
    }
    recompute_selection(entry)
}

/// Rebuild the selection of a freshly composed entry from persisted keys.
///
/// Keys that do not belong to this course are ignored.
pub fn apply_selections(entry: SyncEntry, keys: &[String]) -> SyncEntry {
    let mut entry = select_course(entry, false);
    if keys.iter().any(|k| *k == entry.id) {
        return select_course(entry, true);
    }

    let tab_prefix = format!("{}/tabs/", entry.id);
    let file_prefix = format!("{}/files/", entry.id);
    for key in keys.iter().filter(|k| k.starts_with(&tab_prefix)) {
        entry = select_tab(entry, key, true);
    }
    for key in keys.iter().filter(|k| k.starts_with(&file_prefix)) {
        entry = select_file(entry, key, true);
    }
    entry
}

/// Smallest set of keys that reproduces the entry's selection through
/// [`apply_selections`].
pub fn selection_keys(entry: &SyncEntry) -> Vec<String> {
    if entry.selection_state == SelectionState::Selected {
        return vec![entry.id.clone()];
    }

    let mut keys: Vec<String> = entry
        .tabs
        .iter()
        .filter(|t| t.tab_type != TabType::AdditionalContent)
        .filter(|t| t.selection_state == SelectionState::Selected)
        .map(|t| t.id.clone())
        .collect();

    let files_tab_selected = entry
        .tab_of_type(TabType::Files)
        .is_some_and(|t| t.selection_state == SelectionState::Selected);
    if !files_tab_selected {
        keys.extend(entry.selected_files().map(|f| f.id.clone()));
    }
    keys
}

/// Course id encoded in a selection key (`courses/{cid}` or a child key).
pub fn course_id_of_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("courses/")?;
    let course_id = rest.split('/').next()?;
    (!course_id.is_empty()).then_some(course_id)
}

/// Distinct course ids in `keys`, in first-seen order.
pub fn selected_course_ids(keys: &[String]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in keys.iter().filter_map(|k| course_id_of_key(k)) {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entry::fixtures::{entry, file};
    use crate::model::entry::{file_id, tab_id};

    fn course_with_files() -> SyncEntry {
        entry(
            "7",
            &[TabType::Pages, TabType::Files],
            vec![file("7", "1", 10), file("7", "2", 20)],
        )
    }

    fn tab_state(e: &SyncEntry, tab: TabType) -> SelectionState {
        e.tab_of_type(tab).map(|t| t.selection_state).unwrap_or_default()
    }

    #[test]
    fn test_single_file_makes_parents_partial() {
        let e = select_file(course_with_files(), &file_id("7", "1"), true);
        assert_eq!(tab_state(&e, TabType::Files), SelectionState::PartiallySelected);
        assert_eq!(e.selection_state, SelectionState::PartiallySelected);
        assert_eq!(tab_state(&e, TabType::AdditionalContent), SelectionState::NotSelected);
    }

    #[test]
    fn test_all_children_selected_selects_course() {
        let mut e = select_tab(course_with_files(), &tab_id("7", TabType::Pages), true);
        e = select_file(e, &file_id("7", "1"), true);
        e = select_file(e, &file_id("7", "2"), true);
        assert_eq!(tab_state(&e, TabType::Files), SelectionState::Selected);
        assert_eq!(e.selection_state, SelectionState::Selected);
        assert_eq!(tab_state(&e, TabType::AdditionalContent), SelectionState::Selected);
    }

    #[test]
    fn test_files_tab_toggles_all_files() {
        let e = select_tab(course_with_files(), &tab_id("7", TabType::Files), true);
        assert_eq!(e.selected_files_count(), 2);
        assert_eq!(e.selection_state, SelectionState::PartiallySelected);

        let e = select_tab(e, &tab_id("7", TabType::Files), false);
        assert_eq!(e.selected_files_count(), 0);
        assert_eq!(e.selection_state, SelectionState::NotSelected);
    }

    #[test]
    fn test_files_without_tab_are_direct_children() {
        let e = entry("3", &[], vec![file("3", "1", 5), file("3", "2", 5)]);
        let e = select_file(e, &file_id("3", "1"), true);
        assert_eq!(e.selection_state, SelectionState::PartiallySelected);
        let e = select_file(e, &file_id("3", "2"), true);
        assert_eq!(e.selection_state, SelectionState::Selected);
    }

    #[test]
    fn test_childless_entry_keeps_explicit_state() {
        let e = select_course(entry("9", &[], Vec::new()), true);
        assert_eq!(e.selection_state, SelectionState::Selected);
        assert_eq!(tab_state(&e, TabType::AdditionalContent), SelectionState::Selected);
        let e = recompute_selection(e);
        assert_eq!(e.selection_state, SelectionState::Selected);
    }

    #[test]
    fn test_additional_content_is_not_user_selectable() {
        let e = select_tab(course_with_files(), &tab_id("7", TabType::AdditionalContent), true);
        assert_eq!(tab_state(&e, TabType::AdditionalContent), SelectionState::NotSelected);
        assert_eq!(e.selection_state, SelectionState::NotSelected);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let e = select_file(course_with_files(), &file_id("7", "2"), true);
        assert_eq!(recompute_selection(e.clone()), e);
    }

    #[test]
    fn test_apply_whole_course_key() {
        let e = apply_selections(course_with_files(), &["courses/7".to_string()]);
        assert!(e.is_full_content_sync());
        assert_eq!(e.selected_files_count(), 2);
        assert_eq!(e.selection_count(), 3);
    }

    #[test]
    fn test_apply_ignores_other_courses() {
        let keys = vec![
            "courses/8".to_string(),
            "courses/70/tabs/pages".to_string(),
            file_id("7", "2"),
        ];
        let e = apply_selections(course_with_files(), &keys);
        assert_eq!(e.selected_files_count(), 1);
        assert_eq!(tab_state(&e, TabType::Pages), SelectionState::NotSelected);
    }

    #[test]
    fn test_selection_keys_round_trip() {
        let mut e = select_tab(course_with_files(), &tab_id("7", TabType::Pages), true);
        e = select_file(e, &file_id("7", "1"), true);

        let keys = selection_keys(&e);
        assert_eq!(keys, vec![tab_id("7", TabType::Pages), file_id("7", "1")]);
        assert_eq!(apply_selections(course_with_files(), &keys), e);
    }

    #[test]
    fn test_course_id_of_key() {
        assert_eq!(course_id_of_key("courses/12"), Some("12"));
        assert_eq!(course_id_of_key("courses/12/files/4"), Some("12"));
        assert_eq!(course_id_of_key("courses/"), None);
        assert_eq!(course_id_of_key("groups/3"), None);
    }

    #[test]
    fn test_selected_course_ids_dedupes() {
        let keys = vec![
            "courses/2/tabs/pages".to_string(),
            "courses/1".to_string(),
            "courses/2/files/9".to_string(),
        ];
        assert_eq!(selected_course_ids(&keys), vec!["2", "1"]);
    }

    #[test]
    fn test_selection_keys_collapse_selected_files_tab() {
        let e = select_tab(course_with_files(), &tab_id("7", TabType::Files), true);
        assert_eq!(selection_keys(&e), vec![tab_id("7", TabType::Files)]);
    }
}
