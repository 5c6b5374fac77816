//! On-disk layout of offline course content.
//!
//! ```text
//! {root}/course-{cid}/{tab}.json
//! {root}/course-{cid}/file_listing.json
//! {root}/course-{cid}/files/file-{fid}/{file name}
//! {root}/course-{cid}/files/file-{fid}/.stamp.json
//! {root}/course-{cid}/embedded/{digest}.{ext}
//! {root}/course-{cid}/modules/page-{page url}.json
//! {root}/course-{cid}/modules/file-{fid}/{file name}
//! ```

use std::path::PathBuf;

use crate::model::TabType;

#[derive(Debug, Clone)]
pub struct OfflineLayout {
    root: PathBuf,
}

impl OfflineLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn course_dir(&self, course_id: &str) -> PathBuf {
        self.root.join(format!("course-{}", clean_filename(course_id)))
    }

    pub fn files_dir(&self, course_id: &str) -> PathBuf {
        self.course_dir(course_id).join("files")
    }

    pub fn file_dir(&self, course_id: &str, file_id: &str) -> PathBuf {
        self.files_dir(course_id)
            .join(format!("file-{}", clean_filename(file_id)))
    }

    pub fn file_path(&self, course_id: &str, file_id: &str, file_name: &str) -> PathBuf {
        let name = clean_filename(file_name);
        let name = if name.is_empty() { "file".to_string() } else { name };
        self.file_dir(course_id, file_id).join(name)
    }

    /// Last file listing fetched for the course.
    pub fn file_listing_path(&self, course_id: &str) -> PathBuf {
        self.course_dir(course_id).join("file_listing.json")
    }

    /// Images and attachments referenced from stored HTML.
    pub fn embedded_dir(&self, course_id: &str) -> PathBuf {
        self.course_dir(course_id).join("embedded")
    }

    pub fn modules_dir(&self, course_id: &str) -> PathBuf {
        self.course_dir(course_id).join("modules")
    }

    pub fn module_page_path(&self, course_id: &str, page_url: &str) -> PathBuf {
        self.modules_dir(course_id)
            .join(format!("page-{}.json", clean_filename(page_url)))
    }

    pub fn module_file_path(&self, course_id: &str, file_id: &str, file_name: &str) -> PathBuf {
        let name = clean_filename(file_name);
        let name = if name.is_empty() { "file".to_string() } else { name };
        self.modules_dir(course_id)
            .join(format!("file-{}", clean_filename(file_id)))
            .join(name)
    }

    pub fn tab_path(&self, course_id: &str, tab: TabType) -> PathBuf {
        self.course_dir(course_id)
            .join(format!("{}.json", tab.as_str()))
    }

    pub fn front_page_path(&self, course_id: &str) -> PathBuf {
        self.course_dir(course_id).join("front_page.json")
    }

    /// Ids of courses with content under the root. A missing root has none.
    pub fn course_ids_on_disk(&self) -> std::io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(course_id_of_dir) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Course id encoded in a `course-{cid}` directory name.
pub fn course_id_of_dir(name: &str) -> Option<&str> {
    name.strip_prefix("course-").filter(|id| !id.is_empty())
}

/// File id encoded in a `file-{fid}` directory name.
pub fn file_id_of_dir(name: &str) -> Option<&str> {
    name.strip_prefix("file-").filter(|id| !id.is_empty())
}

/// Strip characters that are invalid on common filesystems.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}
