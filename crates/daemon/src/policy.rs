/// How the triage engine treats a file found inside a media item directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    /// Video container worth transcoding
    Eligible,
    /// Original preserved by a previous swap (`<name>-orig`)
    OriginalBackup,
    /// Lock marker or lock temp file
    Lock,
    /// Subtitles, artwork, metadata, markers
    Sidecar,
    /// Extension not present in the policy table
    Unknown,
}

impl FileClass {
    pub fn is_eligible(self) -> bool {
        self == FileClass::Eligible
    }
}

/// Closed policy table: extension (lowercase, with leading dot) to class
const POLICY: &[(&str, FileClass)] = &[
    (".ts", FileClass::Eligible),
    (".avi", FileClass::Eligible),
    (".mkv", FileClass::Eligible),
    (".mp4", FileClass::Eligible),
    (".m2ts", FileClass::Eligible),
    (".m4v", FileClass::Eligible),
    (".wmv", FileClass::Eligible),
    (".ts-orig", FileClass::OriginalBackup),
    (".avi-orig", FileClass::OriginalBackup),
    (".mkv-orig", FileClass::OriginalBackup),
    (".mp4-orig", FileClass::OriginalBackup),
    (".m2ts-orig", FileClass::OriginalBackup),
    (".m4v-orig", FileClass::OriginalBackup),
    (".wmv-orig", FileClass::OriginalBackup),
    (".nfo-orig", FileClass::OriginalBackup),
    (".lck", FileClass::Lock),
    (".srt", FileClass::Sidecar),
    (".nfo", FileClass::Sidecar),
    (".jpg", FileClass::Sidecar),
    (".ds_store", FileClass::Sidecar),
    ("", FileClass::Sidecar),
];

/// Classify an extension as returned by [`extension_of`]. Matching ignores case.
pub fn classify(ext: &str) -> FileClass {
    let ext = ext.to_lowercase();
    POLICY
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, class)| *class)
        .unwrap_or(FileClass::Unknown)
}

/// Extension of a file name: everything from the last `.` on, dot included.
///
/// A dotfile such as `.DS_Store` is all extension; a name without a dot has
/// an empty extension. Backups keep their suffix, so `a.mkv-orig` yields
/// `.mkv-orig`.
pub fn extension_of(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(idx) => &file_name[idx..],
        None => "",
    }
}

/// Classify a file by name
pub fn classify_name(file_name: &str) -> FileClass {
    classify(extension_of(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_every_table_entry_maps_to_its_bucket() {
        for ext in [".ts", ".avi", ".mkv", ".mp4", ".m2ts", ".m4v", ".wmv"] {
            assert_eq!(classify(ext), FileClass::Eligible, "{ext}");
        }
        for ext in [".ts-orig", ".avi-orig", ".mkv-orig", ".mp4-orig", ".m2ts-orig", ".m4v-orig", ".wmv-orig", ".nfo-orig"] {
            assert_eq!(classify(ext), FileClass::OriginalBackup, "{ext}");
        }
        assert_eq!(classify(".lck"), FileClass::Lock);
        for ext in [".srt", ".nfo", ".jpg", ".DS_Store", ""] {
            assert_eq!(classify(ext), FileClass::Sidecar, "{ext:?}");
        }
    }

    #[test]
    fn test_unknown_extensions() {
        assert_eq!(classify(".iso"), FileClass::Unknown);
        assert_eq!(classify(".png"), FileClass::Unknown);
        assert_eq!(classify(".mkv.part"), FileClass::Unknown);
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("Movie (2001).mkv"), ".mkv");
        assert_eq!(extension_of("Movie.mkv-orig"), ".mkv-orig");
        assert_eq!(extension_of(".DS_Store"), ".DS_Store");
        assert_eq!(extension_of("verified-english"), "");
        assert_eq!(extension_of("transcoding-1f0e.lck"), ".lck");
    }

    #[test]
    fn test_markers_are_not_candidates() {
        assert_eq!(classify_name("verified-english"), FileClass::Sidecar);
        assert_eq!(classify_name("transcoding.lck"), FileClass::Lock);
    }

    proptest! {
        #[test]
        fn test_case_does_not_change_bucket(idx in 0usize..POLICY.len(), upper in any::<bool>()) {
            let (ext, class) = POLICY[idx];
            let ext = if upper { ext.to_uppercase() } else { ext.to_string() };
            prop_assert_eq!(classify(&ext), class);
        }

        #[test]
        fn test_names_absent_from_table_are_unknown(ext in "\\.[a-z]{5,8}") {
            prop_assume!(!POLICY.iter().any(|(known, _)| *known == ext));
            prop_assert_eq!(classify(&ext), FileClass::Unknown);
        }
    }
}
