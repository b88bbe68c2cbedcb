use serde::{Deserialize, Serialize};

/// What an upload does when the remote name is already taken.
///
/// The discriminants are stored on disk and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameCollisionPolicy {
    #[default]
    Rename = 0,
    Overwrite = 1,
    Skip = 2,
    AskUser = 3,
}

impl NameCollisionPolicy {
    pub fn ordinal(self) -> i64 {
        self as i64
    }

    /// Decodes a stored ordinal; anything out of range falls back to `Rename`.
    pub fn from_ordinal(value: i64) -> Self {
        match value {
            1 => NameCollisionPolicy::Overwrite,
            2 => NameCollisionPolicy::Skip,
            3 => NameCollisionPolicy::AskUser,
            _ => NameCollisionPolicy::Rename,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NameCollisionPolicy::Rename => "rename",
            NameCollisionPolicy::Overwrite => "overwrite",
            NameCollisionPolicy::Skip => "skip",
            NameCollisionPolicy::AskUser => "ask-user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rename" => Some(NameCollisionPolicy::Rename),
            "overwrite" => Some(NameCollisionPolicy::Overwrite),
            "skip" => Some(NameCollisionPolicy::Skip),
            "ask-user" | "ask_user" => Some(NameCollisionPolicy::AskUser),
            _ => None,
        }
    }
}

/// Builds the `count`-th alternative for a taken remote path:
/// `/Docs/report.pdf` becomes `/Docs/report (2).pdf`.
pub fn renamed_candidate(remote_path: &str, count: u32) -> String {
    let (dir, name) = match remote_path.rfind('/') {
        Some(idx) => remote_path.split_at(idx + 1),
        None => ("", remote_path),
    };
    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = name.split_at(dot);
            format!("{dir}{stem} ({count}){ext}")
        }
        _ => format!("{dir}{name} ({count})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_stable() {
        assert_eq!(NameCollisionPolicy::Rename.ordinal(), 0);
        assert_eq!(NameCollisionPolicy::Overwrite.ordinal(), 1);
        assert_eq!(NameCollisionPolicy::Skip.ordinal(), 2);
        assert_eq!(NameCollisionPolicy::AskUser.ordinal(), 3);
        for policy in [
            NameCollisionPolicy::Rename,
            NameCollisionPolicy::Overwrite,
            NameCollisionPolicy::Skip,
            NameCollisionPolicy::AskUser,
        ] {
            assert_eq!(NameCollisionPolicy::from_ordinal(policy.ordinal()), policy);
        }
    }

    #[test]
    fn out_of_range_ordinal_is_rename() {
        assert_eq!(
            NameCollisionPolicy::from_ordinal(-1),
            NameCollisionPolicy::Rename
        );
        assert_eq!(
            NameCollisionPolicy::from_ordinal(4),
            NameCollisionPolicy::Rename
        );
        assert_eq!(NameCollisionPolicy::default(), NameCollisionPolicy::Rename);
    }

    #[test]
    fn renamed_candidate_keeps_extension() {
        assert_eq!(
            renamed_candidate("/Docs/report.pdf", 2),
            "/Docs/report (2).pdf"
        );
        assert_eq!(
            renamed_candidate("/Docs/archive.tar.gz", 3),
            "/Docs/archive.tar (3).gz"
        );
    }

    #[test]
    fn renamed_candidate_without_extension() {
        assert_eq!(renamed_candidate("/Docs/README", 2), "/Docs/README (2)");
        assert_eq!(renamed_candidate("/v1.2/notes", 2), "/v1.2/notes (2)");
        assert_eq!(renamed_candidate("/.profile", 2), "/.profile (2)");
    }
}
