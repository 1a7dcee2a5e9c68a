use std::fmt;

/// A repository name derived from client input.
///
/// Produced by [`RepoName::sanitize`]: leading separators are stripped,
/// `.` and `a/..` segments are collapsed lexically and the `.git` suffix is
/// removed.  Leading `..` segments cannot be collapsed and are kept so the
/// confinement check rejects them rather than silently rewriting the name.
///
/// The default (empty) name stands for "no particular repository" and is
/// what connection-level access checks ask about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoName(String);

impl RepoName {
    pub fn sanitize(raw: &str) -> Self {
        let raw = raw.trim().trim_start_matches('/');

        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => match segments.last() {
                    Some(&last) if last != ".." => {
                        segments.pop();
                    }
                    _ => segments.push(".."),
                },
                other => segments.push(other),
            }
        }

        let joined = segments.join("/");
        let name = joined.strip_suffix(".git").unwrap_or(&joined);
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Directory name of the bare repository, relative to the store root.
    ///
    /// Bare repositories end in `.git`, see gitrepository-layout(5).
    pub fn dir_name(&self) -> String {
        format!("{}.git", self.0)
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
