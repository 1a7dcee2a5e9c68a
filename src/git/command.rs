//! Classification of the command line a client asked the server to run.

use crate::repo::RepoName;

/// Prefix shared by every git transport binary.
pub const GIT_COMMAND_PREFIX: &str = "git";

pub const RECEIVE_PACK: &str = "git-receive-pack";
pub const UPLOAD_PACK: &str = "git-upload-pack";
pub const UPLOAD_ARCHIVE: &str = "git-upload-archive";

/// The pack-protocol operations the gateway can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    ReceivePack,
    UploadPack,
    UploadArchive,
}

impl Service {
    /// Subcommand passed to the `git` binary.
    pub fn subcommand(self) -> &'static str {
        match self {
            Service::ReceivePack => "receive-pack",
            Service::UploadPack => "upload-pack",
            Service::UploadArchive => "upload-archive",
        }
    }
}

/// A classified session command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCommand {
    ReceivePack(RepoName),
    UploadPack(RepoName),
    UploadArchive(RepoName),
    /// Anything that is not a git transport request, including an empty
    /// (interactive) command line.
    Other,
}

impl GitCommand {
    /// Classify a tokenized command line such as
    /// `["git-upload-pack", "/org/repo.git"]`.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Self {
        if args.len() < 2 {
            return GitCommand::Other;
        }
        let program = args[0].as_ref();
        if !program.starts_with(GIT_COMMAND_PREFIX) {
            return GitCommand::Other;
        }

        let repo = RepoName::sanitize(args[1].as_ref());
        match program {
            RECEIVE_PACK => GitCommand::ReceivePack(repo),
            UPLOAD_PACK => GitCommand::UploadPack(repo),
            UPLOAD_ARCHIVE => GitCommand::UploadArchive(repo),
            _ => GitCommand::Other,
        }
    }

    pub fn service(&self) -> Option<Service> {
        match self {
            GitCommand::ReceivePack(_) => Some(Service::ReceivePack),
            GitCommand::UploadPack(_) => Some(Service::UploadPack),
            GitCommand::UploadArchive(_) => Some(Service::UploadArchive),
            GitCommand::Other => None,
        }
    }

    pub fn repo(&self) -> Option<&RepoName> {
        match self {
            GitCommand::ReceivePack(repo)
            | GitCommand::UploadPack(repo)
            | GitCommand::UploadArchive(repo) => Some(repo),
            GitCommand::Other => None,
        }
    }
}

/// Split a raw exec request into tokens.
///
/// Git quotes the repository argument with single quotes
/// (`git-upload-pack '/org/repo.git'`, embedded quotes as `'\''`).  Double
/// quotes and backslash escapes are honoured as well.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_token = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}
