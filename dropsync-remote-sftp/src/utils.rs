use russh_sftp::client::error::Error;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{Status, StatusCode};

pub(crate) fn failure(message: String) -> Error {
    Error::Status(Status {
        id: 0,
        status_code: StatusCode::Failure,
        error_message: message,
        language_tag: "en-US".to_string(),
    })
}

pub(crate) fn is_status(e: &Error, code: StatusCode) -> bool {
    matches!(e, Error::Status(status) if status.status_code == code)
}

/// Joins a store-relative path onto the remote base directory.
pub(crate) fn join_remote(base: &str, rel: &str) -> String {
    match base.trim_end_matches('/') {
        "" if base.starts_with('/') => format!("/{rel}"),
        "" | "." => rel.to_string(),
        base => format!("{base}/{rel}"),
    }
}

/// Creates `path` and any missing parents. An existing directory is fine; an existing file
/// anywhere along the way is an error.
pub async fn create_dir_all(sftp: &SftpSession, path: &str) -> Result<(), Error> {
    if let Ok(attrs) = sftp.metadata(path).await {
        return if attrs.is_dir() {
            Ok(())
        } else {
            Err(failure(format!("{path} exists and is not a directory")))
        };
    }

    let absolute = path.starts_with('/');
    let mut prefix = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !prefix.is_empty() || absolute {
            prefix.push('/');
        }
        prefix.push_str(segment);
        match sftp.create_dir(prefix.as_str()).await {
            Ok(()) => {}
            // servers report an existing entry as a generic failure
            Err(e) if is_status(&e, StatusCode::Failure) => match sftp.metadata(prefix.as_str()).await {
                Ok(attrs) if attrs.is_dir() => {}
                Ok(_) => return Err(failure(format!("{prefix} is a file, not a directory"))),
                Err(_) => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Removes a directory and everything beneath it, children first.
///
/// Unlike a best-effort cleanup, every failure is reported: the caller decides whether the
/// directory is gone by looking again.
pub async fn remove_dir_all(sftp: &SftpSession, path: &str) -> Result<(), Error> {
    let attrs = sftp.symlink_metadata(path).await?;
    if !attrs.is_dir() {
        return Err(failure(format!("{path} is not a directory")));
    }

    // iterative post-order walk
    let mut stack: Vec<(String, bool)> = vec![(path.to_string(), false)];
    while let Some((dir, expanded)) = stack.pop() {
        if expanded {
            sftp.remove_dir(dir.as_str()).await?;
            continue;
        }
        stack.push((dir.clone(), true));
        for entry in sftp.read_dir(dir.as_str()).await? {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child = format!("{dir}/{name}");
            if entry.metadata().is_dir() {
                stack.push((child, false));
            } else {
                sftp.remove_file(child).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_under_base() {
        assert_eq!(join_remote("/srv/mirror", "a/b.txt"), "/srv/mirror/a/b.txt");
        assert_eq!(join_remote("/srv/mirror/", "a"), "/srv/mirror/a");
        assert_eq!(join_remote("/", "a"), "/a");
        assert_eq!(join_remote(".", "a"), "a");
        assert_eq!(join_remote("", "a"), "a");
        assert_eq!(join_remote("backup", "x"), "backup/x");
    }

    #[test]
    fn status_classification() {
        let e = failure("boom".into());
        assert!(is_status(&e, StatusCode::Failure));
        assert!(!is_status(&e, StatusCode::NoSuchFile));
        assert!(!is_status(&Error::Timeout, StatusCode::Failure));
    }
}
