// src/users.rs
//
// Credential lookups for Job::user/Job::group, the same
// `users::{Users, UsersCache}` shape `artisan_middleware::users::get_id` used,
// plus the socket permission helper `control_rpc` needs after bind.

use crate::error::Error;
use std::{fs, os::unix::fs::PermissionsExt, path::Path};
use users::{Groups, Users, UsersCache};

/// Resolves a user name to a uid. Used when a job spec sets `UserName`.
pub fn uid_for_name(name: &str) -> Result<u32, Error> {
    let cache = UsersCache::new();
    cache
        .get_user_by_name(name)
        .map(|u| u.uid())
        .ok_or_else(|| Error::Invalid(format!("unknown user: {}", name)))
}

/// Resolves a group name to a gid. Used when a job spec sets `GroupName`.
pub fn gid_for_name(name: &str) -> Result<u32, Error> {
    let cache = UsersCache::new();
    cache
        .get_group_by_name(name)
        .map(|g| g.gid())
        .ok_or_else(|| Error::Invalid(format!("unknown group: {}", name)))
}

/// Sets a path's Unix permission bits, e.g. `0o777` on the control socket.
pub fn set_path_permission(path: &Path, mode: u32) -> Result<(), Error> {
    let metadata = fs::metadata(path)?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(mode);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_user_is_invalid() {
        let err = uid_for_name("definitely-not-a-real-user-xyz").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn unknown_group_is_invalid() {
        let err = gid_for_name("definitely-not-a-real-group-xyz").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn root_user_resolves_on_unix() {
        assert_eq!(uid_for_name("root").unwrap(), 0);
    }

    #[test]
    fn set_path_permission_changes_mode() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("sock");
        std::fs::write(&file_path, b"").unwrap();

        set_path_permission(&file_path, 0o600).unwrap();
        let mode = std::fs::metadata(&file_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
