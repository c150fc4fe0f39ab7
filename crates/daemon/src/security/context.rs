//! Per-request security context.

use std::fs;
use std::path::{Path, PathBuf};

use protocol::{Share, User};

/// A filesystem root the caller may operate within.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedRoot {
    /// Name of the share that grants the root.
    pub share: String,
    /// Canonical root path (lexical when the share path does not exist).
    pub path: PathBuf,
    /// Whether mutations below this root are refused for non-admins.
    pub read_only: bool,
}

/// The set of roots a user may touch, computed fresh for every request.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    user: User,
    roots: Vec<AllowedRoot>,
}

impl SecurityContext {
    /// Compute the context for `user` from the current share list.
    ///
    /// Admins get every share's path, enabled or not. Everybody else gets
    /// the enabled shares that are guest-accessible or that name them (or
    /// one of their groups). Roots are ordered by share name. A directory
    /// granted by two shares keeps both entries so either name addresses it.
    pub fn resolve(user: &User, shares: &[Share]) -> Self {
        let mut sorted: Vec<&Share> = shares.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut roots: Vec<AllowedRoot> = Vec::new();
        for share in sorted {
            if !user.is_admin() && !grants_access(share, user) {
                continue;
            }
            if !share.path.is_absolute() {
                tracing::warn!(
                    share = %share.name,
                    path = %share.path.display(),
                    "Ignoring share with relative path"
                );
                continue;
            }

            let path = fs::canonicalize(&share.path).unwrap_or_else(|_| share.path.clone());
            roots.push(AllowedRoot {
                share: share.name.clone(),
                path,
                read_only: share.read_only,
            });
        }

        tracing::debug!(user = %user.username, roots = roots.len(), "Resolved security context");
        Self {
            user: user.clone(),
            roots,
        }
    }

    /// The authenticated user.
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Whether the user is an admin.
    pub fn is_admin(&self) -> bool {
        self.user.is_admin()
    }

    /// Allowed roots, ordered by share name.
    pub fn allowed_roots(&self) -> &[AllowedRoot] {
        &self.roots
    }

    /// The root granted by the named share, if the user can see it.
    pub fn root_for_share(&self, name: &str) -> Option<&AllowedRoot> {
        self.roots.iter().find(|r| r.share == name)
    }

    /// The most specific root containing `path`.
    ///
    /// Matching is per path component, so `/data/public-secret` is not inside
    /// `/data/public`. When two shares expose the same directory, a writable
    /// one wins.
    pub fn matching_root(&self, path: &Path) -> Option<&AllowedRoot> {
        self.roots
            .iter()
            .filter(|r| path.starts_with(&r.path))
            .max_by_key(|r| (r.path.components().count(), !r.read_only))
    }

    /// Whether `path` is exactly one of the allowed roots.
    pub fn is_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|r| r.path == path)
    }

    /// Roots strictly inside `path`.
    pub fn roots_below<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a AllowedRoot> + 'a {
        self.roots
            .iter()
            .filter(move |r| r.path != path && r.path.starts_with(path))
    }
}

fn grants_access(share: &Share, user: &User) -> bool {
    if !share.enabled {
        return false;
    }
    if share.guest_ok {
        return true;
    }
    if share.valid_users.iter().any(|u| u.trim() == user.username) {
        return true;
    }
    share
        .valid_groups
        .iter()
        .any(|g| user.groups.iter().any(|ug| ug == g.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Role;

    fn shares() -> Vec<Share> {
        let public = Share {
            guest_ok: true,
            ..Share::new(1, "public", "/mnt/data/public")
        };
        let eng = Share {
            valid_users: vec!["alice".to_string()],
            ..Share::new(2, "eng", "/mnt/data/eng")
        };
        let ops = Share {
            valid_groups: vec!["ops".to_string()],
            read_only: true,
            ..Share::new(3, "ops", "/mnt/data/ops")
        };
        let archive = Share {
            guest_ok: true,
            enabled: false,
            ..Share::new(4, "archive", "/mnt/data/archive")
        };
        vec![public, eng, ops, archive]
    }

    fn names(ctx: &SecurityContext) -> Vec<&str> {
        ctx.allowed_roots().iter().map(|r| r.share.as_str()).collect()
    }

    #[test]
    fn test_guest_share_visible_to_everyone() {
        let bob = User::new(2, "bob", Role::User);
        let ctx = SecurityContext::resolve(&bob, &shares());
        assert_eq!(names(&ctx), vec!["public"]);
        assert!(!ctx.is_admin());
    }

    #[test]
    fn test_valid_users_grant() {
        let alice = User::new(1, "alice", Role::User);
        let ctx = SecurityContext::resolve(&alice, &shares());
        assert_eq!(names(&ctx), vec!["eng", "public"]);
    }

    #[test]
    fn test_group_grant() {
        let carol = User::new(3, "carol", Role::User).with_groups(["ops"]);
        let ctx = SecurityContext::resolve(&carol, &shares());
        assert_eq!(names(&ctx), vec!["ops", "public"]);
        assert!(ctx.root_for_share("ops").unwrap().read_only);
    }

    #[test]
    fn test_disabled_share_hidden_from_users_but_not_admins() {
        let bob = User::new(2, "bob", Role::User);
        let ctx = SecurityContext::resolve(&bob, &shares());
        assert!(ctx.root_for_share("archive").is_none());

        let root = User::new(0, "root", Role::Admin);
        let ctx = SecurityContext::resolve(&root, &shares());
        assert_eq!(names(&ctx), vec!["archive", "eng", "ops", "public"]);
        assert!(ctx.is_admin());
    }

    #[test]
    fn test_relative_share_path_ignored() {
        let shares = vec![Share {
            guest_ok: true,
            ..Share::new(1, "bad", "relative/dir")
        }];
        let ctx = SecurityContext::resolve(&User::new(1, "bob", Role::User), &shares);
        assert!(ctx.allowed_roots().is_empty());
    }

    #[test]
    fn test_no_shares_yields_empty_roots() {
        let ctx = SecurityContext::resolve(&User::new(1, "bob", Role::Guest), &[]);
        assert!(ctx.allowed_roots().is_empty());
        assert!(ctx.matching_root(Path::new("/mnt/data")).is_none());
    }

    #[test]
    fn test_matching_root_respects_segment_boundary() {
        let bob = User::new(2, "bob", Role::User);
        let ctx = SecurityContext::resolve(&bob, &shares());

        assert!(ctx.matching_root(Path::new("/mnt/data/public")).is_some());
        assert!(ctx.matching_root(Path::new("/mnt/data/public/a/b")).is_some());
        assert!(ctx.matching_root(Path::new("/mnt/data/public-secret")).is_none());
        assert!(ctx.matching_root(Path::new("/mnt/data")).is_none());
    }

    #[test]
    fn test_most_specific_root_wins() {
        let outer = Share {
            guest_ok: true,
            read_only: true,
            ..Share::new(1, "data", "/mnt/data")
        };
        let inner = Share {
            guest_ok: true,
            ..Share::new(2, "public", "/mnt/data/public")
        };
        let ctx = SecurityContext::resolve(&User::new(1, "bob", Role::User), &[outer, inner]);

        let root = ctx.matching_root(Path::new("/mnt/data/public/x")).unwrap();
        assert_eq!(root.share, "public");
        assert!(!root.read_only);
        assert!(ctx.matching_root(Path::new("/mnt/data/other")).unwrap().read_only);
    }

    #[test]
    fn test_same_directory_through_writable_share_stays_writable() {
        let ro = Share {
            guest_ok: true,
            read_only: true,
            ..Share::new(1, "a-ro", "/mnt/data/public")
        };
        let rw = Share {
            guest_ok: true,
            ..Share::new(2, "b-rw", "/mnt/data/public")
        };
        let ctx = SecurityContext::resolve(&User::new(1, "bob", Role::User), &[rw, ro]);
        assert_eq!(ctx.allowed_roots().len(), 2);
        let root = ctx.matching_root(Path::new("/mnt/data/public/x")).unwrap();
        assert_eq!(root.share, "b-rw");
        assert!(ctx.root_for_share("a-ro").unwrap().read_only);
        assert!(ctx.is_root(Path::new("/mnt/data/public")));
    }
}
