//! Virtual path helpers.
//!
//! Virtual and backend paths are slash separated, absolute, and never end
//! with a slash (except `/` itself). They are plain strings rather than
//! `std::path::Path` so routing behaves identically on every platform.

/// Suffix marking a balanced mount (`/a/b.balance1` shares `/a/b`).
const BALANCE_MARKER: &str = ".balance";

/// Normalize a path: leading `/`, no empty or `.` segments, `..` resolved,
/// no trailing slash.
pub fn fix_and_clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// True if `child` equals `parent` or lies beneath it.
pub fn is_sub_path(parent: &str, child: &str) -> bool {
    let parent = fix_and_clean(parent);
    let child = fix_and_clean(child);
    parent == "/" || child == parent || child.starts_with(&format!("{}/", parent))
}

/// Strip the balance marker: `/a/b.balance1` -> `/a/b`.
pub fn actual_mount_path(mount_path: &str) -> &str {
    match mount_path.find(BALANCE_MARKER) {
        Some(i) => &mount_path[..i],
        None => mount_path,
    }
}

/// Join a base path and a (possibly multi-segment) tail.
pub fn join(base: &str, tail: &str) -> String {
    fix_and_clean(&format!("{}/{}", base, tail))
}

/// Last segment of a path (empty for `/`).
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or("")
}

/// Parent directory of a path (`/` for top-level entries and for `/`).
pub fn parent(path: &str) -> String {
    let clean = fix_and_clean(path);
    match clean.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => clean[..i].to_string(),
    }
}

/// `path` relative to `base`, without a leading slash. `None` if `path` is
/// not under `base`.
pub fn relative(base: &str, path: &str) -> Option<String> {
    let base = fix_and_clean(base);
    let path = fix_and_clean(path);
    if !is_sub_path(&base, &path) {
        return None;
    }
    let rest = if base == "/" {
        &path[1..]
    } else {
        path[base.len()..].trim_start_matches('/')
    };
    Some(rest.to_string())
}

/// Number of segments in a normalized path (`/` has 0).
pub fn depth(path: &str) -> usize {
    fix_and_clean(path).split('/').filter(|s| !s.is_empty()).count()
}
