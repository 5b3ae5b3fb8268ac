//! Workspace path containment for sandbox file access.
//!
//! Paths are treated as POSIX strings regardless of host platform: the sandbox
//! is a remote Linux environment and its paths never touch the local
//! filesystem through this module.

/// Resolve a model-supplied path to a sandbox path inside `workspace_root`.
///
/// Accepted forms:
/// - repo-relative (`src/main.ts`, `./src/main.ts`)
/// - workspace-prefixed (`workspace/repo/src/main.ts`)
/// - absolute paths that contain the workspace segment
///   (`/home/sandbox/workspace/repo/src/main.ts`)
///
/// Returns `None` when the normalized path escapes the workspace root or is an
/// absolute path outside it.
pub fn resolve_workspace_path(input: &str, workspace_root: &str) -> Option<String> {
    let root = normalize_posix(workspace_root.trim_matches('/'))?;
    let input = input.trim().replace('\\', "/");

    let candidate = if input.starts_with('/') {
        let segment = format!("/{root}/");
        let index = input.find(&segment)?;
        format!("{root}/{}", &input[index + segment.len()..])
    } else if input == root || input.starts_with(&format!("{root}/")) {
        input
    } else {
        format!("{root}/{input}")
    };

    let resolved = normalize_posix(&candidate)?;
    contains(&root, &resolved).then_some(resolved)
}

/// Collapse `.` and `..` segments and repeated separators.
///
/// Returns `None` if `..` climbs above the start of the path.
pub fn normalize_posix(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

fn contains(root: &str, path: &str) -> bool {
    path == root || path.starts_with(&format!("{root}/"))
}
