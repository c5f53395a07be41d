// Coding-agent binary discovery (§4.3: explicit override, then PATH,
// then conventional per-OS install locations, then bare command name).

use std::path::PathBuf;

/// Resolve the coding-agent binary path. `explicit` wins outright
/// (config override); otherwise fall back through PATH and a handful
/// of conventional install locations before giving up on a bare name
/// and letting the spawn fail loudly if truly absent.
pub fn resolve_agent_binary(explicit: Option<&PathBuf>) -> String {
    if let Some(path) = explicit {
        return path.to_string_lossy().to_string();
    }

    if let Some(found) = which_on_path("claude") {
        return found;
    }

    if let Some(found) = search_conventional_locations() {
        return found;
    }

    if cfg!(windows) {
        "claude.cmd".to_string()
    } else {
        "claude".to_string()
    }
}

fn which_on_path(bin: &str) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().to_string());
        }
    }
    None
}

#[cfg(windows)]
fn search_conventional_locations() -> Option<String> {
    if let Ok(appdata) = std::env::var("APPDATA") {
        let npm_path = PathBuf::from(&appdata).join("npm").join("claude.cmd");
        if npm_path.exists() {
            return Some(npm_path.to_string_lossy().to_string());
        }
    }
    let program_files = std::env::var("ProgramFiles").unwrap_or_else(|_| "C:\\Program Files".to_string());
    let pf_path = PathBuf::from(&program_files).join("nodejs").join("claude.cmd");
    if pf_path.exists() {
        return Some(pf_path.to_string_lossy().to_string());
    }
    None
}

#[cfg(not(windows))]
fn search_conventional_locations() -> Option<String> {
    if let Ok(home) = std::env::var("HOME") {
        let local_bin = PathBuf::from(&home).join(".local/bin/claude");
        if local_bin.exists() {
            return Some(local_bin.to_string_lossy().to_string());
        }

        let nvm_dir = PathBuf::from(&home).join(".nvm/versions/node");
        if let Ok(entries) = std::fs::read_dir(&nvm_dir) {
            for entry in entries.flatten() {
                let claude_path = entry.path().join("bin/claude");
                if claude_path.exists() {
                    return Some(claude_path.to_string_lossy().to_string());
                }
            }
        }
    }

    let usr_local = PathBuf::from("/usr/local/bin/claude");
    if usr_local.exists() {
        return Some(usr_local.to_string_lossy().to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins() {
        let explicit = PathBuf::from("/opt/custom/claude");
        assert_eq!(resolve_agent_binary(Some(&explicit)), "/opt/custom/claude");
    }

    #[test]
    fn resolves_to_some_claude_path_or_bare_name() {
        let resolved = resolve_agent_binary(None);
        assert!(resolved == "claude" || resolved == "claude.cmd" || resolved.ends_with("claude"));
    }
}
