use std::path::{Path, PathBuf};

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SecretMaterial {
    pub secret: String,
    /// Where the secret came from: `env`, `file` or `generated`.
    pub source: String,
    pub file_path: PathBuf,
}

fn new_secret() -> String {
    format!("ag_{}", Uuid::new_v4().simple())
}

fn read_file_secret(path: &Path) -> Option<String> {
    let existing = std::fs::read_to_string(path).ok()?;
    let secret = existing.trim();
    if secret.is_empty() {
        None
    } else {
        Some(secret.to_string())
    }
}

fn write_file_secret(path: &Path, secret: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, secret)?;
    // Only the agent user may read the shared secret.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Resolution order: `BERTH_AGENT_SECRET`, then the secret file, then a
/// freshly generated secret persisted to the file so restarts keep the
/// same identity.
pub fn load_or_create_secret(file_path: &Path) -> anyhow::Result<SecretMaterial> {
    if let Ok(secret) = std::env::var("BERTH_AGENT_SECRET") {
        let secret = secret.trim().to_string();
        if !secret.is_empty() {
            return Ok(SecretMaterial {
                secret,
                source: "env".to_string(),
                file_path: file_path.to_path_buf(),
            });
        }
    }

    if let Some(secret) = read_file_secret(file_path) {
        return Ok(SecretMaterial {
            secret,
            source: "file".to_string(),
            file_path: file_path.to_path_buf(),
        });
    }

    let secret = new_secret();
    write_file_secret(file_path, &secret)?;
    Ok(SecretMaterial {
        secret,
        source: "generated".to_string(),
        file_path: file_path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_once_and_reuses_on_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("security").join("agent_secret");
        let first = load_or_create_secret(&path).expect("first load");
        assert_eq!(first.source, "generated");
        assert!(first.secret.starts_with("ag_"));

        let second = load_or_create_secret(&path).expect("second load");
        assert_eq!(second.source, "file");
        assert_eq!(second.secret, first.secret);
    }

    #[cfg(unix)]
    #[test]
    fn secret_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent_secret");
        load_or_create_secret(&path).expect("load");
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
