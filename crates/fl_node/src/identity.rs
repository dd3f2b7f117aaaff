//! Identity persistence for the node daemon.
//!
//! The 32-byte seed is stored hex-encoded in a file readable only by
//! the service user. On first start a fresh keypair is generated and
//! saved so the node's AID is stable across restarts.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use zeroize::Zeroizing;

use fl_crypto::KeyPair;

pub fn load_or_generate(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let hex_seed = Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading identity seed {}", path.display()))?,
        );
        let seed = Zeroizing::new(
            hex::decode(hex_seed.trim()).map_err(|e| anyhow!("invalid identity seed: {e}"))?,
        );
        return KeyPair::from_seed(&seed).map_err(|e| anyhow!("invalid identity seed: {e}"));
    }

    let keypair = KeyPair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let hex_seed = Zeroizing::new(hex::encode(keypair.secret_bytes()));
    std::fs::write(path, hex_seed.as_str())
        .with_context(|| format!("writing identity seed {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn seed_is_stable_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.seed");
        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn corrupt_seed_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.seed");
        std::fs::write(&path, "not hex at all").unwrap();
        assert!(load_or_generate(&path).is_err());
    }
}
