//! WireGuard key material on disk: generated once per node and reused
//! across restarts.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::command::CommandRunner;
use crate::error::Error;

/// If both `private_path` and `public_path` are already present, does
/// nothing; otherwise (re)generates the keypair and writes both files,
/// restricting their mode to `0660`. Either file missing triggers
/// regeneration, matching the original's independent presence check on
/// each file rather than gating solely on the private key.
pub fn ensure_keys(
    runner: &dyn CommandRunner,
    private_path: &str,
    public_path: &str,
) -> Result<(), Error> {
    if Path::new(private_path).exists() && Path::new(public_path).exists() {
        return Ok(());
    }
    runner
        .run_silent(
            "ensure_keys",
            &format!("wg genkey | tee {private_path} | wg pubkey > {public_path}"),
        )
        .map_err(|e| Error::Environment(format!("wg key generation tool unavailable: {e}")))?;
    for path in [private_path, public_path] {
        let permissions = std::fs::Permissions::from_mode(0o660);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

/// Reads and trims the public key file.
pub fn read_public_key(public_path: &str) -> Result<String, Error> {
    Ok(fs::read_to_string(public_path)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::mock::MockCommandRunner;

    #[test]
    fn ensure_keys_noop_when_both_files_present() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("private");
        let public = dir.path().join("public");
        fs::write(&private, "existing-key\n").unwrap();
        fs::write(&public, "existing-pub\n").unwrap();

        let runner = MockCommandRunner::new();
        ensure_keys(
            &runner,
            private.to_str().unwrap(),
            public.to_str().unwrap(),
        )
        .unwrap();
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn ensure_keys_regenerates_when_public_key_missing() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("private");
        let public = dir.path().join("public");
        fs::write(&private, "existing-key\n").unwrap();
        // public key deleted/never written: ensure_keys must not no-op.

        let runner = MockCommandRunner::new();
        let _ = ensure_keys(&runner, private.to_str().unwrap(), public.to_str().unwrap());
        assert!(!runner.commands().is_empty());
    }

    #[test]
    fn ensure_keys_surfaces_environment_error_on_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("private");
        let public = dir.path().join("public");
        let command = format!(
            "wg genkey | tee {} | wg pubkey > {}",
            private.display(),
            public.display()
        );
        let runner = MockCommandRunner::new().with_failure(&command, "wg: command not found");

        let err = ensure_keys(&runner, private.to_str().unwrap(), public.to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Environment(_)));
    }

    #[test]
    fn ensure_keys_shells_out_when_private_key_absent() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("private");
        let public = dir.path().join("public");

        let runner = MockCommandRunner::new();
        // The mock doesn't touch disk, so chmod'ing the (still-absent)
        // files afterward fails — that's expected here; this test only
        // asserts that the generate command was issued with the right
        // pipeline shape.
        let _ = ensure_keys(&runner, private.to_str().unwrap(), public.to_str().unwrap());
        assert!(runner.commands().iter().any(|c| c
            == format!(
                "wg genkey | tee {} | wg pubkey > {}",
                private.display(),
                public.display()
            )));
    }

    #[test]
    fn read_public_key_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let public = dir.path().join("public");
        fs::write(&public, "abcd1234=\n").unwrap();
        assert_eq!(read_public_key(public.to_str().unwrap()).unwrap(), "abcd1234=");
    }
}
