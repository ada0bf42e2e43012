// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Reading and writing the node key file (hex-encoded secret).

use crate::crypto::NodeKey;
use crate::error::KeyError;
use std::path::Path;

/// Write the node key to a file as a hex-encoded secret.
pub fn write_node_key<P: AsRef<Path>>(key: &NodeKey, path: P) -> Result<(), KeyError> {
    let contents = key.secret_hex();
    std::fs::write(&path, contents.as_bytes())?;

    // Set restrictive permissions on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path.as_ref(), std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Read a node key written by `write_node_key`.
pub fn read_node_key<P: AsRef<Path>>(path: P) -> Result<NodeKey, KeyError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(KeyError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Key file not found: {:?}", path),
        )));
    }
    let contents = zeroize::Zeroizing::new(std::fs::read_to_string(path)?);
    NodeKey::from_hex(&contents)
}
