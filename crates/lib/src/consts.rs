//! Constants shared across the engine.

/// Token repeated to pad the store directory to a fixed length.
pub const PATH_PADDING_CHARACTERS: &str = "bramble_store_padding";

/// Length of `{bramble_path}/{padding}/` on every installation.
pub const PATH_PADDING_LENGTH: usize = 50;

/// Fixed symbolic store path used in place of the local store path when
/// hashing outputs and shipping artifacts to a remote cache.
///
/// One character shorter than [`PATH_PADDING_LENGTH`] (no trailing slash),
/// the same length as every local store path, so it can replace one
/// byte-for-byte.
pub const BRAMBLE_PREFIX_OF_RECORD: &str = "/home/bramble/bramble/bramble_store_padding/bramb";

/// Prefix of every store-length temp dir and temp file.
pub const BUILD_DIR_PREFIX: &str = "bramble_build_directory";

/// Length of a content hash (base32 of 20 bytes) and of a temp dir name.
pub const HASH_LEN: usize = 32;

/// Environment variable overriding the bramble root.
pub const BRAMBLE_PATH_ENV: &str = "BRAMBLE_PATH";

/// Builtin builder that downloads a URL.
pub const BUILTIN_FETCH_URL: &str = "basic_fetch_url";

/// Builtin builder name reserved for git fetches.
pub const BUILTIN_FETCH_GIT: &str = "fetch_git";

/// Default output name.
pub const DEFAULT_OUTPUT: &str = "out";

/// Lockfile name written next to a project.
pub const LOCKFILE_NAME: &str = "bramble.lock";
