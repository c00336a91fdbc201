//! Crate-wide constants.

/// Application name, used for directory names and environment prefixes.
pub const APP_NAME: &str = "cellar";

/// Length of the truncated hex digest used for option fingerprints and object hashes.
pub const FINGERPRINT_LEN: usize = 12;

/// Receipt written into every keg after a successful install.
pub const INSTALL_RECEIPT: &str = "INSTALL_RECEIPT.json";

/// Directory (under the cellar of a formula) prefix for in-progress installs.
pub const STAGING_PREFIX: &str = ".staging-";

/// Name of the cellar directory beneath the prefix.
pub const CELLAR_DIR: &str = "Cellar";

/// Name of the opt alias directory beneath the prefix.
pub const OPT_DIR: &str = "opt";

/// `SOURCE_DATE_EPOCH` exported to builds (January 1, 1980 00:00:00 UTC).
pub const SOURCE_DATE_EPOCH: &str = "315532800";
