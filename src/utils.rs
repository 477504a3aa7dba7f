//! Directory helpers
//!
//! - State: `~/.local/state/zonewall/` - audit log (XDG Base Directory spec)
//! - Restore files: `settings.restore_dir`, default `/var/lib/zonewall/rules`,
//!   with one sub-directory per network namespace
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use zonewall::utils::namespaced_dir;
//!
//! let base = Path::new("/var/lib/zonewall/rules");
//! assert_eq!(namespaced_dir(base, None), base);
//! assert_eq!(
//!     namespaced_dir(base, Some("blue")),
//!     Path::new("/var/lib/zonewall/rules/blue")
//! );
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "zonewall", "zonewall")
        .and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// Creates `dir` (and parents) readable only by the owner
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);
        builder.create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Restore file directory for an optional network namespace
pub fn namespaced_dir(base: &Path, netns: Option<&str>) -> PathBuf {
    match netns {
        Some(ns) => base.join(ns),
        None => base.to_path_buf(),
    }
}
