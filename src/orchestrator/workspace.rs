//! Host bookkeeping directories and the default extension payload.
//!
//! Each user gets a best-effort bookkeeping directory on the host and a
//! default set of extension content (agents/commands/skills/hooks/knowledge)
//! uploaded into fresh containers as a gzipped tar archive.

use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Resolves the host bookkeeping directory for a user.
pub fn user_workspace_dir(root: &Path, user_id: &str) -> PathBuf {
    root.join(user_id)
}

/// Shell glob matching the hook scripts inside the container.
pub const HOOK_SCRIPT_GLOB: &str = "hooks/*.sh";

/// Contents of the welcome file written into fresh workspaces.
pub const WELCOME_TEXT: &str = "\
# Welcome to your workspace

This container is yours: everything under /workspace persists across
restarts. Agent configuration lives in ~/.claude (agents, commands,
skills, hooks, knowledge).
";

const FILE_MODE: u32 = 0o644;
const SCRIPT_MODE: u32 = 0o755;

/// Default extension entries: (path, mode, contents).
fn default_entries() -> Vec<(&'static str, u32, &'static str)> {
    vec![
        (
            "agents/README.md",
            FILE_MODE,
            "Drop agent definitions here. Each markdown file describes one agent.\n",
        ),
        (
            "commands/README.md",
            FILE_MODE,
            "Custom slash commands. One markdown file per command.\n",
        ),
        (
            "skills/README.md",
            FILE_MODE,
            "Reusable skills. Each subdirectory holds one skill with its SKILL.md.\n",
        ),
        (
            "knowledge/README.md",
            FILE_MODE,
            "Project knowledge the assistant loads at session start.\n",
        ),
        (
            "hooks/post-create.sh",
            SCRIPT_MODE,
            "#!/bin/sh\n# Runs once after the workspace container is provisioned.\nexit 0\n",
        ),
        (
            "hooks/pre-session.sh",
            SCRIPT_MODE,
            "#!/bin/sh\n# Runs before each interactive session attaches.\nexit 0\n",
        ),
    ]
}

/// Builds the gzipped tar archive of default extension content.
///
/// Entry timestamps are zeroed so the archive is deterministic.
pub fn default_extension_archive() -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);

    for (path, mode, contents) in default_entries() {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(mode);
        header.set_mtime(0);
        header.set_cksum();
        archive.append_data(&mut header, path, contents.as_bytes())?;
    }

    let encoder = archive.into_inner()?;
    Ok(encoder.finish()?)
}
