//! Path Resolution
//!
//! The local path of a transfer is built from a precedence list of
//! directory segments, most specific first:
//!
//! ```text
//!  gateway home                                               less specific
//!      ├──────────────────────────────┐
//!  agent root*                  gateway default in/out/tmp dir
//!      ├────────────────────┐
//!  rule dir           agent in/out/tmp dir*                   more specific
//!
//!  * server transfers only
//! ```
//!
//! The first non-empty leaf names the directory; roots then anchor it until
//! an absolute root is reached. Gateway home is always the last root.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::context::TransferContext;
use crate::model::TransferStep;

/// Suffix of a file still being received.
pub const PARTIAL_SUFFIX: &str = ".part";

/// One candidate directory of a precedence chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// A directory name, always relative to the next root.
    Leaf(&'a str),
    /// A directory anchoring the path built so far.
    Root(&'a str),
}

/// Build `file`'s path from a precedence chain.
///
/// Only the first non-empty leaf is used. Every non-empty root after it
/// prefixes the path; an absolute root ends the walk.
pub fn build_path(file: &str, segments: &[Segment<'_>]) -> PathBuf {
    let mut path = PathBuf::from(file);
    let mut has_leaf = false;

    for segment in segments {
        match *segment {
            Segment::Leaf(dir) => {
                if has_leaf || dir.is_empty() {
                    continue;
                }
                has_leaf = true;
                path = Path::new(dir.trim_start_matches('/')).join(path);
            }
            Segment::Root(dir) => {
                if dir.is_empty() {
                    continue;
                }
                let root = Path::new(dir);
                path = root.join(path);
                if root.is_absolute() {
                    break;
                }
            }
        }
    }
    path
}

/// Fill in the transfer's local and remote paths.
///
/// Does nothing once the transfer has left [`TransferStep::None`], so a
/// resumed transfer keeps the path it started with.
pub fn resolve_path(ctx: &mut TransferContext) {
    if ctx.transfer.step != TransferStep::None {
        return;
    }

    let src = ctx.transfer.src_filename.clone();
    let dest = ctx.transfer.dest_filename().to_string();
    set_file_paths(ctx, &src, &dest);
    ctx.transfer.step = TransferStep::Setup;
}

/// Recompute both paths after the file was renamed mid-transfer.
///
/// For a client transfer the new name applies to both sides; a server
/// transfer only renames its own side of the file.
pub fn rebuild_paths(ctx: &mut TransferContext, new_file: &str) {
    let (src, dest) = match (ctx.is_server(), ctx.rule.is_send) {
        (false, _) => (new_file.to_string(), new_file.to_string()),
        (true, true) => (new_file.to_string(), ctx.transfer.dest_filename().to_string()),
        (true, false) => (ctx.transfer.src_filename.clone(), new_file.to_string()),
    };

    ctx.transfer.local_path = PathBuf::new();
    ctx.transfer.remote_path.clear();
    set_file_paths(ctx, &src, &dest);
}

fn set_file_paths(ctx: &mut TransferContext, src: &str, dest: &str) {
    if ctx.transfer.remote_path.is_empty() {
        let file = if ctx.rule.is_send { dest } else { src };
        ctx.transfer.remote_path = join_remote(&ctx.rule.remote_dir, file);
    }

    if ctx.transfer.local_path.as_os_str().is_empty() {
        ctx.transfer.local_path = local_path(ctx, src, dest);
    }

    debug!(
        transfer_id = ctx.transfer.id,
        local_path = %ctx.transfer.local_path.display(),
        remote_path = %ctx.transfer.remote_path,
        "Transfer paths resolved"
    );
}

fn local_path(ctx: &TransferContext, src: &str, dest: &str) -> PathBuf {
    use Segment::{Leaf, Root};

    let rule = &ctx.rule;
    let paths = &ctx.paths;
    let home = paths.gateway_home.to_string_lossy();
    let partial = format!("{}{}", dest, PARTIAL_SUFFIX);

    match (ctx.local_agent(), rule.is_send) {
        (Some(agent), true) => build_path(
            src,
            &[
                Leaf(&rule.local_dir),
                Leaf(&agent.send_dir),
                Root(&agent.root_dir),
                Leaf(&paths.default_out_dir),
                Root(&home),
            ],
        ),
        (Some(agent), false) => build_path(
            &partial,
            &[
                Leaf(&rule.tmp_local_rcv_dir),
                Leaf(&rule.local_dir),
                Leaf(&agent.tmp_receive_dir),
                Leaf(&agent.receive_dir),
                Root(&agent.root_dir),
                Leaf(&paths.default_tmp_dir),
                Leaf(&paths.default_in_dir),
                Root(&home),
            ],
        ),
        (None, true) => build_path(
            src,
            &[
                Leaf(&rule.local_dir),
                Leaf(&paths.default_out_dir),
                Root(&home),
            ],
        ),
        (None, false) => build_path(
            &partial,
            &[
                Leaf(&rule.tmp_local_rcv_dir),
                Leaf(&rule.local_dir),
                Leaf(&paths.default_tmp_dir),
                Leaf(&paths.default_out_dir),
                Root(&home),
            ],
        ),
    }
}

/// Where a received file lands once its data is complete.
pub fn final_destination(ctx: &TransferContext) -> PathBuf {
    use Segment::{Leaf, Root};

    let rule = &ctx.rule;
    let paths = &ctx.paths;
    let home = paths.gateway_home.to_string_lossy();
    let dest = ctx.transfer.dest_filename();

    match ctx.local_agent() {
        Some(agent) => build_path(
            dest,
            &[
                Leaf(&rule.local_dir),
                Leaf(&agent.receive_dir),
                Root(&agent.root_dir),
                Leaf(&paths.default_in_dir),
                Root(&home),
            ],
        ),
        None => build_path(
            dest,
            &[
                Leaf(&rule.local_dir),
                Leaf(&paths.default_in_dir),
                Root(&home),
            ],
        ),
    }
}

fn join_remote(dir: &str, file: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", dir, file)
    }
}
