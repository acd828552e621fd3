// Text diffing and fuzzy patching for differential synchronization.
//
// `create_patch` turns two versions of a document into a self-delimiting
// patch text; `apply_patch` replays such a text onto a (possibly drifted)
// base, anchoring each hunk with fuzzy matching and reporting per-hunk
// success. Hunks that fail to anchor are skipped, never fatal; only a
// malformed patch text is an error.

pub mod myers;
pub mod patch;

pub use myers::{diff_main, DiffOp};
pub use patch::{
    apply_hunks, apply_patch, create_patch, hunks_to_text, hunks_from_text, make_hunks,
    PatchError, PatchHunk,
};
