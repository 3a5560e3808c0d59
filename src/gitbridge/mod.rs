mod bridge;
mod objects;

pub use bridge::GitBridge;
pub use objects::{
    GitObject, ObjectKind, build_nested_trees, create_blob_object, create_commit_object,
    create_empty_pack, create_lfs_pointer, create_pack_file, flush_pkt, pkt_line,
};
