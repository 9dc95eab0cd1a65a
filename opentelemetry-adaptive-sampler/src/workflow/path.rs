//! Call-graph edge identity.
//!
//! A path id is 64 bits: the top 16 bits are a prefix derived from the root
//! edge and shared by every descendant, the low 48 bits hash the edge itself.
use fnv::FnvHasher;
use std::hash::Hasher;

const EDGE_BITS: u32 = 48;
const EDGE_MASK: u64 = (1 << EDGE_BITS) - 1;
const SEPARATOR: u8 = 0x1f;

fn non_zero(path: u64) -> u64 {
    // zero means "no path" on the wire
    if path == 0 {
        1
    } else {
        path
    }
}

fn fold_prefix(seed: u64) -> u64 {
    (seed ^ (seed >> 16) ^ (seed >> 32) ^ (seed >> 48)) & 0xffff
}

/// Path id of a root edge entered from `caller_service`/`caller_method`.
pub fn root_path(caller_service: &str, caller_method: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(caller_service.as_bytes());
    hasher.write_u8(SEPARATOR);
    hasher.write(caller_method.as_bytes());
    let seed = hasher.finish();
    non_zero((fold_prefix(seed) << EDGE_BITS) | (seed & EDGE_MASK))
}

/// Path id of the edge from `parent_path` into `callee_service`/`callee_method`.
pub fn child_path(parent_path: u64, callee_service: &str, callee_method: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(&parent_path.to_be_bytes());
    hasher.write_u8(SEPARATOR);
    hasher.write(callee_service.as_bytes());
    hasher.write_u8(SEPARATOR);
    hasher.write(callee_method.as_bytes());
    non_zero((parent_path & !EDGE_MASK) | (hasher.finish() & EDGE_MASK))
}

/// The root prefix shared by all paths of one workflow.
pub fn prefix(path: u64) -> u16 {
    (path >> EDGE_BITS) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descendants_share_the_root_prefix() {
        let root = root_path("gateway", "GET /checkout");
        let child = child_path(root, "cart", "Get");
        let grandchild = child_path(child, "inventory", "Reserve");
        assert_eq!(prefix(child), prefix(root));
        assert_eq!(prefix(grandchild), prefix(root));
        assert_ne!(child, grandchild);
    }

    #[test]
    fn hashing_is_deterministic() {
        let root = root_path("gateway", "GET /checkout");
        assert_eq!(root, root_path("gateway", "GET /checkout"));
        assert_eq!(child_path(root, "cart", "Get"), child_path(root, "cart", "Get"));
    }

    #[test]
    fn edge_identity_depends_on_every_component() {
        let root = root_path("gateway", "GET /checkout");
        let other_root = root_path("gateway", "GET /cart");
        assert_ne!(root, other_root);
        assert_ne!(child_path(root, "cart", "Get"), child_path(root, "cart", "Put"));
        assert_ne!(child_path(root, "cart", "Get"), child_path(root, "carts", "Get"));
        assert_ne!(
            child_path(root, "cart", "Get"),
            child_path(other_root, "cart", "Get")
        );
        assert_ne!(child_path(root, "ab", "c"), child_path(root, "a", "bc"));
    }

    #[test]
    fn paths_are_never_zero() {
        assert_ne!(root_path("", ""), 0);
        assert_ne!(child_path(0, "", ""), 0);
    }
}
