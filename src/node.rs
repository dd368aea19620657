use crate::bins::SliceMutExt;

/// Size of an encoded `(document id, gid)` node key.
pub const NODE_KEY_LEN: usize = 12;

/// Structural view of one stored XML document, supplied by the XML layer.
///
/// Node identifiers (gids) are assigned by the document's numbering scheme;
/// the engine only needs to walk upwards to a parent, downwards to a first
/// child, and to know how many children a serialized node carries.
pub trait Document {
    fn doc_id(&self) -> u32;

    /// The parent gid of `gid`; a value below 1 once the walk passes the
    /// document root.
    fn parent_id(&self, gid: i64) -> i64;

    /// The gid of the first child of `gid`, or a negative value if the
    /// node cannot have children.
    fn first_child_id(&self, gid: i64) -> i64;

    /// The number of children recorded in the serialized node `value`.
    fn child_count(&self, value: &[u8]) -> u64;
}

/// A lightweight reference to a node that may or may not be present in the
/// index; resolved to a storage address on demand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeProxy {
    pub gid: i64,
}

impl NodeProxy {
    pub fn new(gid: i64) -> Self {
        Self { gid }
    }
}

/// Encode the fixed-length B+-tree key for a node: the document id followed
/// by the gid, both big-endian, so keys of one document sort in document
/// order.
pub fn node_key(doc_id: u32, gid: i64) -> [u8; NODE_KEY_LEN] {
    let mut key = [0u8; NODE_KEY_LEN];
    key.write_u32(doc_id);
    key[4..].write_i64(gid);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_orders_by_document_then_gid() {
        let a = node_key(1, 5);
        let b = node_key(1, 6);
        let c = node_key(2, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_node_key_layout() {
        let key = node_key(0x01020304, 0x05060708090a0b0c);
        assert_eq!([1, 2, 3, 4], key[..4]);
        assert_eq!([5, 6, 7, 8, 9, 10, 11, 12], key[4..]);
    }
}
